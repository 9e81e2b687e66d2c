pub mod bus;
pub mod log;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::AgentStatus;
use crate::model::{Edge, Node, Status, Validity};

pub use bus::{default_bus, reset_default_bus, EventBus, SubscribeOptions};
pub use log::{EventLog, EventLogConfig, LogEntry, LogStats};

/// An immutable record of something that happened. The `kind` discriminator
/// doubles as the wire `type` tag subscribers match on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    /// The node this event is about, when the payload carries a full
    /// snapshot (creation, update, deletion).
    pub fn node_in_scope(&self) -> Option<&Node> {
        match &self.kind {
            EventKind::NodeCreated { node }
            | EventKind::NodeUpdated { node, .. }
            | EventKind::NodeDeleted { node } => Some(node),
            _ => None,
        }
    }

    /// The node id this event concerns, if any; used by log readers.
    pub fn node_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::NodeCreated { node }
            | EventKind::NodeUpdated { node, .. }
            | EventKind::NodeDeleted { node } => Some(&node.id),
            EventKind::NodeStatusChanged { node_id, .. }
            | EventKind::NodeValidityChanged { node_id, .. } => Some(node_id),
            EventKind::EdgeCreated { edge } | EventKind::EdgeDeleted { edge } => Some(&edge.from),
            EventKind::WorkEnqueued { task_id, .. }
            | EventKind::WorkClaimed { task_id, .. }
            | EventKind::WorkReleased { task_id, .. }
            | EventKind::WorkCompleted { task_id, .. }
            | EventKind::WorkFailed { task_id, .. }
            | EventKind::WorkExpired { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// Closed catalog of event variants; the serialized `type` field carries
/// the dotted name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "node.created")]
    NodeCreated { node: Node },
    #[serde(rename = "node.updated")]
    NodeUpdated {
        node: Node,
        /// Field name to `{from, to}` pairs for everything that moved.
        changes: serde_json::Map<String, serde_json::Value>,
    },
    #[serde(rename = "node.deleted")]
    NodeDeleted { node: Node },
    #[serde(rename = "node.status_changed")]
    NodeStatusChanged {
        node_id: String,
        from: Status,
        to: Status,
    },
    #[serde(rename = "node.validity_changed")]
    NodeValidityChanged {
        node_id: String,
        from: Validity,
        to: Validity,
    },
    #[serde(rename = "edge.created")]
    EdgeCreated { edge: Edge },
    #[serde(rename = "edge.deleted")]
    EdgeDeleted { edge: Edge },
    #[serde(rename = "code.file_changed")]
    CodeFileChanged { path: String },
    #[serde(rename = "agent.registered")]
    AgentRegistered { agent_id: String },
    #[serde(rename = "agent.unregistered")]
    AgentUnregistered { agent_id: String },
    #[serde(rename = "agent.status_changed")]
    AgentStatusChanged {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },
    #[serde(rename = "agent.stale")]
    AgentStale { agent_ids: Vec<String> },
    #[serde(rename = "cube.initialized")]
    CubeInitialized { name: String, root: String },
    #[serde(rename = "trigger.fired")]
    TriggerFired {
        trigger_id: String,
        trigger_name: String,
        actions: Vec<String>,
        source_event_id: String,
    },
    #[serde(rename = "trigger.error")]
    TriggerError {
        trigger_id: String,
        action_type: String,
        message: String,
    },
    #[serde(rename = "work.enqueued")]
    WorkEnqueued {
        task_id: String,
        item_id: String,
        priority: i64,
    },
    #[serde(rename = "work.claimed")]
    WorkClaimed { task_id: String, agent_id: String },
    #[serde(rename = "work.released")]
    WorkReleased {
        task_id: String,
        agent_id: String,
        reason: String,
    },
    #[serde(rename = "work.completed")]
    WorkCompleted { task_id: String, agent_id: String },
    #[serde(rename = "work.failed")]
    WorkFailed {
        task_id: String,
        agent_id: String,
        error: String,
    },
    #[serde(rename = "work.expired")]
    WorkExpired { task_id: String, agent_id: String },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NodeCreated { .. } => "node.created",
            Self::NodeUpdated { .. } => "node.updated",
            Self::NodeDeleted { .. } => "node.deleted",
            Self::NodeStatusChanged { .. } => "node.status_changed",
            Self::NodeValidityChanged { .. } => "node.validity_changed",
            Self::EdgeCreated { .. } => "edge.created",
            Self::EdgeDeleted { .. } => "edge.deleted",
            Self::CodeFileChanged { .. } => "code.file_changed",
            Self::AgentRegistered { .. } => "agent.registered",
            Self::AgentUnregistered { .. } => "agent.unregistered",
            Self::AgentStatusChanged { .. } => "agent.status_changed",
            Self::AgentStale { .. } => "agent.stale",
            Self::CubeInitialized { .. } => "cube.initialized",
            Self::TriggerFired { .. } => "trigger.fired",
            Self::TriggerError { .. } => "trigger.error",
            Self::WorkEnqueued { .. } => "work.enqueued",
            Self::WorkClaimed { .. } => "work.claimed",
            Self::WorkReleased { .. } => "work.released",
            Self::WorkCompleted { .. } => "work.completed",
            Self::WorkFailed { .. } => "work.failed",
            Self::WorkExpired { .. } => "work.expired",
        }
    }
}
