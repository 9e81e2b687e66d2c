//! Local, single-tenant knowledge-graph engine for coordinating
//! long-running work among humans and software agents.
//!
//! A *cube* is a workspace directory holding typed nodes (tasks, docs,
//! code refs, decisions, …) as human-editable files — the source of truth
//! — mirrored into a SQLite index for querying. On top of the storage core
//! sit an event bus and rotated event log, a trigger engine, an
//! agent/work-queue orchestrator, and a synthesis pipeline that extracts
//! candidate nodes from conversation text and source code.

pub mod agents;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod synthesis;
pub mod triggers;

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

pub use agents::{
    AgentCapabilities, AgentConfig, AgentRegistry, AgentSpec, AgentState, AgentStatus,
    CapabilityFilter,
};
pub use config::CubeConfig;
pub use error::{CubeError, Result};
pub use events::{Event, EventBus, EventKind, EventLog, EventLogConfig, LogEntry};
pub use graph::{
    CubeStats, Direction, Graph, GraphOptions, TraversalStep, TraverseOptions,
};
pub use model::{
    Edge, EdgeSpec, EdgeType, NewNode, Node, NodeType, NodeUpdate, Priority, Status, Validity,
};
pub use orchestrator::{Assignment, DispatchOptions, Orchestrator, OrchestratorConfig};
pub use queue::{ClaimRequest, EnqueueOptions, ReleaseRequest, WorkItem, WorkQueue, WorkStatus};
pub use store::index::{EdgeDirection, EdgeFilter, QueryOptions, SortDirection, SortField};
pub use synthesis::{PipelineOptions, SynthesisPipeline, SynthesisSource};
pub use triggers::{Trigger, TriggerAction, TriggerConditions, TriggerEngine};

/// Cooperative cancellation shared between a caller and a long operation
/// (`rebuild_index`, `dispatch`). Checked between per-node steps.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// Read-only catalog of the closed enums, for embedding shells.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TypeCatalog {
    pub node_types: Vec<&'static str>,
    pub statuses: Vec<&'static str>,
    pub validities: Vec<&'static str>,
    pub priorities: Vec<&'static str>,
    pub edge_types: Vec<&'static str>,
}

/// Enumerate every declared node type, status, validity, priority and edge
/// type.
pub fn types() -> TypeCatalog {
    TypeCatalog {
        node_types: NodeType::ALL.iter().map(|v| v.as_str()).collect(),
        statuses: Status::ALL.iter().map(|v| v.as_str()).collect(),
        validities: Validity::ALL.iter().map(|v| v.as_str()).collect(),
        priorities: Priority::ALL.iter().map(|v| v.as_str()).collect(),
        edge_types: EdgeType::ALL.iter().map(|v| v.as_str()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_catalog_is_complete() {
        let catalog = types();
        assert_eq!(catalog.node_types.len(), 12);
        assert_eq!(catalog.statuses.len(), 6);
        assert_eq!(catalog.validities.len(), 4);
        assert_eq!(catalog.priorities.len(), 4);
        assert_eq!(catalog.edge_types.len(), 16);
        assert!(catalog.node_types.contains(&"brainfart"));
        assert!(catalog.edge_types.contains(&"sourced-from"));
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
    }
}
