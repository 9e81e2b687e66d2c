use thiserror::Error;

#[derive(Debug, Error)]
pub enum CubeError {
    #[error("not a cube workspace (run init first)")]
    NotInitialized,

    #[error("cube already initialized in this directory")]
    AlreadyInitialized,

    #[error("workspace locked by another process: {0}")]
    Locked(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("edge {0} not found")]
    EdgeNotFound(String),

    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("work item for task {0} not found")]
    WorkItemNotFound(String),

    #[error("node id collision for '{0}'")]
    IdCollision(String),

    #[error("edge {0} already exists")]
    EdgeExists(String),

    #[error("agent '{0}' is already registered")]
    AgentExists(String),

    #[error("task {task} is already claimed by '{owner}'")]
    AlreadyClaimed { task: String, owner: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("malformed node file '{path}': {reason}")]
    MalformedNode { path: String, reason: String },

    #[error("agent '{agent}' at max concurrency ({max})")]
    AgentAtCapacity { agent: String, max: u32 },

    #[error("trigger '{trigger}' in cooldown for {remaining_ms}ms")]
    Cooldown { trigger: String, remaining_ms: i64 },

    #[error("claim on task {task} expired after {timeout_ms}ms")]
    ClaimExpired { task: String, timeout_ms: i64 },

    #[error("agent '{0}' still holds claims; release them before unregistering")]
    AgentBusy(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("index error: {0}")]
    Index(#[from] rusqlite::Error),
}

impl CubeError {
    pub fn malformed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedNode {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for each error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::AlreadyInitialized => "already_initialized",
            Self::Locked(_) => "locked",
            Self::NodeNotFound(_) => "node_not_found",
            Self::EdgeNotFound(_) => "edge_not_found",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::WorkItemNotFound(_) => "work_item_not_found",
            Self::IdCollision(_) => "id_collision",
            Self::EdgeExists(_) => "edge_exists",
            Self::AgentExists(_) => "agent_exists",
            Self::AlreadyClaimed { .. } => "already_claimed",
            Self::InvalidInput(_) => "invalid_input",
            Self::MalformedNode { .. } => "malformed_node",
            Self::AgentAtCapacity { .. } => "agent_at_capacity",
            Self::Cooldown { .. } => "cooldown",
            Self::ClaimExpired { .. } => "claim_expired",
            Self::AgentBusy(_) => "agent_busy",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Index(_) => "index_error",
        }
    }

    /// Process exit code for shells built on top: 2 for invalid
    /// arguments, 1 for any other application error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput(_) => 2,
            _ => 1,
        }
    }

    /// True for errors that signal a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NodeNotFound(_)
                | Self::EdgeNotFound(_)
                | Self::AgentNotFound(_)
                | Self::WorkItemNotFound(_)
        )
    }

    /// True for conflict-class errors (duplicate id, existing edge,
    /// already-claimed task, duplicate agent).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::IdCollision(_)
                | Self::EdgeExists(_)
                | Self::AgentExists(_)
                | Self::AlreadyClaimed { .. }
                | Self::Locked(_)
                | Self::AlreadyInitialized
        )
    }
}

pub type Result<T> = std::result::Result<T, CubeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CubeError::NotInitialized.code(), "not_initialized");
        assert_eq!(
            CubeError::NodeNotFound("task/x-000000".into()).code(),
            "node_not_found"
        );
        assert_eq!(
            CubeError::AlreadyClaimed {
                task: "t".into(),
                owner: "a".into()
            }
            .code(),
            "already_claimed"
        );
    }

    #[test]
    fn classification_helpers() {
        assert!(CubeError::NodeNotFound("x".into()).is_not_found());
        assert!(!CubeError::NodeNotFound("x".into()).is_conflict());
        assert!(CubeError::EdgeExists("e".into()).is_conflict());
        assert!(CubeError::AlreadyClaimed {
            task: "t".into(),
            owner: "a".into()
        }
        .is_conflict());
    }

    #[test]
    fn malformed_node_mentions_path_and_reason() {
        let err = CubeError::malformed("nodes/task/x.md", "missing header");
        let text = err.to_string();
        assert!(text.contains("nodes/task/x.md"));
        assert!(text.contains("missing header"));
    }
}
