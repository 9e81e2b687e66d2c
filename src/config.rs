use serde::{Deserialize, Serialize};

/// Default event-log rotation threshold, in bytes (10 MiB).
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Workspace configuration persisted as `cube.json`.
///
/// Field order is the on-disk key order; `serde_json` writes fields in
/// declaration order and never reorders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CubeConfig {
    pub version: u32,
    pub name: String,
    pub root_path: String,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl CubeConfig {
    pub fn new(name: impl Into<String>, root_path: impl Into<String>) -> Self {
        Self {
            version: 1,
            name: name.into(),
            root_path: root_path.into(),
            index: IndexConfig::default(),
            events: EventsConfig::default(),
            agents: AgentsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexConfig {
    pub rebuild_on_start: bool,
    pub fts_enabled: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            rebuild_on_start: true,
            fts_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsConfig {
    pub enabled: bool,
    pub max_log_size: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_log_size: DEFAULT_MAX_LOG_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    pub default_agent: Option<String>,
    pub auto_assign: bool,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_agent: None,
            auto_assign: false,
        }
    }
}
