use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CubeError, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::model::{EdgeType, NodeType};
use crate::store::lock;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: i64 = 30_000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Blocked,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Working => write!(f, "working"),
            Self::Blocked => write!(f, "blocked"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// What an agent is allowed to touch and how much it can take on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    pub node_types: Vec<NodeType>,
    pub edge_types: Vec<EdgeType>,
    pub tags: Vec<String>,
    pub max_concurrent: u32,
    pub can_create: bool,
    pub can_delete: bool,
    pub priority_boost: i64,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            node_types: vec![NodeType::Task],
            edge_types: vec![EdgeType::Implements, EdgeType::Blocks, EdgeType::DependsOn],
            tags: Vec::new(),
            max_concurrent: 1,
            can_create: false,
            can_delete: false,
            priority_boost: 0,
        }
    }
}

/// Per-field capability overrides merged over the defaults at registration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityOverrides {
    pub node_types: Option<Vec<NodeType>>,
    pub edge_types: Option<Vec<EdgeType>>,
    pub tags: Option<Vec<String>>,
    pub max_concurrent: Option<u32>,
    pub can_create: Option<bool>,
    pub can_delete: Option<bool>,
    pub priority_boost: Option<i64>,
}

impl CapabilityOverrides {
    fn merge(self) -> AgentCapabilities {
        let defaults = AgentCapabilities::default();
        AgentCapabilities {
            node_types: self.node_types.unwrap_or(defaults.node_types),
            edge_types: self.edge_types.unwrap_or(defaults.edge_types),
            tags: self.tags.unwrap_or(defaults.tags),
            max_concurrent: self.max_concurrent.unwrap_or(defaults.max_concurrent),
            can_create: self.can_create.unwrap_or(defaults.can_create),
            can_delete: self.can_delete.unwrap_or(defaults.can_delete),
            priority_boost: self.priority_boost.unwrap_or(defaults.priority_boost),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub description: String,
    pub capabilities: AgentCapabilities,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub completed: u64,
    pub failed: u64,
    pub avg_completion_ms: i64,
    pub last_active_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub status: AgentStatus,
    pub claimed_tasks: Vec<String>,
    pub stats: AgentStats,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_interval_ms: i64,
}

impl AgentState {
    fn fresh(now: DateTime<Utc>, heartbeat_interval_ms: i64) -> Self {
        Self {
            status: AgentStatus::Idle,
            claimed_tasks: Vec::new(),
            stats: AgentStats::default(),
            last_heartbeat: now,
            heartbeat_interval_ms,
        }
    }
}

/// Registration input: identity plus capability overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: CapabilityOverrides,
    pub heartbeat_interval_ms: Option<i64>,
}

/// Capability-based lookup filter.
#[derive(Debug, Default, Clone)]
pub struct CapabilityFilter {
    pub node_type: Option<NodeType>,
    pub tags: Vec<String>,
    pub role: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct AgentsFile {
    agents: Vec<AgentConfig>,
}

struct AgentEntry {
    config: AgentConfig,
    state: AgentState,
}

/// Persists agent configuration (`agents.json`) and per-agent runtime state
/// (`agent-state/<id>.json`); tracks heartbeats and staleness.
pub struct AgentRegistry {
    agents_file: PathBuf,
    state_dir: PathBuf,
    bus: Arc<EventBus>,
    entries: Mutex<HashMap<String, AgentEntry>>,
}

impl AgentRegistry {
    /// Load the registry from a workspace root, reading any persisted
    /// configs and their state files.
    pub fn open(root: &Path, bus: Arc<EventBus>) -> Result<Self> {
        let agents_file = root.join("agents.json");
        let state_dir = root.join("agent-state");
        fs::create_dir_all(&state_dir)?;

        let mut entries = HashMap::new();
        if agents_file.exists() {
            let data = fs::read_to_string(&agents_file)?;
            let parsed: AgentsFile = serde_json::from_str(&data)?;
            let now = Utc::now();
            for config in parsed.agents {
                let state = read_state(&state_dir, &config.id)?
                    .unwrap_or_else(|| AgentState::fresh(now, DEFAULT_HEARTBEAT_INTERVAL_MS));
                entries.insert(config.id.clone(), AgentEntry { config, state });
            }
        }

        Ok(Self {
            agents_file,
            state_dir,
            bus,
            entries: Mutex::new(entries),
        })
    }

    pub fn register(&self, spec: AgentSpec) -> Result<AgentConfig> {
        validate_agent_id(&spec.id)?;
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if entries.contains_key(&spec.id) {
            return Err(CubeError::AgentExists(spec.id));
        }

        let config = AgentConfig {
            id: spec.id.clone(),
            name: if spec.name.is_empty() {
                spec.id.clone()
            } else {
                spec.name
            },
            role: spec.role,
            description: spec.description,
            capabilities: spec.capabilities.merge(),
        };
        let heartbeat_interval = spec
            .heartbeat_interval_ms
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        let mut state = read_state(&self.state_dir, &config.id)?
            .unwrap_or_else(|| AgentState::fresh(Utc::now(), heartbeat_interval));
        state.heartbeat_interval_ms = heartbeat_interval;

        write_state(&self.state_dir, &config.id, &state)?;
        entries.insert(
            config.id.clone(),
            AgentEntry {
                config: config.clone(),
                state,
            },
        );
        self.persist_configs(&entries)?;
        drop(entries);

        self.bus.emit(Event::new(EventKind::AgentRegistered {
            agent_id: config.id.clone(),
        }));
        Ok(config)
    }

    pub fn unregister(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let entry = entries
            .get(id)
            .ok_or_else(|| CubeError::AgentNotFound(id.to_string()))?;
        if !entry.state.claimed_tasks.is_empty() {
            return Err(CubeError::AgentBusy(id.to_string()));
        }
        entries.remove(id);
        self.persist_configs(&entries)?;
        let state_path = self.state_dir.join(format!("{id}.json"));
        if state_path.exists() {
            fs::remove_file(state_path)?;
        }
        drop(entries);

        self.bus.emit(Event::new(EventKind::AgentUnregistered {
            agent_id: id.to_string(),
        }));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<(AgentConfig, AgentState)> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .get(id)
            .map(|e| (e.config.clone(), e.state.clone()))
            .ok_or_else(|| CubeError::AgentNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<AgentConfig> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        let mut configs: Vec<AgentConfig> = entries.values().map(|e| e.config.clone()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    pub fn set_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let from = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| CubeError::AgentNotFound(id.to_string()))?;
            let from = entry.state.status;
            entry.state.status = status;
            write_state(&self.state_dir, id, &entry.state)?;
            from
        };
        if from != status {
            self.bus.emit(Event::new(EventKind::AgentStatusChanged {
                agent_id: id.to_string(),
                from,
                to: status,
            }));
        }
        Ok(())
    }

    /// Record liveness: refreshes `lastHeartbeat` and `lastActiveAt`, and
    /// promotes an offline agent back to idle.
    pub fn heartbeat(&self, id: &str) -> Result<()> {
        let promoted = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| CubeError::AgentNotFound(id.to_string()))?;
            let now = Utc::now();
            entry.state.last_heartbeat = now;
            entry.state.stats.last_active_at = Some(now);
            let promoted = entry.state.status == AgentStatus::Offline;
            if promoted {
                entry.state.status = AgentStatus::Idle;
            }
            write_state(&self.state_dir, id, &entry.state)?;
            promoted
        };
        if promoted {
            self.bus.emit(Event::new(EventKind::AgentStatusChanged {
                agent_id: id.to_string(),
                from: AgentStatus::Offline,
                to: AgentStatus::Idle,
            }));
        }
        Ok(())
    }

    /// Record a claim; the agent moves to `working`.
    pub fn add_claimed_task(&self, id: &str, task_id: &str) -> Result<()> {
        let from = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| CubeError::AgentNotFound(id.to_string()))?;
            let from = entry.state.status;
            if !entry.state.claimed_tasks.iter().any(|t| t == task_id) {
                entry.state.claimed_tasks.push(task_id.to_string());
            }
            entry.state.status = AgentStatus::Working;
            entry.state.stats.last_active_at = Some(Utc::now());
            write_state(&self.state_dir, id, &entry.state)?;
            from
        };
        if from != AgentStatus::Working {
            self.bus.emit(Event::new(EventKind::AgentStatusChanged {
                agent_id: id.to_string(),
                from,
                to: AgentStatus::Working,
            }));
        }
        Ok(())
    }

    /// Release a claim, updating completion counters (and the running
    /// average when a duration is supplied). The agent returns to idle once
    /// its last claim is gone.
    pub fn remove_claimed_task(
        &self,
        id: &str,
        task_id: &str,
        completed: bool,
        completion_ms: Option<i64>,
    ) -> Result<()> {
        let became_idle = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| CubeError::AgentNotFound(id.to_string()))?;
            entry.state.claimed_tasks.retain(|t| t != task_id);
            if completed {
                if let Some(ms) = completion_ms {
                    let done = entry.state.stats.completed as i64;
                    entry.state.stats.avg_completion_ms =
                        (entry.state.stats.avg_completion_ms * done + ms) / (done + 1);
                }
                entry.state.stats.completed += 1;
            } else {
                entry.state.stats.failed += 1;
            }
            entry.state.stats.last_active_at = Some(Utc::now());
            let became_idle = entry.state.claimed_tasks.is_empty()
                && entry.state.status == AgentStatus::Working;
            if became_idle {
                entry.state.status = AgentStatus::Idle;
            }
            write_state(&self.state_dir, id, &entry.state)?;
            became_idle
        };
        if became_idle {
            self.bus.emit(Event::new(EventKind::AgentStatusChanged {
                agent_id: id.to_string(),
                from: AgentStatus::Working,
                to: AgentStatus::Idle,
            }));
        }
        Ok(())
    }

    /// Drop a claim without touching completion counters (requeue,
    /// reassignment, timeout sweeps).
    pub fn return_claimed_task(&self, id: &str, task_id: &str) -> Result<()> {
        let became_idle = {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| CubeError::AgentNotFound(id.to_string()))?;
            entry.state.claimed_tasks.retain(|t| t != task_id);
            let became_idle = entry.state.claimed_tasks.is_empty()
                && entry.state.status == AgentStatus::Working;
            if became_idle {
                entry.state.status = AgentStatus::Idle;
            }
            write_state(&self.state_dir, id, &entry.state)?;
            became_idle
        };
        if became_idle {
            self.bus.emit(Event::new(EventKind::AgentStatusChanged {
                agent_id: id.to_string(),
                from: AgentStatus::Working,
                to: AgentStatus::Idle,
            }));
        }
        Ok(())
    }

    /// Move agents whose heartbeat is older than the threshold to
    /// `offline`; returns the ids that flipped.
    pub fn check_stale(&self, threshold_ms: i64) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::milliseconds(threshold_ms);
        let mut stale = Vec::new();
        {
            let mut entries = self.entries.lock().expect("registry lock poisoned");
            for (id, entry) in entries.iter_mut() {
                if entry.state.status != AgentStatus::Offline && entry.state.last_heartbeat < cutoff
                {
                    entry.state.status = AgentStatus::Offline;
                    write_state(&self.state_dir, id, &entry.state)?;
                    stale.push(id.clone());
                }
            }
        }
        stale.sort();
        if !stale.is_empty() {
            self.bus.emit(Event::new(EventKind::AgentStale {
                agent_ids: stale.clone(),
            }));
        }
        Ok(stale)
    }

    /// Agents able to take the described work: online, below their
    /// concurrency cap, matching role and node type, and covering at least
    /// one required tag (an empty capability tag list is a generalist).
    /// Ranked by priority boost, then by how lightly loaded they are.
    pub fn find_capable(&self, filter: &CapabilityFilter) -> Vec<AgentConfig> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        let mut capable: Vec<(&AgentEntry, usize)> = entries
            .values()
            .filter(|e| e.state.status != AgentStatus::Offline)
            .filter(|e| e.state.claimed_tasks.len() < e.config.capabilities.max_concurrent as usize)
            .filter(|e| match &filter.role {
                Some(role) => &e.config.role == role,
                None => true,
            })
            .filter(|e| match filter.node_type {
                Some(node_type) => e.config.capabilities.node_types.contains(&node_type),
                None => true,
            })
            .filter(|e| {
                filter.tags.is_empty()
                    || e.config.capabilities.tags.is_empty()
                    || filter
                        .tags
                        .iter()
                        .any(|t| e.config.capabilities.tags.contains(t))
            })
            .map(|e| (e, e.state.claimed_tasks.len()))
            .collect();

        capable.sort_by(|(a, a_claims), (b, b_claims)| {
            b.config
                .capabilities
                .priority_boost
                .cmp(&a.config.capabilities.priority_boost)
                .then(a_claims.cmp(b_claims))
                .then(a.config.id.cmp(&b.config.id))
        });
        capable.into_iter().map(|(e, _)| e.config.clone()).collect()
    }

    pub fn claim_count(&self, id: &str) -> Result<usize> {
        Ok(self.get(id)?.1.claimed_tasks.len())
    }

    fn persist_configs(&self, entries: &HashMap<String, AgentEntry>) -> Result<()> {
        let mut agents: Vec<AgentConfig> = entries.values().map(|e| e.config.clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));

        let lock_file = lock::acquire(&self.agents_file.with_extension("json.lock"))?;
        let tmp = self.agents_file.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&AgentsFile { agents })?)?;
        fs::rename(&tmp, &self.agents_file)?;
        lock::release(lock_file)?;
        Ok(())
    }
}

fn validate_agent_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(CubeError::InvalidInput(format!(
            "invalid agent id '{id}' (expected ASCII alphanumeric/hyphen/underscore)"
        )));
    }
    Ok(())
}

fn read_state(state_dir: &Path, id: &str) -> Result<Option<AgentState>> {
    let path = state_dir.join(format!("{id}.json"));
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(&path)?;
    match serde_json::from_str(&data) {
        Ok(state) => Ok(Some(state)),
        Err(err) => {
            tracing::warn!(agent = id, error = %err, "corrupt agent state file; starting fresh");
            Ok(None)
        }
    }
}

fn write_state(state_dir: &Path, id: &str, state: &AgentState) -> Result<()> {
    fs::create_dir_all(state_dir)?;
    let lock_file = lock::acquire(&state_dir.join(format!("{id}.lock")))?;
    let tmp = state_dir.join(format!("{id}.json.tmp"));
    fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
    fs::rename(&tmp, state_dir.join(format!("{id}.json")))?;
    lock::release(lock_file)?;
    Ok(())
}
