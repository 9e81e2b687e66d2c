use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::error::{CubeError, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::graph::Graph;
use crate::model::{EdgeType, NodeUpdate, Priority, Status};

/// Base priority per node priority level.
fn base_priority(priority: Priority) -> i64 {
    match priority {
        Priority::Critical => 1000,
        Priority::High => 100,
        Priority::Normal => 10,
        Priority::Low => 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Queued,
    Claimed,
    Completed,
    Failed,
    Expired,
}

/// A queue entry referencing a task node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub task_id: String,
    pub priority: i64,
    pub added_at: DateTime<Utc>,
    pub preferred_agent: Option<String>,
    pub required_role: Option<String>,
    #[serde(default)]
    pub required_tags: Vec<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub timeout_ms: Option<i64>,
    pub status: WorkStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct EnqueueOptions {
    pub preferred_agent: Option<String>,
    pub required_role: Option<String>,
    pub required_tags: Vec<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub timeout_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub agent_id: String,
    pub task_id: String,
    pub timeout_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub agent_id: String,
    pub task_id: String,
    /// `completed` and `error` are terminal; anything else requeues.
    pub reason: String,
    pub new_status: Option<Status>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct WaitStats {
    pub samples: u64,
    pub avg_wait_ms: i64,
    pub max_wait_ms: i64,
}

/// Snapshot of the queue: live items split by state, terminal history,
/// and wait-time statistics.
#[derive(Debug, Default, Clone)]
pub struct QueueState {
    pub queued: Vec<WorkItem>,
    pub claimed: Vec<WorkItem>,
    pub terminal: Vec<WorkItem>,
    pub wait: WaitStats,
}

#[derive(Default)]
struct Inner {
    live: Vec<WorkItem>,
    terminal: Vec<WorkItem>,
    wait: WaitStats,
}

/// Priority work queue with exclusive claims. Claims and releases update
/// the agent registry and the task node through the graph facade.
pub struct WorkQueue {
    graph: Arc<Graph>,
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
}

impl WorkQueue {
    pub fn new(graph: Arc<Graph>, registry: Arc<AgentRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            graph,
            registry,
            bus,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Computed numeric priority: base by priority level, plus a due-date
    /// boost, plus a boost per outgoing `blocks` edge.
    fn compute_priority(&self, task_id: &str) -> Result<i64> {
        let node = self.graph.get(task_id)?;
        let base = base_priority(node.priority);
        let now = Utc::now();
        let due_boost = match node.due_at {
            Some(due) if due < now => 500,
            Some(due) if due < now + Duration::hours(24) => 200,
            Some(due) if due < now + Duration::hours(72) => 50,
            _ => 0,
        };
        let blocking_boost = 20 * node.edges_of_type(EdgeType::Blocks).count() as i64;
        Ok(base + due_boost + blocking_boost)
    }

    /// Idempotent by task id: re-enqueueing a live task returns the
    /// existing item untouched.
    pub fn enqueue(&self, task_id: &str, opts: EnqueueOptions) -> Result<WorkItem> {
        let priority = self.compute_priority(task_id)?;
        let item = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if let Some(existing) = inner.live.iter().find(|i| i.task_id == task_id) {
                return Ok(existing.clone());
            }
            let item = WorkItem {
                id: Uuid::new_v4().to_string(),
                task_id: task_id.to_string(),
                priority,
                added_at: Utc::now(),
                preferred_agent: opts.preferred_agent,
                required_role: opts.required_role,
                required_tags: opts.required_tags,
                deadline: opts.deadline,
                timeout_ms: opts.timeout_ms,
                status: WorkStatus::Queued,
                claimed_by: None,
                claimed_at: None,
                expires_at: None,
                completed_at: None,
                error: None,
            };
            inner.live.push(item.clone());
            item
        };
        self.bus.emit(Event::new(EventKind::WorkEnqueued {
            task_id: item.task_id.clone(),
            item_id: item.id.clone(),
            priority: item.priority,
        }));
        Ok(item)
    }

    /// Best queued item this agent can take: preferred-agent, role and tag
    /// constraints respected, highest computed priority first.
    pub fn get_next_for(&self, agent_id: &str) -> Result<Option<WorkItem>> {
        let (config, _) = self.registry.get(agent_id)?;
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut candidates: Vec<&WorkItem> = inner
            .live
            .iter()
            .filter(|i| i.status == WorkStatus::Queued)
            .filter(|i| match &i.preferred_agent {
                Some(preferred) => preferred == agent_id,
                None => true,
            })
            .filter(|i| match &i.required_role {
                Some(role) => &config.role == role,
                None => true,
            })
            .filter(|i| {
                i.required_tags.is_empty()
                    || config.capabilities.tags.is_empty()
                    || i.required_tags
                        .iter()
                        .any(|t| config.capabilities.tags.contains(t))
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.added_at.cmp(&b.added_at))
        });
        Ok(candidates.first().map(|i| (*i).clone()))
    }

    /// Exclusive claim. Exactly one of two racing claims can succeed; the
    /// loser sees a conflict. Side effects: agent gains the claim, the task
    /// node moves to `claimed` with assignment and lock set.
    pub fn claim(&self, request: &ClaimRequest) -> Result<WorkItem> {
        let (config, state) = self.registry.get(&request.agent_id)?;
        if state.claimed_tasks.len() >= config.capabilities.max_concurrent as usize {
            return Err(CubeError::AgentAtCapacity {
                agent: request.agent_id.clone(),
                max: config.capabilities.max_concurrent,
            });
        }

        let item = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let item = inner
                .live
                .iter_mut()
                .find(|i| i.task_id == request.task_id)
                .ok_or_else(|| CubeError::WorkItemNotFound(request.task_id.clone()))?;
            match item.status {
                WorkStatus::Queued => {}
                WorkStatus::Claimed => {
                    return Err(CubeError::AlreadyClaimed {
                        task: request.task_id.clone(),
                        owner: item.claimed_by.clone().unwrap_or_default(),
                    })
                }
                _ => return Err(CubeError::WorkItemNotFound(request.task_id.clone())),
            }

            let now = Utc::now();
            item.status = WorkStatus::Claimed;
            item.claimed_by = Some(request.agent_id.clone());
            item.claimed_at = Some(now);
            let timeout = request.timeout_ms.or(item.timeout_ms);
            item.timeout_ms = timeout;
            item.expires_at = timeout.map(|ms| now + Duration::milliseconds(ms));

            let wait_ms = (now - item.added_at).num_milliseconds();
            let snapshot = item.clone();
            let samples = inner.wait.samples as i64;
            inner.wait.avg_wait_ms =
                (inner.wait.avg_wait_ms * samples + wait_ms) / (samples + 1);
            inner.wait.samples += 1;
            inner.wait.max_wait_ms = inner.wait.max_wait_ms.max(wait_ms);
            snapshot
        };

        if let Err(err) = self.apply_claim_side_effects(&request.agent_id, &request.task_id) {
            // Roll the item back so the queue and the graph stay coherent.
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if let Some(item) = inner.live.iter_mut().find(|i| i.task_id == request.task_id) {
                item.status = WorkStatus::Queued;
                item.claimed_by = None;
                item.claimed_at = None;
                item.expires_at = None;
            }
            return Err(err);
        }

        self.bus.emit(Event::new(EventKind::WorkClaimed {
            task_id: request.task_id.clone(),
            agent_id: request.agent_id.clone(),
        }));
        Ok(item)
    }

    fn apply_claim_side_effects(&self, agent_id: &str, task_id: &str) -> Result<()> {
        self.registry.add_claimed_task(agent_id, task_id)?;
        let update = NodeUpdate {
            status: Some(Status::Claimed),
            assigned_to: Some(Some(agent_id.to_string())),
            locked_by: Some(Some(agent_id.to_string())),
            ..NodeUpdate::default()
        };
        if let Err(err) = self.graph.update(task_id, &update) {
            let _ = self.registry.return_claimed_task(agent_id, task_id);
            return Err(err);
        }
        Ok(())
    }

    /// Release a claim. `completed` and `error` are terminal; any other
    /// reason puts the item back in the queue with its claim fields reset.
    /// Only the owning agent may release.
    pub fn release(&self, request: &ReleaseRequest) -> Result<WorkItem> {
        let (item, duration_ms) = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let pos = inner
                .live
                .iter()
                .position(|i| i.task_id == request.task_id)
                .ok_or_else(|| CubeError::WorkItemNotFound(request.task_id.clone()))?;
            let owner = inner.live[pos].claimed_by.clone().unwrap_or_default();
            if inner.live[pos].status != WorkStatus::Claimed || owner != request.agent_id {
                return Err(CubeError::AlreadyClaimed {
                    task: request.task_id.clone(),
                    owner,
                });
            }

            let now = Utc::now();
            let duration_ms = inner.live[pos]
                .claimed_at
                .map(|t| (now - t).num_milliseconds());

            match request.reason.as_str() {
                "completed" => {
                    let mut item = inner.live.remove(pos);
                    item.status = WorkStatus::Completed;
                    item.completed_at = Some(now);
                    inner.terminal.push(item.clone());
                    (item, duration_ms)
                }
                "error" => {
                    let mut item = inner.live.remove(pos);
                    item.status = WorkStatus::Failed;
                    item.completed_at = Some(now);
                    item.error = request.error.clone();
                    inner.terminal.push(item.clone());
                    (item, duration_ms)
                }
                _ => {
                    let item = &mut inner.live[pos];
                    item.status = WorkStatus::Queued;
                    item.claimed_by = None;
                    item.claimed_at = None;
                    item.expires_at = None;
                    (item.clone(), duration_ms)
                }
            }
        };

        match item.status {
            WorkStatus::Completed => {
                self.registry.remove_claimed_task(
                    &request.agent_id,
                    &request.task_id,
                    true,
                    duration_ms,
                )?;
                let update = NodeUpdate {
                    status: Some(request.new_status.unwrap_or(Status::Complete)),
                    locked_by: Some(None),
                    ..NodeUpdate::default()
                };
                self.graph.update(&request.task_id, &update)?;
                self.bus.emit(Event::new(EventKind::WorkCompleted {
                    task_id: request.task_id.clone(),
                    agent_id: request.agent_id.clone(),
                }));
            }
            WorkStatus::Failed => {
                self.registry
                    .remove_claimed_task(&request.agent_id, &request.task_id, false, None)?;
                let update = NodeUpdate {
                    status: Some(request.new_status.unwrap_or(Status::Pending)),
                    assigned_to: Some(None),
                    locked_by: Some(None),
                    ..NodeUpdate::default()
                };
                self.graph.update(&request.task_id, &update)?;
                self.bus.emit(Event::new(EventKind::WorkFailed {
                    task_id: request.task_id.clone(),
                    agent_id: request.agent_id.clone(),
                    error: request.error.clone().unwrap_or_default(),
                }));
            }
            _ => {
                self.registry
                    .return_claimed_task(&request.agent_id, &request.task_id)?;
                let update = NodeUpdate {
                    status: Some(Status::Pending),
                    assigned_to: Some(None),
                    locked_by: Some(None),
                    ..NodeUpdate::default()
                };
                self.graph.update(&request.task_id, &update)?;
            }
        }

        self.bus.emit(Event::new(EventKind::WorkReleased {
            task_id: request.task_id.clone(),
            agent_id: request.agent_id.clone(),
            reason: request.reason.clone(),
        }));
        Ok(item)
    }

    /// Reassign a claimed task: release with reason `reassign`, then claim
    /// for the new agent.
    pub fn transfer(&self, from_agent: &str, to_agent: &str, task_id: &str) -> Result<WorkItem> {
        let released = self.release(&ReleaseRequest {
            agent_id: from_agent.to_string(),
            task_id: task_id.to_string(),
            reason: "reassign".to_string(),
            new_status: None,
            error: None,
        })?;
        self.claim(&ClaimRequest {
            agent_id: to_agent.to_string(),
            task_id: task_id.to_string(),
            timeout_ms: released.timeout_ms,
        })
    }

    /// Release every claimed item whose claim has outlived its timeout.
    pub fn check_expired(&self) -> Result<Vec<WorkItem>> {
        let now = Utc::now();
        let expired: Vec<(String, String)> = {
            let inner = self.inner.lock().expect("queue lock poisoned");
            inner
                .live
                .iter()
                .filter(|i| i.status == WorkStatus::Claimed)
                .filter(|i| i.expires_at.map(|e| e <= now).unwrap_or(false))
                .map(|i| (i.task_id.clone(), i.claimed_by.clone().unwrap_or_default()))
                .collect()
        };

        let mut released = Vec::new();
        for (task_id, agent_id) in expired {
            let item = self.release(&ReleaseRequest {
                agent_id: agent_id.clone(),
                task_id: task_id.clone(),
                reason: "timeout".to_string(),
                new_status: None,
                error: None,
            })?;
            self.bus.emit(Event::new(EventKind::WorkExpired {
                task_id,
                agent_id,
            }));
            released.push(item);
        }
        Ok(released)
    }

    /// Release every claim held by the given agent (used when an agent goes
    /// stale).
    pub fn release_all_for(&self, agent_id: &str, reason: &str) -> Result<Vec<WorkItem>> {
        let held: Vec<String> = {
            let inner = self.inner.lock().expect("queue lock poisoned");
            inner
                .live
                .iter()
                .filter(|i| {
                    i.status == WorkStatus::Claimed && i.claimed_by.as_deref() == Some(agent_id)
                })
                .map(|i| i.task_id.clone())
                .collect()
        };
        let mut released = Vec::new();
        for task_id in held {
            released.push(self.release(&ReleaseRequest {
                agent_id: agent_id.to_string(),
                task_id,
                reason: reason.to_string(),
                new_status: None,
                error: None,
            })?);
        }
        Ok(released)
    }

    pub fn get_state(&self) -> QueueState {
        let inner = self.inner.lock().expect("queue lock poisoned");
        QueueState {
            queued: inner
                .live
                .iter()
                .filter(|i| i.status == WorkStatus::Queued)
                .cloned()
                .collect(),
            claimed: inner
                .live
                .iter()
                .filter(|i| i.status == WorkStatus::Claimed)
                .cloned()
                .collect(),
            terminal: inner.terminal.clone(),
            wait: inner.wait.clone(),
        }
    }

    pub fn get_queued(&self) -> Vec<WorkItem> {
        self.get_state().queued
    }

    pub fn get_claimed(&self, agent_id: Option<&str>) -> Vec<WorkItem> {
        self.get_state()
            .claimed
            .into_iter()
            .filter(|i| match agent_id {
                Some(agent) => i.claimed_by.as_deref() == Some(agent),
                None => true,
            })
            .collect()
    }

    pub fn find_by_task(&self, task_id: &str) -> Option<WorkItem> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .live
            .iter()
            .find(|i| i.task_id == task_id)
            .cloned()
    }

    /// Drop terminal entries older than the given age. Returns how many
    /// were collected.
    pub fn cleanup(&self, older_than_ms: i64) -> usize {
        let cutoff = Utc::now() - Duration::milliseconds(older_than_ms);
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let before = inner.terminal.len();
        inner
            .terminal
            .retain(|i| i.completed_at.map(|t| t > cutoff).unwrap_or(true));
        before - inner.terminal.len()
    }
}
