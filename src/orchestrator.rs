use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use crate::agents::{AgentRegistry, CapabilityFilter};
use crate::error::Result;
use crate::events::{EventBus, EventKind};
use crate::graph::Graph;
use crate::model::{NodeType, Status};
use crate::queue::{ClaimRequest, EnqueueOptions, WorkQueue};
use crate::store::index::QueryOptions;
use crate::CancelToken;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often stale agents are swept.
    pub staleness_interval_ms: u64,
    /// Heartbeat age beyond which an agent counts as stale.
    pub staleness_threshold_ms: i64,
    /// How often expired claims are swept.
    pub expiry_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            staleness_interval_ms: 60_000,
            staleness_threshold_ms: 90_000,
            expiry_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DispatchOptions {
    /// Restrict to one node type (tasks by default).
    pub node_type: Option<NodeType>,
    /// Restrict to tasks carrying all of these tags.
    pub tags: Vec<String>,
    /// Claim timeout applied to dispatched work.
    pub claim_timeout_ms: Option<i64>,
    /// Compute assignments without enqueueing or claiming.
    pub dry_run: bool,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: String,
    pub agent_id: String,
}

/// Wires the agent registry and the work queue to the event bus: pending
/// tasks auto-enqueue, maintenance timers sweep stale agents and expired
/// claims, and `dispatch` matches queued work to capable agents.
pub struct Orchestrator {
    graph: Arc<Graph>,
    registry: Arc<AgentRegistry>,
    queue: Arc<WorkQueue>,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
    stop: Arc<AtomicBool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<String>>,
}

impl Orchestrator {
    pub fn new(
        graph: Arc<Graph>,
        registry: Arc<AgentRegistry>,
        queue: Arc<WorkQueue>,
        bus: Arc<EventBus>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            graph,
            registry,
            queue,
            bus,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            timers: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe the auto-enqueue handlers: task nodes created pending, and
    /// task nodes whose status returns to pending.
    pub fn attach(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock().expect("subscription lock poisoned");

        let queue = self.queue.clone();
        subscriptions.push(self.bus.subscribe("node.created", move |event| {
            if let EventKind::NodeCreated { node } = &event.kind {
                if node.node_type == NodeType::Task && node.status == Status::Pending {
                    if let Err(err) = queue.enqueue(&node.id, EnqueueOptions::default()) {
                        tracing::warn!(task = %node.id, error = %err, "auto-enqueue failed");
                    }
                }
            }
            Ok(())
        }));

        let queue = self.queue.clone();
        subscriptions.push(self.bus.subscribe("node.status_changed", move |event| {
            if let EventKind::NodeStatusChanged { node_id, to, .. } = &event.kind {
                if *to == Status::Pending && node_id.starts_with("task/") {
                    if let Err(err) = queue.enqueue(node_id, EnqueueOptions::default()) {
                        tracing::warn!(task = %node_id, error = %err, "auto-enqueue failed");
                    }
                }
            }
            Ok(())
        }));
    }

    /// Start the staleness and expiry maintenance timers.
    pub fn start(self: &Arc<Self>) {
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        if !timers.is_empty() {
            return;
        }
        self.stop.store(false, AtomicOrdering::SeqCst);

        let stop = self.stop.clone();
        let registry = self.registry.clone();
        let queue = self.queue.clone();
        let interval = self.config.staleness_interval_ms;
        let threshold = self.config.staleness_threshold_ms;
        timers.push(std::thread::spawn(move || {
            while !sleep_until_stop(&stop, interval) {
                match registry.check_stale(threshold) {
                    Ok(stale) => {
                        for agent_id in stale {
                            if let Err(err) = queue.release_all_for(&agent_id, "timeout") {
                                tracing::warn!(agent = %agent_id, error = %err, "stale release failed");
                            }
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "staleness sweep failed"),
                }
            }
        }));

        let stop = self.stop.clone();
        let queue = self.queue.clone();
        let interval = self.config.expiry_interval_ms;
        timers.push(std::thread::spawn(move || {
            while !sleep_until_stop(&stop, interval) {
                if let Err(err) = queue.check_expired() {
                    tracing::warn!(error = %err, "expiry sweep failed");
                }
            }
        }));
    }

    /// Stop the timers and drop the bus subscriptions.
    pub fn stop(&self) {
        self.stop.store(true, AtomicOrdering::SeqCst);
        let handles: Vec<JoinHandle<()>> =
            self.timers.lock().expect("timer lock poisoned").drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        let subscriptions: Vec<String> = self
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .drain(..)
            .collect();
        for id in subscriptions {
            self.bus.unsubscribe(&id);
        }
    }

    /// Match pending tasks to capable agents. Dry-run computes the same
    /// assignments a real run would produce, with no side effects.
    pub fn dispatch(&self, options: &DispatchOptions) -> Result<Vec<Assignment>> {
        let query = QueryOptions {
            node_type: vec![options.node_type.unwrap_or(NodeType::Task)],
            status: vec![Status::Pending],
            tags: options.tags.clone(),
            ..QueryOptions::default()
        };
        let tasks = self.graph.query(&query, false)?;

        // Claims planned during this pass, so one agent is not over-assigned
        // before its registry state catches up (and so dry-run parity holds).
        let mut planned: HashMap<String, usize> = HashMap::new();
        let mut assignments = Vec::new();

        for task in tasks {
            if let Some(cancel) = &options.cancel {
                if cancel.is_cancelled() {
                    tracing::warn!("dispatch cancelled");
                    break;
                }
            }
            let filter = CapabilityFilter {
                node_type: Some(task.node_type),
                tags: task.tags.clone(),
                role: None,
            };
            let candidates = self.registry.find_capable(&filter);
            let chosen = candidates.into_iter().find(|agent| {
                let extra = planned.get(&agent.id).copied().unwrap_or(0);
                match self.registry.get(&agent.id) {
                    Ok((config, state)) => {
                        state.claimed_tasks.len() + extra
                            < config.capabilities.max_concurrent as usize
                    }
                    Err(_) => false,
                }
            });
            let Some(agent) = chosen else {
                continue;
            };

            if !options.dry_run {
                self.queue.enqueue(&task.id, EnqueueOptions::default())?;
                if let Err(err) = self.queue.claim(&ClaimRequest {
                    agent_id: agent.id.clone(),
                    task_id: task.id.clone(),
                    timeout_ms: options.claim_timeout_ms,
                }) {
                    tracing::warn!(task = %task.id, agent = %agent.id, error = %err, "dispatch claim failed");
                    continue;
                }
            }
            *planned.entry(agent.id.clone()).or_insert(0) += 1;
            assignments.push(Assignment {
                task_id: task.id,
                agent_id: agent.id,
            });
        }
        Ok(assignments)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop.store(true, AtomicOrdering::SeqCst);
    }
}

/// Sleep in short steps so a stop request interrupts promptly. Returns true
/// once stop is requested.
fn sleep_until_stop(stop: &AtomicBool, interval_ms: u64) -> bool {
    let step = StdDuration::from_millis(10);
    let mut waited = 0u64;
    while waited < interval_ms {
        if stop.load(AtomicOrdering::SeqCst) {
            return true;
        }
        std::thread::sleep(step);
        waited += 10;
    }
    stop.load(AtomicOrdering::SeqCst)
}
