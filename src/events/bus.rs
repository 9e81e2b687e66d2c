use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, LazyLock, Mutex};

use uuid::Uuid;

use super::Event;
use crate::error::Result;

/// Matches every event type.
pub const WILDCARD: &str = "*";

type Handler = Box<dyn Fn(&Event) -> Result<()> + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SubscribeOptions {
    /// Deliver at most one event, then drop the subscription.
    pub once: bool,
}

struct Subscription {
    id: String,
    /// `None` subscribes to every event type.
    event_type: Option<String>,
    once: bool,
    fired: AtomicBool,
    handler: Handler,
}

impl Subscription {
    fn matches(&self, event_type: &str) -> bool {
        match &self.event_type {
            Some(t) => t == event_type,
            None => true,
        }
    }
}

#[derive(Default)]
struct BusState {
    subscriptions: Vec<Arc<Subscription>>,
    paused: bool,
    queued: VecDeque<Event>,
}

/// In-process publish/subscribe. Delivery is synchronous and ordered:
/// exact-type subscribers in registration order, then wildcard subscribers.
/// Handler failures are logged and isolated; they never propagate to the
/// emitter.
#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event type, or `"*"` for all. Returns
    /// the subscription id.
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> String
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with(event_type, handler, SubscribeOptions::default())
    }

    pub fn subscribe_once<F>(&self, event_type: &str, handler: F) -> String
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with(event_type, handler, SubscribeOptions { once: true })
    }

    pub fn subscribe_with<F>(&self, event_type: &str, handler: F, opts: SubscribeOptions) -> String
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let sub = Arc::new(Subscription {
            id: id.clone(),
            event_type: (event_type != WILDCARD).then(|| event_type.to_string()),
            once: opts.once,
            fired: AtomicBool::new(false),
            handler: Box::new(handler),
        });
        self.state
            .lock()
            .expect("bus state lock poisoned")
            .subscriptions
            .push(sub);
        id
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut state = self.state.lock().expect("bus state lock poisoned");
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != subscription_id);
        state.subscriptions.len() != before
    }

    /// Deliver an event to every matching subscriber, returning after all
    /// handlers have settled. While paused, the event queues instead.
    pub fn emit(&self, event: Event) {
        let targets = {
            let mut state = self.state.lock().expect("bus state lock poisoned");
            if state.paused {
                state.queued.push_back(event);
                return;
            }
            snapshot_targets(&state, event.event_type())
        };
        self.deliver(&event, &targets);
    }

    /// Fire-and-forget delivery: identical ordering, but the caller is not
    /// promised anything about handler outcomes beyond logging.
    pub fn emit_sync(&self, event: Event) {
        self.emit(event);
    }

    fn deliver(&self, event: &Event, targets: &[Arc<Subscription>]) {
        let mut spent: Vec<String> = Vec::new();
        for sub in targets {
            if sub.once && sub.fired.swap(true, AtomicOrdering::SeqCst) {
                continue;
            }
            if let Err(err) = (sub.handler)(event) {
                tracing::warn!(
                    event_type = event.event_type(),
                    subscription = %sub.id,
                    error = %err,
                    "event handler failed"
                );
            }
            if sub.once {
                spent.push(sub.id.clone());
            }
        }
        if !spent.is_empty() {
            let mut state = self.state.lock().expect("bus state lock poisoned");
            state.subscriptions.retain(|s| !spent.contains(&s.id));
        }
    }

    /// Stop delivering; emitted events accumulate in an in-memory queue.
    pub fn pause(&self) {
        self.state.lock().expect("bus state lock poisoned").paused = true;
    }

    /// Resume delivery and drain queued events in FIFO order.
    pub fn resume(&self) {
        let drained: Vec<Event> = {
            let mut state = self.state.lock().expect("bus state lock poisoned");
            state.paused = false;
            state.queued.drain(..).collect()
        };
        for event in drained {
            self.emit(event);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().expect("bus state lock poisoned").paused
    }

    /// Number of subscriptions that would receive the given event type
    /// (all subscriptions when `None`).
    pub fn subscription_count(&self, event_type: Option<&str>) -> usize {
        let state = self.state.lock().expect("bus state lock poisoned");
        match event_type {
            Some(t) => state.subscriptions.iter().filter(|s| s.matches(t)).count(),
            None => state.subscriptions.len(),
        }
    }

    pub fn has_subscribers(&self, event_type: Option<&str>) -> bool {
        self.subscription_count(event_type) > 0
    }

    /// Drop every subscription and any queued events.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("bus state lock poisoned");
        state.subscriptions.clear();
        state.queued.clear();
    }
}

fn snapshot_targets(state: &BusState, event_type: &str) -> Vec<Arc<Subscription>> {
    let exact = state
        .subscriptions
        .iter()
        .filter(|s| s.event_type.as_deref() == Some(event_type));
    let wildcard = state.subscriptions.iter().filter(|s| s.event_type.is_none());
    exact.chain(wildcard).cloned().collect()
}

static DEFAULT_BUS: LazyLock<Mutex<Option<Arc<EventBus>>>> = LazyLock::new(|| Mutex::new(None));

/// The process-wide bus used when a caller does not supply one.
pub fn default_bus() -> Arc<EventBus> {
    let mut slot = DEFAULT_BUS.lock().expect("default bus lock poisoned");
    slot.get_or_insert_with(|| Arc::new(EventBus::new())).clone()
}

/// Replace the process-wide bus with a fresh one (test isolation).
pub fn reset_default_bus() {
    let mut slot = DEFAULT_BUS.lock().expect("default bus lock poisoned");
    *slot = None;
}
