pub mod actions;

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CubeError, Result};
use crate::events::{Event, EventBus, EventKind, EventLog};
use crate::graph::Graph;
use crate::model::{EdgeType, NodeType, Status, Validity};

pub use actions::{interpolate, ActionContext, ActionHandler, Notifier};

/// Direction of an edge-presence condition relative to the node in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionDirection {
    Out,
    In,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeCondition {
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub direction: ConditionDirection,
}

/// Declarative rule conditions — plain data, serializable alongside the
/// trigger in configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerConditions {
    pub node_type: Vec<NodeType>,
    pub status: Vec<Status>,
    pub validity: Vec<Validity>,
    /// All of these tags must be present on the node in scope.
    pub tags: Vec<String>,
    /// At least one of these.
    pub tags_any: Vec<String>,
    pub has_edge: Option<EdgeCondition>,
    /// Name of a host-registered predicate.
    pub custom: Option<String>,
}

impl TriggerConditions {
    fn needs_node(&self) -> bool {
        !self.node_type.is_empty()
            || !self.status.is_empty()
            || !self.validity.is_empty()
            || !self.tags.is_empty()
            || !self.tags_any.is_empty()
            || self.has_edge.is_some()
    }

    fn is_empty(&self) -> bool {
        !self.needs_node() && self.custom.is_none()
    }
}

/// One action invocation: a type tag plus free-form parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl TriggerAction {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// An event → condition → action rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Event types this rule listens to.
    pub events: Vec<String>,
    #[serde(default)]
    pub conditions: TriggerConditions,
    pub actions: Vec<TriggerAction>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub cooldown_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Trigger {
    pub fn new(id: impl Into<String>, name: impl Into<String>, events: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            events,
            conditions: TriggerConditions::default(),
            actions: Vec::new(),
            priority: 0,
            cooldown_ms: 0,
            last_fired_at: None,
        }
    }
}

type CustomCondition = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

thread_local! {
    /// Set while this thread is inside a dispatch pass. Events emitted by
    /// actions on the same thread are logged but never re-dispatched, so a
    /// rule cannot re-enter itself.
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Maps events onto actions by evaluating the rule table.
pub struct TriggerEngine {
    graph: Arc<Graph>,
    log: Arc<EventLog>,
    bus: Arc<EventBus>,
    rules: Mutex<Vec<Trigger>>,
    actions: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    conditions: RwLock<HashMap<String, CustomCondition>>,
}

impl TriggerEngine {
    /// Build an engine with the built-in action catalog registered.
    pub fn new(graph: Arc<Graph>, log: Arc<EventLog>, bus: Arc<EventBus>) -> Arc<Self> {
        let engine = Arc::new(Self {
            graph,
            log,
            bus,
            rules: Mutex::new(Vec::new()),
            actions: RwLock::new(HashMap::new()),
            conditions: RwLock::new(HashMap::new()),
        });
        actions::register_builtins(&engine);
        engine
    }

    /// Subscribe the engine to every event on the bus.
    pub fn attach(self: &Arc<Self>) -> String {
        let engine = Arc::clone(self);
        self.bus.subscribe("*", move |event| {
            engine.handle_event(event);
            Ok(())
        })
    }

    pub fn register_action(&self, action_type: &str, handler: Arc<dyn ActionHandler>) {
        self.actions
            .write()
            .expect("action catalog lock poisoned")
            .insert(action_type.to_string(), handler);
    }

    pub fn register_condition<F>(&self, tag: &str, predicate: F)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.conditions
            .write()
            .expect("condition table lock poisoned")
            .insert(tag.to_string(), Arc::new(predicate));
    }

    pub fn add_trigger(&self, trigger: Trigger) -> Result<()> {
        let mut rules = self.rules.lock().expect("rule table lock poisoned");
        if rules.iter().any(|t| t.id == trigger.id) {
            return Err(CubeError::InvalidInput(format!(
                "trigger '{}' already registered",
                trigger.id
            )));
        }
        rules.push(trigger);
        Ok(())
    }

    pub fn remove_trigger(&self, id: &str) -> bool {
        let mut rules = self.rules.lock().expect("rule table lock poisoned");
        let before = rules.len();
        rules.retain(|t| t.id != id);
        rules.len() != before
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.lock().expect("rule table lock poisoned");
        let rule = rules
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| CubeError::InvalidInput(format!("unknown trigger '{id}'")))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn list(&self) -> Vec<Trigger> {
        self.rules.lock().expect("rule table lock poisoned").clone()
    }

    /// Evaluate an event against the rule table. Returns the ids of the
    /// rules that fired. Also writes one event-log entry per event.
    pub fn handle_event(&self, event: &Event) -> Vec<String> {
        // Loop prevention: the engine's own emissions never dispatch.
        if matches!(
            event.kind,
            EventKind::TriggerFired { .. } | EventKind::TriggerError { .. }
        ) {
            return Vec::new();
        }

        let nested = IN_DISPATCH.with(|flag| flag.replace(true));
        if nested {
            // An action produced this event; record it without re-entering
            // the rule table.
            self.append_log(event, Vec::new());
            return Vec::new();
        }

        let activated = self.dispatch(event);
        IN_DISPATCH.with(|flag| flag.set(false));

        self.append_log(event, activated.clone());
        activated
    }

    fn dispatch(&self, event: &Event) -> Vec<String> {
        let mut snapshot = self.rules.lock().expect("rule table lock poisoned").clone();
        // Stable sort: ties keep insertion order.
        snapshot.sort_by_key(|t| std::cmp::Reverse(t.priority));

        let now = Utc::now();
        let mut activated = Vec::new();
        for rule in &snapshot {
            if !rule.enabled || !rule.events.iter().any(|t| t == event.event_type()) {
                continue;
            }
            if rule.cooldown_ms > 0 {
                if let Some(last) = rule.last_fired_at {
                    if now - last < Duration::milliseconds(rule.cooldown_ms) {
                        continue;
                    }
                }
            }
            if !self.conditions_met(rule, event) {
                continue;
            }

            let mut executed = Vec::new();
            for action in &rule.actions {
                let handler = {
                    let catalog = self.actions.read().expect("action catalog lock poisoned");
                    catalog.get(&action.action_type).cloned()
                };
                let Some(handler) = handler else {
                    tracing::warn!(
                        trigger = %rule.id,
                        action = %action.action_type,
                        "unknown action type; skipping"
                    );
                    continue;
                };
                let ctx = ActionContext {
                    event,
                    trigger: rule,
                    graph: &self.graph,
                };
                match handler.execute(action, &ctx) {
                    Ok(()) => executed.push(action.action_type.clone()),
                    Err(err) => {
                        tracing::warn!(
                            trigger = %rule.id,
                            action = %action.action_type,
                            error = %err,
                            "trigger action failed"
                        );
                        self.bus.emit(Event::new(EventKind::TriggerError {
                            trigger_id: rule.id.clone(),
                            action_type: action.action_type.clone(),
                            message: err.to_string(),
                        }));
                    }
                }
            }

            self.mark_fired(&rule.id, now);
            activated.push(rule.id.clone());
            self.bus.emit(Event::new(EventKind::TriggerFired {
                trigger_id: rule.id.clone(),
                trigger_name: rule.name.clone(),
                actions: executed,
                source_event_id: event.id.clone(),
            }));
        }
        activated
    }

    fn mark_fired(&self, id: &str, at: DateTime<Utc>) {
        let mut rules = self.rules.lock().expect("rule table lock poisoned");
        if let Some(rule) = rules.iter_mut().find(|t| t.id == id) {
            rule.last_fired_at = Some(at);
        }
    }

    fn conditions_met(&self, rule: &Trigger, event: &Event) -> bool {
        let conditions = &rule.conditions;
        if conditions.is_empty() {
            return true;
        }

        if let Some(tag) = &conditions.custom {
            let table = self.conditions.read().expect("condition table lock poisoned");
            match table.get(tag) {
                Some(predicate) => {
                    if !predicate(event) {
                        return false;
                    }
                }
                None => {
                    tracing::warn!(trigger = %rule.id, custom = %tag, "unknown custom condition");
                    return false;
                }
            }
        }

        if !conditions.needs_node() {
            return true;
        }
        let Some(node) = event.node_in_scope() else {
            return false;
        };

        if !conditions.node_type.is_empty() && !conditions.node_type.contains(&node.node_type) {
            return false;
        }
        if !conditions.status.is_empty() && !conditions.status.contains(&node.status) {
            return false;
        }
        if !conditions.validity.is_empty() && !conditions.validity.contains(&node.validity) {
            return false;
        }
        if !conditions.tags.iter().all(|t| node.tags.contains(t)) {
            return false;
        }
        if !conditions.tags_any.is_empty()
            && !conditions.tags_any.iter().any(|t| node.tags.contains(t))
        {
            return false;
        }
        if let Some(edge) = &conditions.has_edge {
            let present = match edge.direction {
                ConditionDirection::Out => {
                    node.edges.iter().any(|e| e.edge_type == edge.edge_type)
                }
                ConditionDirection::In => self
                    .graph
                    .predecessors(&node.id, &[edge.edge_type])
                    .map(|sources| !sources.is_empty())
                    .unwrap_or(false),
            };
            if !present {
                return false;
            }
        }
        true
    }

    fn append_log(&self, event: &Event, activated: Vec<String>) {
        if let Err(err) = self.log.append_event(event.clone(), activated) {
            tracing::warn!(error = %err, "failed to append event log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLogConfig;
    use crate::graph::GraphOptions;
    use crate::model::{NewNode, NodeUpdate};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        graph: Arc<Graph>,
        bus: Arc<EventBus>,
        log: Arc<EventLog>,
        engine: Arc<TriggerEngine>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let graph = Arc::new(
            Graph::init_with_bus(dir.path(), GraphOptions::default(), Some(bus.clone())).unwrap(),
        );
        let log = Arc::new(
            EventLog::open(&dir.path().join("events.log"), EventLogConfig::default()).unwrap(),
        );
        let engine = TriggerEngine::new(graph.clone(), log.clone(), bus.clone());
        engine.attach();
        Fixture {
            _dir: dir,
            graph,
            bus,
            log,
            engine,
        }
    }

    fn counting_action(hits: Arc<AtomicUsize>) -> Arc<dyn ActionHandler> {
        struct Counting(Arc<AtomicUsize>);
        impl ActionHandler for Counting {
            fn execute(&self, _action: &TriggerAction, _ctx: &ActionContext<'_>) -> Result<()> {
                self.0.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        }
        Arc::new(Counting(hits))
    }

    #[test]
    fn fires_on_matching_event_type() {
        let fx = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        fx.engine.register_action("count", counting_action(hits.clone()));

        let mut rule = Trigger::new("t1", "count creations", vec!["node.created".into()]);
        rule.actions = vec![TriggerAction::new("count")];
        fx.engine.add_trigger(rule).unwrap();

        fx.graph.create(NewNode::new(NodeType::Task, "Hit")).unwrap();
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);

        // Unrelated event types do not fire.
        fx.bus.emit(Event::new(EventKind::CodeFileChanged {
            path: "x.rs".into(),
        }));
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn duplicate_trigger_ids_are_rejected() {
        let fx = fixture();
        fx.engine
            .add_trigger(Trigger::new("t1", "one", vec!["node.created".into()]))
            .unwrap();
        let err = fx
            .engine
            .add_trigger(Trigger::new("t1", "two", vec!["node.created".into()]))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn disabled_rules_do_not_fire() {
        let fx = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        fx.engine.register_action("count", counting_action(hits.clone()));

        let mut rule = Trigger::new("t1", "off", vec!["node.created".into()]);
        rule.actions = vec![TriggerAction::new("count")];
        fx.engine.add_trigger(rule).unwrap();
        fx.engine.set_enabled("t1", false).unwrap();

        fx.graph.create(NewNode::new(NodeType::Task, "Quiet")).unwrap();
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn node_conditions_gate_firing() {
        let fx = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        fx.engine.register_action("count", counting_action(hits.clone()));

        let mut rule = Trigger::new("t1", "code only", vec!["node.created".into()]);
        rule.conditions.node_type = vec![NodeType::Code];
        rule.actions = vec![TriggerAction::new("count")];
        fx.engine.add_trigger(rule).unwrap();

        fx.graph.create(NewNode::new(NodeType::Task, "Not code")).unwrap();
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 0);

        fx.graph.create(NewNode::new(NodeType::Code, "Is code")).unwrap();
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn node_conditions_without_node_in_scope_reject() {
        let fx = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        fx.engine.register_action("count", counting_action(hits.clone()));

        let mut rule = Trigger::new("t1", "needs node", vec!["code.file_changed".into()]);
        rule.conditions.node_type = vec![NodeType::Code];
        rule.actions = vec![TriggerAction::new("count")];
        fx.engine.add_trigger(rule).unwrap();

        fx.bus.emit(Event::new(EventKind::CodeFileChanged {
            path: "x.rs".into(),
        }));
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn cooldown_limits_firing_rate() {
        let fx = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        fx.engine.register_action("count", counting_action(hits.clone()));

        let mut rule = Trigger::new("t1", "cooled", vec!["node.created".into()]);
        rule.cooldown_ms = 60_000;
        rule.actions = vec![TriggerAction::new("count")];
        fx.engine.add_trigger(rule).unwrap();

        for i in 0..5 {
            fx.graph
                .create(NewNode::new(NodeType::Task, format!("Storm {i}")))
                .unwrap();
        }
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn priority_orders_rule_evaluation() {
        let fx = fixture();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Recording(Arc<Mutex<Vec<String>>>);
        impl ActionHandler for Recording {
            fn execute(&self, _action: &TriggerAction, ctx: &ActionContext<'_>) -> Result<()> {
                self.0.lock().unwrap().push(ctx.trigger.id.clone());
                Ok(())
            }
        }
        fx.engine
            .register_action("record", Arc::new(Recording(order.clone())));

        let mut low = Trigger::new("low", "low", vec!["node.created".into()]);
        low.priority = 1;
        low.actions = vec![TriggerAction::new("record")];
        let mut high = Trigger::new("high", "high", vec!["node.created".into()]);
        high.priority = 10;
        high.actions = vec![TriggerAction::new("record")];
        fx.engine.add_trigger(low).unwrap();
        fx.engine.add_trigger(high).unwrap();

        fx.graph.create(NewNode::new(NodeType::Task, "Ordered")).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[test]
    fn failing_action_emits_trigger_error_and_continues() {
        let fx = fixture();
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        fx.bus.subscribe("trigger.error", move |_| {
            e.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });

        struct Failing;
        impl ActionHandler for Failing {
            fn execute(&self, _action: &TriggerAction, _ctx: &ActionContext<'_>) -> Result<()> {
                Err(CubeError::InvalidInput("nope".into()))
            }
        }
        fx.engine.register_action("fail", Arc::new(Failing));
        let hits = Arc::new(AtomicUsize::new(0));
        fx.engine.register_action("count", counting_action(hits.clone()));

        let mut failing = Trigger::new("bad", "fails", vec!["node.created".into()]);
        failing.priority = 10;
        failing.actions = vec![TriggerAction::new("fail")];
        let mut counting = Trigger::new("good", "counts", vec!["node.created".into()]);
        counting.actions = vec![TriggerAction::new("count")];
        fx.engine.add_trigger(failing).unwrap();
        fx.engine.add_trigger(counting).unwrap();

        fx.graph.create(NewNode::new(NodeType::Task, "Mixed")).unwrap();
        assert_eq!(errors.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn unknown_action_type_is_a_non_fatal_skip() {
        let fx = fixture();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        fx.bus.subscribe("trigger.fired", move |_| {
            f.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });

        let mut rule = Trigger::new("t1", "mystery", vec!["node.created".into()]);
        rule.actions = vec![TriggerAction::new("does_not_exist")];
        fx.engine.add_trigger(rule).unwrap();

        fx.graph.create(NewNode::new(NodeType::Task, "Skipped")).unwrap();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn actions_emitting_events_do_not_re_enter() {
        let fx = fixture();

        // A rule on node.created whose action creates another node would
        // loop forever without the re-entrancy guard.
        let mut rule = Trigger::new("spawner", "spawn", vec!["node.created".into()]);
        rule.actions = vec![TriggerAction::new("create_node")
            .with_param("title", serde_json::json!("Spawned child"))
            .with_param("node_type", serde_json::json!("concept"))];
        fx.engine.add_trigger(rule).unwrap();

        fx.graph.create(NewNode::new(NodeType::Task, "Seed")).unwrap();

        let stats = fx.graph.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_type["concept"], 1);
    }

    #[test]
    fn custom_conditions_are_consulted() {
        let fx = fixture();
        let hits = Arc::new(AtomicUsize::new(0));
        fx.engine.register_action("count", counting_action(hits.clone()));
        fx.engine.register_condition("only-titled-yes", |event| {
            event
                .node_in_scope()
                .map(|n| n.title.contains("yes"))
                .unwrap_or(false)
        });

        let mut rule = Trigger::new("t1", "custom", vec!["node.created".into()]);
        rule.conditions.custom = Some("only-titled-yes".into());
        rule.actions = vec![TriggerAction::new("count")];
        fx.engine.add_trigger(rule).unwrap();

        fx.graph.create(NewNode::new(NodeType::Task, "no match")).unwrap();
        fx.graph.create(NewNode::new(NodeType::Task, "yes match")).unwrap();
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn every_event_gets_one_log_entry_with_activated_ids() {
        let fx = fixture();
        let mut rule = Trigger::new("t1", "log rule", vec!["node.updated".into()]);
        rule.actions = vec![TriggerAction::new("log")
            .with_param("message", serde_json::json!("updated {{event.node.id}}"))];
        fx.engine.add_trigger(rule).unwrap();

        let node = fx.graph.create(NewNode::new(NodeType::Code, "Logged")).unwrap();
        fx.graph
            .update(
                &node.id,
                &NodeUpdate {
                    content: Some("changed".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let entries = fx.log.read_by_type("node.updated", 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].triggers_activated, vec!["t1"]);

        let created = fx.log.read_by_type("node.created", 10).unwrap();
        assert_eq!(created.len(), 1);
        assert!(created[0].triggers_activated.is_empty());
    }
}
