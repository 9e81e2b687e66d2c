//! Built-in trigger actions and `{{path}}` message interpolation.

use std::sync::Arc;

use serde_json::Value;

use super::{Trigger, TriggerAction, TriggerEngine};
use crate::error::{CubeError, Result};
use crate::graph::Graph;
use crate::model::{EdgeType, NewNode, NodeType, NodeUpdate, Priority, Status, Validity};

/// Everything an action may consult while executing.
pub struct ActionContext<'a> {
    pub event: &'a crate::events::Event,
    pub trigger: &'a Trigger,
    pub graph: &'a Graph,
}

impl ActionContext<'_> {
    /// Interpolation scope: `{event, trigger, cube}`.
    fn scope(&self) -> Value {
        serde_json::json!({
            "event": self.event,
            "trigger": self.trigger,
            "cube": { "name": self.graph.config().name },
        })
    }

    fn render(&self, template: &str) -> String {
        interpolate(template, &self.scope())
    }
}

pub trait ActionHandler: Send + Sync {
    fn execute(&self, action: &TriggerAction, ctx: &ActionContext<'_>) -> Result<()>;
}

/// Delivery target for the `notify` action; hosts plug in their own.
pub trait Notifier: Send + Sync {
    fn notify(&self, target: &str, message: &str) -> Result<()>;
}

/// Default notifier: messages land on the diagnostic sink.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, target: &str, message: &str) -> Result<()> {
        tracing::info!(target: "cube::notify", to = target, "{message}");
        Ok(())
    }
}

/// Replace every `{{path.with.dots}}` with the value at that path in the
/// context. Missing paths pass through literally.
pub fn interpolate(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        match lookup(context, path) {
            Some(Value::String(s)) => out.push_str(&s),
            Some(value) => out.push_str(&value.to_string()),
            None => {
                out.push_str("{{");
                out.push_str(&after[..end]);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn lookup(context: &Value, path: &str) -> Option<Value> {
    let mut current = context;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

struct LogAction;

impl ActionHandler for LogAction {
    fn execute(&self, action: &TriggerAction, ctx: &ActionContext<'_>) -> Result<()> {
        let message = action.param_str("message").unwrap_or("(no message)");
        tracing::info!(
            target: "cube::triggers",
            trigger = %ctx.trigger.id,
            "{}",
            ctx.render(message)
        );
        Ok(())
    }
}

/// Hosts replace the default by re-registering `notify` with their own
/// `Notifier` behind this handler.
pub struct NotifyAction {
    pub notifier: Arc<dyn Notifier>,
}

impl ActionHandler for NotifyAction {
    fn execute(&self, action: &TriggerAction, ctx: &ActionContext<'_>) -> Result<()> {
        let target = action.param_str("target").unwrap_or("default");
        let message = action
            .param_str("message")
            .ok_or_else(|| CubeError::InvalidInput("notify requires 'message'".into()))?;
        self.notifier
            .notify(&ctx.render(target), &ctx.render(message))
    }
}

struct CreateNodeAction;

impl ActionHandler for CreateNodeAction {
    fn execute(&self, action: &TriggerAction, ctx: &ActionContext<'_>) -> Result<()> {
        let title = action
            .param_str("title")
            .ok_or_else(|| CubeError::InvalidInput("create_node requires 'title'".into()))?;
        let node_type = match action.param_str("node_type") {
            Some(raw) => raw.parse::<NodeType>()?,
            None => NodeType::Task,
        };
        let mut input = NewNode::new(node_type, ctx.render(title));
        if let Some(content) = action.param_str("content") {
            input.content = Some(ctx.render(content));
        }
        if let Some(priority) = action.param_str("priority") {
            input.priority = Some(priority.parse::<Priority>()?);
        }
        if let Some(Value::Array(tags)) = action.params.get("tags") {
            input.tags = tags
                .iter()
                .filter_map(|t| t.as_str().map(|s| s.to_string()))
                .collect();
        }
        input.created_by = Some(format!("trigger:{}", ctx.trigger.id));
        ctx.graph.create(input)?;
        Ok(())
    }
}

struct UpdateNodeAction;

impl ActionHandler for UpdateNodeAction {
    fn execute(&self, action: &TriggerAction, ctx: &ActionContext<'_>) -> Result<()> {
        let node_id = action
            .param_str("node_id")
            .ok_or_else(|| CubeError::InvalidInput("update_node requires 'node_id'".into()))?;
        let node_id = ctx.render(node_id);

        let mut update = NodeUpdate::default();
        if let Some(status) = action.param_str("status") {
            update.status = Some(status.parse::<Status>()?);
        }
        if let Some(validity) = action.param_str("validity") {
            update.validity = Some(validity.parse::<Validity>()?);
        }
        if let Some(priority) = action.param_str("priority") {
            update.priority = Some(priority.parse::<Priority>()?);
        }
        if let Some(title) = action.param_str("title") {
            update.title = Some(ctx.render(title));
        }
        if let Some(content) = action.param_str("content") {
            update.content = Some(ctx.render(content));
        }
        ctx.graph.update(&node_id, &update)?;
        Ok(())
    }
}

/// Mark every node documenting the target as stale.
struct InvalidateAction;

impl ActionHandler for InvalidateAction {
    fn execute(&self, action: &TriggerAction, ctx: &ActionContext<'_>) -> Result<()> {
        let node_id = match action.param_str("node_id") {
            Some(raw) => ctx.render(raw),
            None => ctx
                .event
                .node_id()
                .ok_or_else(|| {
                    CubeError::InvalidInput("invalidate requires a node in scope".into())
                })?
                .to_string(),
        };

        let documenters = ctx
            .graph
            .predecessors(&node_id, &[EdgeType::Documents])?;
        for documenter in documenters {
            let update = NodeUpdate {
                validity: Some(Validity::Stale),
                ..NodeUpdate::default()
            };
            ctx.graph.update(&documenter, &update)?;
        }
        Ok(())
    }
}

/// Install the built-in catalog on a freshly constructed engine.
pub(super) fn register_builtins(engine: &Arc<TriggerEngine>) {
    engine.register_action("log", Arc::new(LogAction));
    engine.register_action(
        "notify",
        Arc::new(NotifyAction {
            notifier: Arc::new(LogNotifier),
        }),
    );
    engine.register_action("create_node", Arc::new(CreateNodeAction));
    engine.register_action("update_node", Arc::new(UpdateNodeAction));
    engine.register_action("invalidate", Arc::new(InvalidateAction));
}
