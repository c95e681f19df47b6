use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use boardwright_core::domain::message::{ToolCallRequest, ToolCallResult};
use boardwright_core::domain::skill::Skill;

use crate::events::EventEmitter;
use crate::tools::{Tool, ToolContext, ToolRegistry, THINK_ACKNOWLEDGEMENT, THINK_TOOL_NAME};
use crate::usage::UsageAccumulator;

/// Executes non-gated tool calls for one skill. Failures of any kind become `ERROR:` data
/// for the model; nothing here aborts the loop.
pub struct ToolDispatcher<'a> {
    registry: &'a ToolRegistry,
    skill: &'a Skill,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(registry: &'a ToolRegistry, skill: &'a Skill) -> Self {
        Self { registry, skill }
    }

    /// A tool is reachable only when it is registered and offered by the skill.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if !self.skill.supports_tool(name) {
            return None;
        }
        self.registry.get(name)
    }

    pub async fn execute(
        &self,
        call: &ToolCallRequest,
        context: &ToolContext,
        emitter: &EventEmitter<'_>,
        usage: &mut UsageAccumulator,
    ) -> ToolCallResult {
        usage.record_tool_call();
        let tool = self.lookup(&call.name);

        if tool.is_some() && call.name == THINK_TOOL_NAME {
            let reasoning =
                call.input.get("reasoning").and_then(|value| value.as_str()).unwrap_or("");
            emitter.thinking(reasoning);
            tracing::debug!(
                event_name = "agent.tool.think",
                task_id = %context.task_id,
                tool_call_id = %call.id,
                "reasoning recorded"
            );
            return ToolCallResult::ok(call.id.clone(), THINK_ACKNOWLEDGEMENT);
        }

        emitter.tool_call(&call.name, &call.input);

        let result = match tool {
            None => ToolCallResult::error(call.id.clone(), format!("unknown tool {}", call.name)),
            Some(tool) => {
                let execution = AssertUnwindSafe(tool.execute(call.input.clone(), context));
                match execution.catch_unwind().await {
                    Ok(Ok(message)) => ToolCallResult::ok(call.id.clone(), message),
                    Ok(Err(error)) => ToolCallResult::error(call.id.clone(), format!("{error:#}")),
                    Err(payload) => ToolCallResult::error(
                        call.id.clone(),
                        format!("tool panicked: {}", panic_message(payload.as_ref())),
                    ),
                }
            }
        };

        tracing::info!(
            event_name = "agent.tool.dispatched",
            task_id = %context.task_id,
            tool_call_id = %call.id,
            tool_name = %call.name,
            success = result.success,
            "tool call resolved"
        );
        emitter.tool_result(&call.name, &result.message, result.success);
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
