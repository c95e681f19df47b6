use boardwright_core::domain::execution::ConfirmationDecision;
use boardwright_core::domain::message::{
    unanswered_tool_calls, ToolCallId, ToolCallRequest, ToolResultBlock,
};
use boardwright_core::domain::task::{PendingConfirmation, Task, TaskStatus};
use boardwright_core::errors::UsageError;

use crate::dispatcher::ToolDispatcher;

pub const REJECTION_MESSAGE: &str =
    "The user rejected the proposed action. Please continue without performing that action.";

/// What a validated resume has to do: settle the decided call, then the rest of its turn.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumePlan {
    pub decision: ConfirmationDecision,
    pub decided: ToolCallRequest,
    pub remaining: Vec<ToolCallRequest>,
}

pub struct ConfirmationGate;

impl ConfirmationGate {
    /// Holds the call back when its tool is flagged for confirmation.
    pub fn intercept(
        dispatcher: &ToolDispatcher<'_>,
        call: &ToolCallRequest,
    ) -> Option<PendingConfirmation> {
        let tool = dispatcher.lookup(&call.name)?;
        if !tool.requires_confirmation() {
            return None;
        }

        Some(PendingConfirmation {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            input: call.input.clone(),
            prompt: tool.confirmation_prompt(&call.input),
        })
    }

    pub fn validate_resume(
        task: &Task,
        decision: ConfirmationDecision,
    ) -> Result<ResumePlan, UsageError> {
        let pending = match (&task.status, &task.pending_confirmation) {
            (TaskStatus::PendingConfirmation, Some(pending)) => pending,
            _ => {
                return Err(UsageError::NotAwaitingConfirmation {
                    task_id: task.id.0.clone(),
                    status: task.status,
                })
            }
        };

        if decision.tool_call_id() != &pending.tool_call_id {
            return Err(UsageError::StaleConfirmation {
                expected: pending.tool_call_id.clone(),
                given: decision.tool_call_id().clone(),
            });
        }

        let mut unanswered = unanswered_tool_calls(&task.message_history);
        let position = unanswered
            .iter()
            .position(|call| call.id == pending.tool_call_id)
            .ok_or_else(|| UsageError::HistoryMismatch(pending.tool_call_id.clone()))?;
        let decided = unanswered.remove(position);

        Ok(ResumePlan { decision, decided, remaining: unanswered })
    }

    pub fn rejection_block(tool_call_id: ToolCallId) -> ToolResultBlock {
        ToolResultBlock { tool_use_id: tool_call_id, content: REJECTION_MESSAGE.to_string() }
    }
}
