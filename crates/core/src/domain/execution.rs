use serde::{Deserialize, Serialize};

use crate::domain::message::ToolCallId;
use crate::domain::skill::SkillId;
use crate::domain::task::{BoardId, CardId, PendingConfirmation, TaskId, UsageTotals, UserId};
use crate::errors::UsageError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartRequest {
    pub task_id: Option<TaskId>,
    pub skill_id: SkillId,
    pub user_id: UserId,
    pub card_id: Option<CardId>,
    pub board_id: Option<BoardId>,
    pub board_agent_id: Option<String>,
    pub input_message: Option<String>,
    pub max_iterations: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeRequest {
    pub task_id: TaskId,
    pub decision: ConfirmationDecision,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "tool_call_id", rename_all = "snake_case")]
pub enum ConfirmationDecision {
    Confirm(ToolCallId),
    Reject(ToolCallId),
}

impl ConfirmationDecision {
    /// Builds a decision from the two optional inbound fields; exactly one may be set.
    pub fn from_fields(
        confirmed: Option<String>,
        rejected: Option<String>,
    ) -> Result<Option<Self>, UsageError> {
        let confirmed = confirmed.filter(|value| !value.trim().is_empty());
        let rejected = rejected.filter(|value| !value.trim().is_empty());

        match (confirmed, rejected) {
            (Some(_), Some(_)) => Err(UsageError::ConflictingDecision),
            (Some(id), None) => Ok(Some(Self::Confirm(ToolCallId(id)))),
            (None, Some(id)) => Ok(Some(Self::Reject(ToolCallId(id)))),
            (None, None) => Ok(None),
        }
    }

    pub fn tool_call_id(&self) -> &ToolCallId {
        match self {
            Self::Confirm(id) | Self::Reject(id) => id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirm(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { output: String },
    Failed { error: String },
    Suspended { pending: PendingConfirmation },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub task_id: TaskId,
    pub outcome: RunOutcome,
    pub iteration_count: u32,
    pub usage: UsageTotals,
}
