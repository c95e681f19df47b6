use thiserror::Error;

use crate::domain::message::ToolCallId;
use crate::domain::task::TaskStatus;
use crate::flows::LifecycleError;

/// Bad input to the orchestrator. Always raised before any model call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("task `{0}` was not found")]
    UnknownTask(String),
    #[error("skill `{0}` was not found")]
    UnknownSkill(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("confirmedToolCallId and rejectedToolCallId are mutually exclusive")]
    ConflictingDecision,
    #[error("task `{task_id}` is {status:?}, not awaiting confirmation")]
    NotAwaitingConfirmation { task_id: String, status: TaskStatus },
    #[error("tool call `{given}` is not the pending confirmation (expected `{expected}`)")]
    StaleConfirmation { expected: ToolCallId, given: ToolCallId },
    #[error("persisted history no longer has tool call `{0}` unanswered")]
    HistoryMismatch(ToolCallId),
    #[error("task `{0}` already exists")]
    DuplicateTask(String),
    #[error("max_iterations must be in range 1..={max}, got {given}")]
    InvalidMaxIterations { given: u32, max: u32 },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("task storage failed: {0}")]
    Persistence(String),
}

/// Coarse classification shared by every outward surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    Unavailable,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::BadRequest => "bad request",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Unavailable => "service unavailable",
        }
    }

    /// Text safe to show a caller without leaking internals.
    pub fn public_message(self) -> &'static str {
        match self {
            Self::BadRequest => "The request was rejected. Check the fields and try again.",
            Self::NotFound => "The requested task or skill does not exist.",
            Self::Conflict => "The task is already being processed. Retry once it settles.",
            Self::Unavailable => "Task storage is unavailable. Retry shortly.",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}: {}", .kind.label(), .message)]
pub struct InterfaceError {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: String,
}

impl InterfaceError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self { kind, message: message.into(), correlation_id: correlation_id.into() }
    }
}

impl ApplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Usage(UsageError::UnknownTask(_) | UsageError::UnknownSkill(_)) => {
                ErrorKind::NotFound
            }
            Self::Usage(UsageError::DuplicateTask(_)) => ErrorKind::Conflict,
            Self::Usage(_) | Self::Lifecycle(_) => ErrorKind::BadRequest,
            Self::Persistence(_) => ErrorKind::Unavailable,
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        InterfaceError::new(self.kind(), self.to_string(), correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::message::ToolCallId;
    use crate::domain::task::TaskStatus;
    use crate::errors::{ApplicationError, ErrorKind, UsageError};
    use crate::flows::{LifecycleError, TaskEvent};

    #[test]
    fn stale_confirmation_keeps_both_ids_in_the_message() {
        let error = ApplicationError::from(UsageError::StaleConfirmation {
            expected: ToolCallId("toolu_1".to_owned()),
            given: ToolCallId("toolu_9".to_owned()),
        })
        .into_interface("corr-7");

        assert_eq!(error.kind, ErrorKind::BadRequest);
        assert_eq!(error.correlation_id, "corr-7");
        assert!(error.message.contains("toolu_9") && error.message.contains("toolu_1"));
        assert!(error.to_string().starts_with("bad request: "));
    }

    #[test]
    fn lookups_and_duplicates_get_their_own_kinds() {
        assert_eq!(
            ApplicationError::from(UsageError::UnknownSkill("triage".to_owned())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ApplicationError::from(UsageError::DuplicateTask("task_1".to_owned())).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            ApplicationError::from(UsageError::MissingField("userId")).kind(),
            ErrorKind::BadRequest
        );
    }

    #[test]
    fn lifecycle_and_storage_failures_map_by_kind() {
        let lifecycle = ApplicationError::from(LifecycleError::AlreadyTerminal {
            state: TaskStatus::Completed,
            event: TaskEvent::FinalAnswerReceived,
        });
        assert_eq!(lifecycle.kind(), ErrorKind::BadRequest);

        let storage =
            ApplicationError::Persistence("database is locked".to_owned()).into_interface("c");
        assert_eq!(storage.kind, ErrorKind::Unavailable);
        assert_eq!(storage.kind.public_message(), "Task storage is unavailable. Retry shortly.");
    }
}
