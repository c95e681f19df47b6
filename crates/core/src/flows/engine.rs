use thiserror::Error;

use crate::domain::task::TaskStatus;
use crate::flows::states::{TaskEvent, TransitionOutcome};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("task is already terminal ({state:?}); event {event:?} rejected")]
    AlreadyTerminal { state: TaskStatus, event: TaskEvent },
    #[error("invalid task transition from {state:?} using event {event:?}")]
    InvalidTransition { state: TaskStatus, event: TaskEvent },
}

/// Transition table for a task's status. The conversation loop is the only caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskLifecycle;

impl TaskLifecycle {
    pub fn initial_state(&self) -> TaskStatus {
        TaskStatus::Running
    }

    pub fn apply(
        &self,
        current: TaskStatus,
        event: &TaskEvent,
    ) -> Result<TransitionOutcome, LifecycleError> {
        use TaskEvent::{
            BudgetDenied, ConfirmationRequested, ConfirmationResolved, FinalAnswerReceived,
            IterationLimitReached, ModelCallFailed,
        };
        use TaskStatus::{Completed, Failed, PendingConfirmation, Running};

        if current.is_terminal() {
            return Err(LifecycleError::AlreadyTerminal { state: current, event: event.clone() });
        }

        let to = match (current, event) {
            (Running, ConfirmationRequested) => PendingConfirmation,
            (PendingConfirmation, ConfirmationResolved) => Running,
            (Running, FinalAnswerReceived) => Completed,
            (Running, BudgetDenied)
            | (Running, IterationLimitReached)
            | (Running, ModelCallFailed) => Failed,
            _ => {
                return Err(LifecycleError::InvalidTransition {
                    state: current,
                    event: event.clone(),
                });
            }
        };

        Ok(TransitionOutcome { from: current, to, event: event.clone() })
    }
}
