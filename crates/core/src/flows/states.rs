use serde::{Deserialize, Serialize};

use crate::domain::task::TaskStatus;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEvent {
    ConfirmationRequested,
    ConfirmationResolved,
    FinalAnswerReceived,
    BudgetDenied,
    IterationLimitReached,
    ModelCallFailed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub event: TaskEvent,
}
