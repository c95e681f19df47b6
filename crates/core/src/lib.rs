pub mod budget;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;

pub use budget::{BudgetDecision, BudgetGate, UsageRecord, UsageSink};
pub use domain::execution::{
    ConfirmationDecision, ResumeRequest, RunOutcome, RunReport, StartRequest,
};
pub use domain::message::{Message, ToolCallId, ToolCallRequest, ToolCallResult};
pub use domain::skill::{Skill, SkillId};
pub use domain::task::{PendingConfirmation, Task, TaskId, TaskStatus, UsageTotals, UserId};
pub use errors::{ApplicationError, ErrorKind, InterfaceError, UsageError};
pub use flows::{TaskEvent, TaskLifecycle};
