pub mod engine;
pub mod states;

pub use engine::{LifecycleError, TaskLifecycle};
pub use states::{TaskEvent, TransitionOutcome};
