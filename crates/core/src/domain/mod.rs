pub mod execution;
pub mod message;
pub mod skill;
pub mod task;
