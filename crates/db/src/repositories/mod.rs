use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use boardwright_core::domain::skill::{Skill, SkillId};
use boardwright_core::domain::task::{Task, TaskId};

pub mod memory;
pub mod skill;
pub mod task;
pub mod usage;

pub use memory::{InMemorySkillRepository, InMemoryTaskRepository};
pub use skill::SqlSkillRepository;
pub use task::SqlTaskRepository;
pub use usage::SqlUsageLedger;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Durable owner of task state between runs. `save` is an upsert of the whole row.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError>;
    async fn save(&self, task: Task) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait SkillRepository: Send + Sync {
    async fn find_by_id(&self, id: &SkillId) -> Result<Option<Skill>, RepositoryError>;
    async fn save(&self, skill: Skill) -> Result<(), RepositoryError>;
    async fn list(&self) -> Result<Vec<Skill>, RepositoryError>;
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative integer): {value}"
        ))
    })
}

pub(crate) fn to_i64(column: &str, value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("value for `{column}` does not fit in INTEGER: {value}"))
    })
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}
