use std::str::FromStr;

use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use boardwright_core::domain::message::{Message, ToolCallId};
use boardwright_core::domain::skill::SkillId;
use boardwright_core::domain::task::{
    BoardId, CardId, PendingConfirmation, Task, TaskId, TaskStatus, UsageTotals, UserId,
};

use super::{parse_timestamp, parse_u32, parse_u64, to_i64, RepositoryError, TaskRepository};
use crate::DbPool;

pub struct SqlTaskRepository {
    pool: DbPool,
}

impl SqlTaskRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TaskRepository for SqlTaskRepository {
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                skill_id,
                user_id,
                card_id,
                board_id,
                board_agent_id,
                status,
                message_history_json,
                iteration_count,
                max_iterations,
                total_input_tokens,
                total_output_tokens,
                tool_call_count,
                total_cost_usd,
                pending_tool_call_id,
                pending_tool_name,
                pending_input_json,
                pending_prompt,
                final_output,
                last_error,
                created_at,
                updated_at
             FROM agent_task
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(task_from_row).transpose()
    }

    async fn save(&self, task: Task) -> Result<(), RepositoryError> {
        let history_json = serde_json::to_string(&task.message_history)
            .map_err(|error| RepositoryError::Decode(format!("encode message history: {error}")))?;
        let pending_input_json = task
            .pending_confirmation
            .as_ref()
            .map(|pending| serde_json::to_string(&pending.input))
            .transpose()
            .map_err(|error| RepositoryError::Decode(format!("encode pending input: {error}")))?;
        let pending = task.pending_confirmation.as_ref();

        sqlx::query(
            "INSERT INTO agent_task (
                id,
                skill_id,
                user_id,
                card_id,
                board_id,
                board_agent_id,
                status,
                message_history_json,
                iteration_count,
                max_iterations,
                total_input_tokens,
                total_output_tokens,
                tool_call_count,
                total_cost_usd,
                pending_tool_call_id,
                pending_tool_name,
                pending_input_json,
                pending_prompt,
                final_output,
                last_error,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                message_history_json = excluded.message_history_json,
                iteration_count = excluded.iteration_count,
                max_iterations = excluded.max_iterations,
                total_input_tokens = excluded.total_input_tokens,
                total_output_tokens = excluded.total_output_tokens,
                tool_call_count = excluded.tool_call_count,
                total_cost_usd = excluded.total_cost_usd,
                pending_tool_call_id = excluded.pending_tool_call_id,
                pending_tool_name = excluded.pending_tool_name,
                pending_input_json = excluded.pending_input_json,
                pending_prompt = excluded.pending_prompt,
                final_output = excluded.final_output,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .bind(&task.id.0)
        .bind(&task.skill_id.0)
        .bind(&task.user_id.0)
        .bind(task.card_id.as_ref().map(|id| id.0.as_str()))
        .bind(task.board_id.as_ref().map(|id| id.0.as_str()))
        .bind(task.board_agent_id.as_deref())
        .bind(task.status.as_str())
        .bind(history_json)
        .bind(i64::from(task.iteration_count))
        .bind(i64::from(task.max_iterations))
        .bind(to_i64("total_input_tokens", task.usage.input_tokens)?)
        .bind(to_i64("total_output_tokens", task.usage.output_tokens)?)
        .bind(i64::from(task.usage.tool_call_count))
        .bind(task.usage.cost_usd.to_string())
        .bind(pending.map(|pending| pending.tool_call_id.0.as_str()))
        .bind(pending.map(|pending| pending.tool_name.as_str()))
        .bind(pending_input_json)
        .bind(pending.map(|pending| pending.prompt.as_str()))
        .bind(task.final_output.as_deref())
        .bind(task.last_error.as_deref())
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn task_from_row(row: SqliteRow) -> Result<Task, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown task status `{status_raw}`")))?;

    let history_raw = row.try_get::<String, _>("message_history_json")?;
    let message_history = serde_json::from_str::<Vec<Message>>(&history_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid message history: {error}")))?;

    let cost_raw = row.try_get::<String, _>("total_cost_usd")?;
    let cost_usd = Decimal::from_str(&cost_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid total_cost_usd `{cost_raw}`: {error}"))
    })?;

    Ok(Task {
        id: TaskId(row.try_get("id")?),
        skill_id: SkillId(row.try_get("skill_id")?),
        user_id: UserId(row.try_get("user_id")?),
        card_id: row.try_get::<Option<String>, _>("card_id")?.map(CardId),
        board_id: row.try_get::<Option<String>, _>("board_id")?.map(BoardId),
        board_agent_id: row.try_get("board_agent_id")?,
        status,
        message_history,
        iteration_count: parse_u32("iteration_count", row.try_get("iteration_count")?)?,
        max_iterations: parse_u32("max_iterations", row.try_get("max_iterations")?)?,
        usage: UsageTotals {
            input_tokens: parse_u64("total_input_tokens", row.try_get("total_input_tokens")?)?,
            output_tokens: parse_u64("total_output_tokens", row.try_get("total_output_tokens")?)?,
            tool_call_count: parse_u32("tool_call_count", row.try_get("tool_call_count")?)?,
            cost_usd,
        },
        pending_confirmation: pending_from_row(&row)?,
        final_output: row.try_get("final_output")?,
        last_error: row.try_get("last_error")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn pending_from_row(row: &SqliteRow) -> Result<Option<PendingConfirmation>, RepositoryError> {
    let Some(tool_call_id) = row.try_get::<Option<String>, _>("pending_tool_call_id")? else {
        return Ok(None);
    };

    let input = match row.try_get::<Option<String>, _>("pending_input_json")? {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|error| RepositoryError::Decode(format!("invalid pending input: {error}")))?,
        None => serde_json::Value::Null,
    };

    Ok(Some(PendingConfirmation {
        tool_call_id: ToolCallId(tool_call_id),
        tool_name: row.try_get::<Option<String>, _>("pending_tool_name")?.unwrap_or_default(),
        input,
        prompt: row.try_get::<Option<String>, _>("pending_prompt")?.unwrap_or_default(),
    }))
}
