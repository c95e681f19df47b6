use boardwright_core::domain::message::{AssistantBlock, Message, UserContent};
use boardwright_core::domain::task::{Task, TaskId};
use boardwright_db::{SqlTaskRepository, TaskRepository};
use serde_json::json;

use crate::commands::{exit, with_database, CommandResult};

pub fn run(task_id: &str) -> CommandResult {
    let task_id = TaskId(task_id.trim().to_string());

    with_database("transcript", |_config, pool| async move {
        match SqlTaskRepository::new(pool).find_by_id(&task_id).await {
            Ok(Some(task)) => CommandResult::success_with_data(
                "transcript",
                format!(
                    "task {} is {} after {} of {} iteration(s)",
                    task.id,
                    task.status.as_str(),
                    task.iteration_count,
                    task.max_iterations
                ),
                summary(&task),
            ),
            Ok(None) => CommandResult::failure(
                "transcript",
                "not_found",
                format!("task `{task_id}` was not found"),
                exit::NOT_FOUND,
            ),
            Err(error) => CommandResult::failure(
                "transcript",
                "persistence",
                error.to_string(),
                exit::PERSISTENCE,
            ),
        }
    })
}

fn summary(task: &Task) -> serde_json::Value {
    json!({
        "task_id": task.id.0,
        "skill_id": task.skill_id.0,
        "user_id": task.user_id.0,
        "status": task.status.as_str(),
        "iteration_count": task.iteration_count,
        "max_iterations": task.max_iterations,
        "usage": {
            "input_tokens": task.usage.input_tokens,
            "output_tokens": task.usage.output_tokens,
            "tool_call_count": task.usage.tool_call_count,
            "cost_usd": task.usage.cost_usd.to_string(),
        },
        "pending_confirmation": task.pending_confirmation,
        "final_output": task.final_output,
        "last_error": task.last_error,
        "transcript": render(&task.message_history),
    })
}

/// One line per block, numbered by turn.
pub fn render(history: &[Message]) -> Vec<String> {
    let mut lines = Vec::new();
    for (index, message) in history.iter().enumerate() {
        let turn = index + 1;
        match message {
            Message::User { content: UserContent::Text(text) } => {
                lines.push(format!("[{turn}] user: {text}"));
            }
            Message::User { content: UserContent::ToolResults(blocks) } => {
                lines.extend(blocks.iter().map(|block| {
                    format!("[{turn}] tool_result {}: {}", block.tool_use_id, block.content)
                }));
            }
            Message::Assistant { content } => {
                lines.extend(content.iter().map(|block| match block {
                    AssistantBlock::Text { text } => format!("[{turn}] assistant: {text}"),
                    AssistantBlock::ToolUse { id, name, input } => {
                        format!("[{turn}] tool_use {id} {name} {input}")
                    }
                }));
            }
        }
    }
    lines
}
