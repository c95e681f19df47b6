use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const OK_PREFIX: &str = "OK: ";
pub const ERROR_PREFIX: &str = "ERROR: ";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallId(pub String);

impl std::fmt::Display for ToolCallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One conversation turn. Serialized in the provider's `role`/`content` shape so a
/// persisted history can be sent back to the model without translation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User { content: UserContent },
    Assistant { content: Vec<AssistantBlock> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    ToolResults(Vec<ToolResultBlock>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text { text: String },
    ToolUse { id: ToolCallId, name: String, input: Value },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "tool_result")]
pub struct ToolResultBlock {
    pub tool_use_id: ToolCallId,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: ToolCallId,
    pub name: String,
    pub input: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_call_id: ToolCallId,
    pub success: bool,
    pub message: String,
}

impl ToolCallResult {
    pub fn ok(tool_call_id: ToolCallId, message: impl Into<String>) -> Self {
        Self { tool_call_id, success: true, message: message.into() }
    }

    pub fn error(tool_call_id: ToolCallId, message: impl Into<String>) -> Self {
        Self { tool_call_id, success: false, message: message.into() }
    }

    /// `OK: <message>` or `ERROR: <message>`. Transcripts and tests parse this prefix.
    pub fn wire_content(&self) -> String {
        let prefix = if self.success { OK_PREFIX } else { ERROR_PREFIX };
        format!("{prefix}{}", self.message)
    }

    pub fn into_block(self) -> ToolResultBlock {
        let content = self.wire_content();
        ToolResultBlock { tool_use_id: self.tool_call_id, content }
    }
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::User { content: UserContent::Text(text.into()) }
    }

    pub fn tool_results(blocks: Vec<ToolResultBlock>) -> Self {
        Self::User { content: UserContent::ToolResults(blocks) }
    }

    pub fn assistant(blocks: Vec<AssistantBlock>) -> Self {
        Self::Assistant { content: blocks }
    }

    pub fn tool_calls(&self) -> Vec<ToolCallRequest> {
        match self {
            Self::Assistant { content } => content
                .iter()
                .filter_map(|block| match block {
                    AssistantBlock::ToolUse { id, name, input } => Some(ToolCallRequest {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    }),
                    AssistantBlock::Text { .. } => None,
                })
                .collect(),
            Self::User { .. } => Vec::new(),
        }
    }

    pub fn text(&self) -> String {
        match self {
            Self::Assistant { content } => content
                .iter()
                .filter_map(|block| match block {
                    AssistantBlock::Text { text } => Some(text.as_str()),
                    AssistantBlock::ToolUse { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
            Self::User { content: UserContent::Text(text) } => text.clone(),
            Self::User { content: UserContent::ToolResults(_) } => String::new(),
        }
    }
}

/// Appends tool results to the history, extending a trailing tool-result turn instead of
/// opening a second consecutive user message.
pub fn append_tool_results(history: &mut Vec<Message>, blocks: Vec<ToolResultBlock>) {
    if blocks.is_empty() {
        return;
    }

    if let Some(Message::User { content: UserContent::ToolResults(existing) }) = history.last_mut()
    {
        existing.extend(blocks);
        return;
    }

    history.push(Message::tool_results(blocks));
}

/// Tool calls from the latest assistant turn that have no `tool_result` yet, in issue order.
pub fn unanswered_tool_calls(history: &[Message]) -> Vec<ToolCallRequest> {
    let Some(assistant_index) =
        history.iter().rposition(|message| matches!(message, Message::Assistant { .. }))
    else {
        return Vec::new();
    };

    let answered: Vec<&ToolCallId> = history[assistant_index + 1..]
        .iter()
        .flat_map(|message| match message {
            Message::User { content: UserContent::ToolResults(blocks) } => {
                blocks.iter().map(|block| &block.tool_use_id).collect::<Vec<_>>()
            }
            _ => Vec::new(),
        })
        .collect();

    history[assistant_index]
        .tool_calls()
        .into_iter()
        .filter(|call| !answered.contains(&&call.id))
        .collect()
}
