use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use boardwright_core::domain::message::{AssistantBlock, Message, ToolCallId, ToolCallRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(other)]
    Other,
}

impl StopReason {
    pub fn parse(value: &str) -> Self {
        match value {
            "end_turn" => Self::EndTurn,
            "tool_use" => Self::ToolUse,
            "max_tokens" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self { input_tokens, output_tokens }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelResponse {
    pub content: Vec<AssistantBlock>,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

impl ModelResponse {
    pub fn final_text(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            content: vec![AssistantBlock::Text { text: text.into() }],
            stop_reason: StopReason::EndTurn,
            usage,
        }
    }

    /// A `tool_use` turn: optional preamble text followed by `(id, name, input)` calls.
    pub fn tool_use(
        preamble: Option<&str>,
        calls: Vec<(&str, &str, Value)>,
        usage: TokenUsage,
    ) -> Self {
        let mut content = Vec::with_capacity(calls.len() + 1);
        if let Some(text) = preamble {
            content.push(AssistantBlock::Text { text: text.to_string() });
        }
        content.extend(calls.into_iter().map(|(id, name, input)| AssistantBlock::ToolUse {
            id: ToolCallId(id.to_string()),
            name: name.to_string(),
            input,
        }));
        Self { content, stop_reason: StopReason::ToolUse, usage }
    }

    pub fn tool_calls(&self) -> Vec<ToolCallRequest> {
        self.content
            .iter()
            .filter_map(|block| match block {
                AssistantBlock::ToolUse { id, name, input } => Some(ToolCallRequest {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                AssistantBlock::Text { .. } => None,
            })
            .collect()
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                AssistantBlock::Text { text } => Some(text.as_str()),
                AssistantBlock::ToolUse { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// A language model that can be called with a conversation and a tool list.
///
/// Implementations forward streamed text to `on_token` in provider order before
/// returning the assembled response.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        request: &ModelRequest,
        on_token: &(dyn for<'t> Fn(&'t str) + Send + Sync),
    ) -> Result<ModelResponse>;
}

/// Replays queued responses in order and records every request it receives.
#[derive(Default)]
pub struct ScriptedModelClient {
    responses: Mutex<VecDeque<Result<ModelResponse, String>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModelClient {
    pub fn new(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: ModelResponse) {
        self.lock_responses().push_back(Ok(response));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.lock_responses().push_back(Err(message.into()));
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        match self.requests.lock() {
            Ok(requests) => requests.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests().len()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<ModelResponse, String>>> {
        match self.responses.lock() {
            Ok(responses) => responses,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn complete(
        &self,
        request: &ModelRequest,
        on_token: &(dyn for<'t> Fn(&'t str) + Send + Sync),
    ) -> Result<ModelResponse> {
        match self.requests.lock() {
            Ok(mut requests) => requests.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }

        let next = self.lock_responses().pop_front();
        let response = match next {
            Some(Ok(response)) => response,
            Some(Err(message)) => return Err(anyhow!(message)),
            None => return Err(anyhow!("scripted model has no response left")),
        };

        for block in &response.content {
            if let AssistantBlock::Text { text } = block {
                for token in text.split_inclusive(' ') {
                    on_token(token);
                }
            }
        }

        Ok(response)
    }
}
