use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use boardwright_core::config::LlmConfig;
use boardwright_core::domain::message::{AssistantBlock, ToolCallId};

use crate::llm::{ModelClient, ModelRequest, ModelResponse, StopReason, TokenUsage};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const RETRY_BACKOFF_MS: u64 = 500;

/// Anthropic Messages API over a streaming (`text/event-stream`) response.
pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
    max_retries: u32,
}

impl AnthropicClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("llm.api_key is required for the Anthropic client"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
        })
    }

    fn request_body(request: &ModelRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "system": request.system,
            "messages": request.messages,
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        body
    }

    async fn send_with_retry(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut attempt = 0;

        loop {
            let sent = self
                .client
                .post(&url)
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(body)
                .send()
                .await;

            let retryable = match sent {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if !is_retryable(status) || attempt >= self.max_retries {
                        bail!("anthropic request failed with status {status}: {text}");
                    }
                    format!("status {status}")
                }
                Err(error) => {
                    if attempt >= self.max_retries {
                        return Err(error).context("anthropic request failed");
                    }
                    error.to_string()
                }
            };

            attempt += 1;
            tracing::warn!(
                event_name = "llm.request.retry",
                attempt,
                max_retries = self.max_retries,
                reason = %retryable,
                "retrying model request"
            );
            tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt))).await;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(
        &self,
        request: &ModelRequest,
        on_token: &(dyn for<'t> Fn(&'t str) + Send + Sync),
    ) -> Result<ModelResponse> {
        let body = Self::request_body(request);
        let response = self.send_with_retry(&body).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();
        let mut assembler = StreamAssembler::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("model stream interrupted")?;
            buffer.extend_from_slice(&chunk);
            for payload in drain_event_payloads(&mut buffer) {
                let data: Value = serde_json::from_str(&payload)
                    .with_context(|| format!("invalid stream event payload: {payload}"))?;
                assembler.apply(&data, on_token)?;
            }
        }

        assembler.finish()
    }
}

/// Pulls complete SSE events off the front of `buffer` and returns their `data:` payloads.
/// A trailing partial event (possibly a split UTF-8 sequence) stays in the buffer.
fn drain_event_payloads(buffer: &mut Vec<u8>) -> Vec<String> {
    let lf = buffer.windows(2).rposition(|window| window == b"\n\n").map(|index| index + 2);
    let crlf = buffer.windows(4).rposition(|window| window == b"\r\n\r\n").map(|index| index + 4);
    let Some(end) = lf.max(crlf) else {
        return Vec::new();
    };

    let complete: Vec<u8> = buffer.drain(..end).collect();
    let text = String::from_utf8_lossy(&complete).replace("\r\n", "\n");
    text.split("\n\n")
        .filter_map(|event| {
            let data: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            (!data.is_empty()).then(|| data.join("\n"))
        })
        .collect()
}

enum PartialBlock {
    Text(String),
    ToolUse { id: String, name: String, json: String },
}

#[derive(Default)]
struct StreamAssembler {
    blocks: BTreeMap<u64, PartialBlock>,
    stop_reason: Option<StopReason>,
    usage: TokenUsage,
}

impl StreamAssembler {
    fn apply(
        &mut self,
        data: &Value,
        on_token: &(dyn for<'t> Fn(&'t str) + Send + Sync),
    ) -> Result<()> {
        match data["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let usage = &data["message"]["usage"];
                self.usage.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
                self.usage.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0);
            }
            "content_block_start" => {
                let index = data["index"].as_u64().unwrap_or(0);
                let block = &data["content_block"];
                let partial = match block["type"].as_str().unwrap_or_default() {
                    "tool_use" => PartialBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        json: String::new(),
                    },
                    _ => {
                        let text = block["text"].as_str().unwrap_or_default().to_string();
                        if !text.is_empty() {
                            on_token(&text);
                        }
                        PartialBlock::Text(text)
                    }
                };
                self.blocks.insert(index, partial);
            }
            "content_block_delta" => {
                let index = data["index"].as_u64().unwrap_or(0);
                let delta = &data["delta"];
                match (self.blocks.get_mut(&index), delta["type"].as_str().unwrap_or_default()) {
                    (Some(PartialBlock::Text(text)), "text_delta") => {
                        let piece = delta["text"].as_str().unwrap_or_default();
                        on_token(piece);
                        text.push_str(piece);
                    }
                    (Some(PartialBlock::ToolUse { json, .. }), "input_json_delta") => {
                        json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(StopReason::parse(reason));
                }
                if let Some(output_tokens) = data["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = output_tokens;
                }
            }
            "error" => {
                let message = data["error"]["message"].as_str().unwrap_or("unknown stream error");
                bail!("model stream error: {message}");
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<ModelResponse> {
        let stop_reason = self
            .stop_reason
            .ok_or_else(|| anyhow!("model stream ended without a stop reason"))?;

        let content = self
            .blocks
            .into_values()
            .map(|block| match block {
                PartialBlock::Text(text) => Ok(AssistantBlock::Text { text }),
                PartialBlock::ToolUse { id, name, json } => {
                    let input = if json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&json)
                            .with_context(|| format!("invalid input json for tool `{name}`"))?
                    };
                    Ok(AssistantBlock::ToolUse { id: ToolCallId(id), name, input })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ModelResponse { content, stop_reason, usage: self.usage })
    }
}
