use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use boardwright_core::domain::message::ToolCallId;
use boardwright_core::domain::task::PendingConfirmation;

pub const THINKING_SUMMARY_CHARS: usize = 100;

/// Lifecycle notification for one run, in emission order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Token { text: String },
    ToolCall { name: String, input: Value },
    ToolResult { name: String, result: String, success: bool },
    Thinking { summary: String },
    ConfirmationNeeded { tool_call_id: ToolCallId, name: String, input: Value, message: String },
    Complete { output: String },
    Error { error: String },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Thinking { .. } => "thinking",
            Self::ConfirmationNeeded { .. } => "confirmation_needed",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// Events that close a run's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConfirmationNeeded { .. } | Self::Complete { .. } | Self::Error { .. })
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

/// Forwards events into a channel. A closed receiver is ignored so a departed client
/// never interrupts the run.
pub struct ChannelEventSink {
    sender: UnboundedSender<AgentEvent>,
    receiver_gone: AtomicBool,
}

impl ChannelEventSink {
    pub fn new(sender: UnboundedSender<AgentEvent>) -> Self {
        Self { sender, receiver_gone: AtomicBool::new(false) }
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: AgentEvent) {
        if self.sender.send(event).is_err() && !self.receiver_gone.swap(true, Ordering::Relaxed) {
            tracing::debug!(
                event_name = "agent.events.receiver_closed",
                "event receiver dropped; run continues without streaming"
            );
        }
    }
}

#[derive(Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<AgentEvent>>,
}

impl InMemoryEventSink {
    pub fn events(&self) -> Vec<AgentEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(AgentEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|event| event.name() == name).count()
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, event: AgentEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Typed front for a sink that lets exactly one terminal event through per run.
pub struct EventEmitter<'a> {
    sink: &'a dyn EventSink,
    closed: AtomicBool,
}

impl<'a> EventEmitter<'a> {
    pub fn new(sink: &'a dyn EventSink) -> Self {
        Self { sink, closed: AtomicBool::new(false) }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn token(&self, text: &str) {
        if !text.is_empty() {
            self.send(AgentEvent::Token { text: text.to_string() });
        }
    }

    pub fn tool_call(&self, name: &str, input: &Value) {
        self.send(AgentEvent::ToolCall { name: name.to_string(), input: input.clone() });
    }

    pub fn tool_result(&self, name: &str, result: &str, success: bool) {
        self.send(AgentEvent::ToolResult {
            name: name.to_string(),
            result: result.to_string(),
            success,
        });
    }

    pub fn thinking(&self, reasoning: &str) {
        let summary = truncate_chars(reasoning, THINKING_SUMMARY_CHARS);
        self.send(AgentEvent::Thinking { summary });
    }

    pub fn confirmation_needed(&self, pending: &PendingConfirmation) {
        self.send(AgentEvent::ConfirmationNeeded {
            tool_call_id: pending.tool_call_id.clone(),
            name: pending.tool_name.clone(),
            input: pending.input.clone(),
            message: pending.prompt.clone(),
        });
    }

    pub fn complete(&self, output: &str) {
        self.send(AgentEvent::Complete { output: output.to_string() });
    }

    pub fn error(&self, error: &str) {
        self.send(AgentEvent::Error { error: error.to_string() });
    }

    fn send(&self, event: AgentEvent) {
        if self.is_closed() {
            return;
        }
        if event.is_terminal() && self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.emit(event);
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
