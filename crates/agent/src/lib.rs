//! Agent runtime: the tool-calling conversation loop.
//!
//! Given a skill (system prompt plus tool list) and a user message, the runtime calls the
//! model, executes the tools it asks for, feeds results back, and stops on a final answer,
//! the iteration ceiling, a budget denial, or a tool that needs human confirmation.
//!
//! # Architecture
//!
//! 1. **Preparation** (`runtime`) - `prepare_start` / `prepare_resume` validate input and
//!    reject bad requests before any model call
//! 2. **Model call** (`llm`, `anthropic`) - streamed, with tokens pushed to the event sink
//! 3. **Dispatch** (`dispatcher`) - unknown tools, errors and panics become `ERROR:` data
//! 4. **Confirmation** (`confirmation`) - gated tools suspend the task for a human decision
//! 5. **Accounting** (`usage`) - tokens, dollars and tool calls accumulate across resumes
//!
//! # Key Types
//!
//! - `AgentRuntime` - the loop; every collaborator is injected through `RuntimeDeps`
//! - `ModelClient` - provider seam; `AnthropicClient` in production, `ScriptedModelClient` in tests
//! - `EventSink` - push-based observer for `AgentEvent`s
//!
//! The runtime never cancels itself mid-run. The iteration ceiling is the only built-in
//! termination guarantee, and a departed event consumer does not stop the loop.

pub mod anthropic;
pub mod confirmation;
pub mod dispatcher;
pub mod events;
pub mod llm;
pub mod runtime;
pub mod tools;
pub mod usage;

pub use anthropic::AnthropicClient;
pub use events::{AgentEvent, ChannelEventSink, EventEmitter, EventSink, InMemoryEventSink};
pub use llm::{
    ModelClient, ModelRequest, ModelResponse, ScriptedModelClient, StopReason, TokenUsage,
};
pub use runtime::{AgentRuntime, PreparedRun, RuntimeDeps, RuntimeError, RuntimeSettings};
pub use tools::{FunctionTool, ThinkTool, Tool, ToolContext, ToolRegistry};
pub use usage::{ModelPricing, UsageAccumulator};
