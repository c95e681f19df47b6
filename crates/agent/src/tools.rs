use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use boardwright_core::domain::skill::Skill;
use boardwright_core::domain::task::{BoardId, CardId, Task, TaskId, UserId};

use crate::llm::ToolSchema;

pub const THINK_TOOL_NAME: &str = "think";
pub const THINK_ACKNOWLEDGEMENT: &str = "Reasoning recorded. Continue with your analysis.";

/// Identity of the run a tool executes on behalf of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolContext {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub board_id: Option<BoardId>,
    pub card_id: Option<CardId>,
}

impl ToolContext {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            user_id: task.user_id.clone(),
            board_id: task.board_id.clone(),
            card_id: task.card_id.clone(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;

    fn requires_confirmation(&self) -> bool {
        false
    }

    /// Text shown to the human when the call is held for confirmation.
    fn confirmation_prompt(&self, input: &Value) -> String {
        format!("Allow `{}` to run with {input}?", self.name())
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<String>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn with_think() -> Self {
        let mut registry = Self::default();
        registry.register(ThinkTool);
        registry
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Schemas for the skill's tools in the order the skill lists them. Names with no
    /// registered tool are skipped.
    pub fn schemas_for(&self, skill: &Skill) -> Vec<ToolSchema> {
        skill
            .supported_tools
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolSchema {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Scratchpad tool. The dispatcher intercepts it; `execute` only matters when called directly.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        THINK_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Record private reasoning before choosing the next action. Has no side effects."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reasoning": { "type": "string", "description": "Your step-by-step reasoning." }
            },
            "required": ["reasoning"]
        })
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<String> {
        Ok(THINK_ACKNOWLEDGEMENT.to_string())
    }
}

type ToolHandler = dyn Fn(&Value, &ToolContext) -> Result<String> + Send + Sync;

/// Tool backed by a synchronous closure. Used for adapters that finish without awaiting
/// and throughout the tests.
pub struct FunctionTool {
    name: String,
    description: String,
    input_schema: Value,
    confirmation_prompt: Option<String>,
    handler: Arc<ToolHandler>,
}

impl FunctionTool {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Value, &ToolContext) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: json!({ "type": "object" }),
            confirmation_prompt: None,
            handler: Arc::new(handler),
        }
    }

    /// Marks the tool as gated. `{input}` in the prompt is replaced with the call input.
    pub fn requiring_confirmation(mut self, prompt: impl Into<String>) -> Self {
        self.confirmation_prompt = Some(prompt.into());
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    fn requires_confirmation(&self) -> bool {
        self.confirmation_prompt.is_some()
    }

    fn confirmation_prompt(&self, input: &Value) -> String {
        match &self.confirmation_prompt {
            Some(template) => template.replace("{input}", &input.to_string()),
            None => format!("Allow `{}` to run with {input}?", self.name),
        }
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<String> {
        (self.handler)(&input, context)
    }
}
