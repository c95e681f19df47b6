use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SkillId(pub String);

impl std::fmt::Display for SkillId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named system prompt plus the tools the model may call while running it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub id: SkillId,
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub default_prompt: Option<String>,
    #[serde(default)]
    pub supported_tools: Vec<String>,
}

impl Skill {
    pub fn supports_tool(&self, name: &str) -> bool {
        self.supported_tools.iter().any(|tool| tool == name)
    }
}
