use std::collections::HashSet;
use std::fs;
use std::path::Path;

use boardwright_core::domain::skill::{Skill, SkillId};
use boardwright_db::{migrations, SkillRepository, SqlSkillRepository};
use serde::Deserialize;
use serde_json::json;

use crate::commands::{exit, with_database, CommandResult};

#[derive(Debug, Deserialize)]
struct SkillFile {
    #[serde(default, rename = "skill")]
    skills: Vec<SkillEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SkillEntry {
    id: String,
    name: Option<String>,
    system_prompt: String,
    default_prompt: Option<String>,
    #[serde(default)]
    supported_tools: Vec<String>,
}

/// Parses `[[skill]]` tables. Ids must be unique within the file and prompts non-empty.
pub fn parse_skills(raw: &str) -> Result<Vec<Skill>, String> {
    let file: SkillFile =
        toml::from_str(raw).map_err(|error| format!("invalid skill file: {error}"))?;
    if file.skills.is_empty() {
        return Err("skill file defines no [[skill]] entries".to_string());
    }

    let mut seen = HashSet::new();
    file.skills
        .into_iter()
        .map(|entry| {
            let id = entry.id.trim().to_string();
            if id.is_empty() {
                return Err("skill id must not be empty".to_string());
            }
            if !seen.insert(id.clone()) {
                return Err(format!("skill `{id}` is defined more than once"));
            }
            if entry.system_prompt.trim().is_empty() {
                return Err(format!("skill `{id}` has an empty system_prompt"));
            }

            let mut tools: Vec<String> = Vec::with_capacity(entry.supported_tools.len());
            for tool in entry.supported_tools {
                let tool = tool.trim().to_string();
                if !tool.is_empty() && !tools.contains(&tool) {
                    tools.push(tool);
                }
            }

            let name = entry.name.filter(|name| !name.trim().is_empty());
            Ok(Skill {
                name: name.unwrap_or_else(|| id.clone()),
                id: SkillId(id),
                system_prompt: entry.system_prompt,
                default_prompt: entry.default_prompt.filter(|prompt| !prompt.trim().is_empty()),
                supported_tools: tools,
            })
        })
        .collect()
}

pub fn import(path: &Path) -> CommandResult {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            return CommandResult::failure(
                "skills.import",
                "input",
                format!("failed to read {}: {error}", path.display()),
                exit::INPUT,
            );
        }
    };
    let skills = match parse_skills(&raw) {
        Ok(skills) => skills,
        Err(message) => {
            return CommandResult::failure("skills.import", "input", message, exit::INPUT);
        }
    };

    with_database("skills.import", |_config, pool| async move {
        if let Err(error) = migrations::run_pending(&pool).await {
            return CommandResult::failure(
                "skills.import",
                "migration",
                error.to_string(),
                exit::MIGRATION,
            );
        }

        let repository = SqlSkillRepository::new(pool);
        let mut imported = Vec::with_capacity(skills.len());
        for skill in skills {
            let id = skill.id.0.clone();
            if let Err(error) = repository.save(skill).await {
                return CommandResult::failure(
                    "skills.import",
                    "persistence",
                    format!("failed to save skill `{id}`: {error}"),
                    exit::PERSISTENCE,
                );
            }
            imported.push(id);
        }

        CommandResult::success_with_data(
            "skills.import",
            format!("imported {} skill(s)", imported.len()),
            json!({ "skills": imported }),
        )
    })
}

pub fn list() -> CommandResult {
    with_database("skills.list", |_config, pool| async move {
        match SqlSkillRepository::new(pool).list().await {
            Ok(skills) => {
                let rows: Vec<_> = skills
                    .iter()
                    .map(|skill| {
                        json!({
                            "id": skill.id.0,
                            "name": skill.name,
                            "supported_tools": skill.supported_tools,
                            "has_default_prompt": skill.default_prompt.is_some(),
                        })
                    })
                    .collect();
                CommandResult::success_with_data(
                    "skills.list",
                    format!("{} skill(s)", rows.len()),
                    json!({ "skills": rows }),
                )
            }
            Err(error) => CommandResult::failure(
                "skills.list",
                "persistence",
                error.to_string(),
                exit::PERSISTENCE,
            ),
        }
    })
}
