use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use boardwright_core::domain::skill::{Skill, SkillId};

use super::{RepositoryError, SkillRepository};
use crate::DbPool;

pub struct SqlSkillRepository {
    pool: DbPool,
}

impl SqlSkillRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SkillRepository for SqlSkillRepository {
    async fn find_by_id(&self, id: &SkillId) -> Result<Option<Skill>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, system_prompt, default_prompt, supported_tools_json
             FROM skill
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(skill_from_row).transpose()
    }

    async fn save(&self, skill: Skill) -> Result<(), RepositoryError> {
        let tools_json = serde_json::to_string(&skill.supported_tools)
            .map_err(|error| RepositoryError::Decode(format!("encode supported tools: {error}")))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO skill (
                id, name, system_prompt, default_prompt, supported_tools_json,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                system_prompt = excluded.system_prompt,
                default_prompt = excluded.default_prompt,
                supported_tools_json = excluded.supported_tools_json,
                updated_at = excluded.updated_at",
        )
        .bind(&skill.id.0)
        .bind(&skill.name)
        .bind(&skill.system_prompt)
        .bind(skill.default_prompt.as_deref())
        .bind(tools_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<Skill>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, name, system_prompt, default_prompt, supported_tools_json
             FROM skill
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(skill_from_row).collect()
    }
}

fn skill_from_row(row: SqliteRow) -> Result<Skill, RepositoryError> {
    let tools_raw = row.try_get::<String, _>("supported_tools_json")?;
    let supported_tools = serde_json::from_str::<Vec<String>>(&tools_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid supported_tools_json `{tools_raw}`: {error}"))
    })?;

    Ok(Skill {
        id: SkillId(row.try_get("id")?),
        name: row.try_get("name")?,
        system_prompt: row.try_get("system_prompt")?,
        default_prompt: row.try_get("default_prompt")?,
        supported_tools,
    })
}
