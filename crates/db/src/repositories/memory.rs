use std::collections::HashMap;

use tokio::sync::RwLock;

use boardwright_core::domain::skill::{Skill, SkillId};
use boardwright_core::domain::task::{Task, TaskId};

use super::{RepositoryError, SkillRepository, TaskRepository};

#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<String, Task>>,
}

#[async_trait::async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&id.0).cloned())
    }

    async fn save(&self, task: Task) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.0.clone(), task);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySkillRepository {
    skills: RwLock<HashMap<String, Skill>>,
}

impl InMemorySkillRepository {
    pub fn with_skills(skills: impl IntoIterator<Item = Skill>) -> Self {
        let skills = skills.into_iter().map(|skill| (skill.id.0.clone(), skill)).collect();
        Self { skills: RwLock::new(skills) }
    }
}

#[async_trait::async_trait]
impl SkillRepository for InMemorySkillRepository {
    async fn find_by_id(&self, id: &SkillId) -> Result<Option<Skill>, RepositoryError> {
        let skills = self.skills.read().await;
        Ok(skills.get(&id.0).cloned())
    }

    async fn save(&self, skill: Skill) -> Result<(), RepositoryError> {
        let mut skills = self.skills.write().await;
        skills.insert(skill.id.0.clone(), skill);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Skill>, RepositoryError> {
        let skills = self.skills.read().await;
        let mut listed: Vec<Skill> = skills.values().cloned().collect();
        listed.sort_by(|left, right| left.id.0.cmp(&right.id.0));
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use boardwright_core::domain::message::Message;
    use boardwright_core::domain::skill::{Skill, SkillId};
    use boardwright_core::domain::task::{Task, TaskId, TaskStatus, UsageTotals, UserId};

    use crate::repositories::{
        InMemorySkillRepository, InMemoryTaskRepository, SkillRepository, TaskRepository,
    };

    #[tokio::test]
    async fn in_memory_task_repo_round_trip() {
        let repo = InMemoryTaskRepository::default();
        let task = Task {
            id: TaskId("task_1".to_string()),
            skill_id: SkillId("summarize".to_string()),
            user_id: UserId("user-1".to_string()),
            card_id: None,
            board_id: None,
            board_agent_id: None,
            status: TaskStatus::Running,
            message_history: vec![Message::user_text("Summarize the sprint board")],
            iteration_count: 0,
            max_iterations: 10,
            usage: UsageTotals::default(),
            pending_confirmation: None,
            final_output: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        repo.save(task.clone()).await.expect("save task");
        let found = repo.find_by_id(&task.id).await.expect("find task");

        assert_eq!(found, Some(task));
    }

    #[tokio::test]
    async fn in_memory_skill_repo_lists_sorted() {
        let skill = |id: &str| Skill {
            id: SkillId(id.to_string()),
            name: id.to_string(),
            system_prompt: "prompt".to_string(),
            default_prompt: None,
            supported_tools: Vec::new(),
        };
        let repo = InMemorySkillRepository::with_skills([skill("triage"), skill("estimate")]);
        repo.save(skill("author")).await.expect("save skill");

        let ids: Vec<String> =
            repo.list().await.expect("list").into_iter().map(|skill| skill.id.0).collect();

        assert_eq!(ids, vec!["author", "estimate", "triage"]);
    }
}
