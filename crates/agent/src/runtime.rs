use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

use boardwright_core::budget::{BudgetDecision, BudgetGate, UsageRecord, UsageSink};
use boardwright_core::config::AppConfig;
use boardwright_core::domain::execution::{ResumeRequest, RunOutcome, RunReport, StartRequest};
use boardwright_core::domain::message::{append_tool_results, Message, ToolCallRequest};
use boardwright_core::domain::skill::Skill;
use boardwright_core::domain::task::{
    PendingConfirmation, Task, TaskId, UsageTotals, MAX_ITERATIONS,
};
use boardwright_core::errors::{ApplicationError, UsageError};
use boardwright_core::flows::{LifecycleError, TaskEvent, TaskLifecycle};
use boardwright_db::repositories::{RepositoryError, SkillRepository, TaskRepository};

use crate::confirmation::{ConfirmationGate, ResumePlan, REJECTION_MESSAGE};
use crate::dispatcher::ToolDispatcher;
use crate::events::{EventEmitter, EventSink};
use crate::llm::{ModelClient, ModelRequest, StopReason};
use crate::tools::{ToolContext, ToolRegistry};
use crate::usage::{ModelPricing, UsageAccumulator};

#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeSettings {
    pub model: String,
    pub max_tokens: u32,
    pub max_iterations: u32,
    pub pricing: ModelPricing,
}

impl RuntimeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.llm.model.clone(),
            max_tokens: config.llm.max_tokens,
            max_iterations: config.agent.max_iterations.min(MAX_ITERATIONS),
            pricing: ModelPricing::from_config(&config.llm),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 4096,
            max_iterations: MAX_ITERATIONS,
            pricing: ModelPricing::default(),
        }
    }
}

pub struct RuntimeDeps {
    pub model: Arc<dyn ModelClient>,
    pub tools: Arc<ToolRegistry>,
    pub tasks: Arc<dyn TaskRepository>,
    pub skills: Arc<dyn SkillRepository>,
    pub budget: Arc<dyn BudgetGate>,
    pub usage_sink: Arc<dyn UsageSink>,
    pub settings: RuntimeSettings,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error("task persistence failed: {0}")]
    Persistence(#[from] RepositoryError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl From<RuntimeError> for ApplicationError {
    fn from(value: RuntimeError) -> Self {
        match value {
            RuntimeError::Usage(error) => Self::Usage(error),
            RuntimeError::Persistence(error) => Self::Persistence(error.to_string()),
            RuntimeError::Lifecycle(error) => Self::Lifecycle(error),
        }
    }
}

/// A validated run, ready to drive. Built by `prepare_start` or `prepare_resume`.
#[derive(Clone, Debug)]
pub struct PreparedRun {
    task: Task,
    skill: Skill,
    resume: Option<ResumePlan>,
}

impl PreparedRun {
    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn is_resume(&self) -> bool {
        self.resume.is_some()
    }
}

enum TurnOutcome {
    Resolved,
    Suspended(PendingConfirmation),
}

pub struct AgentRuntime {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    tasks: Arc<dyn TaskRepository>,
    skills: Arc<dyn SkillRepository>,
    budget: Arc<dyn BudgetGate>,
    usage_sink: Arc<dyn UsageSink>,
    settings: RuntimeSettings,
    lifecycle: TaskLifecycle,
}

impl AgentRuntime {
    pub fn new(deps: RuntimeDeps) -> Self {
        Self {
            model: deps.model,
            tools: deps.tools,
            tasks: deps.tasks,
            skills: deps.skills,
            budget: deps.budget,
            usage_sink: deps.usage_sink,
            settings: deps.settings,
            lifecycle: TaskLifecycle,
        }
    }

    pub fn tasks(&self) -> &Arc<dyn TaskRepository> {
        &self.tasks
    }

    /// Validates a fresh run. Nothing is persisted until `run` starts.
    pub async fn prepare_start(&self, request: StartRequest) -> Result<PreparedRun, RuntimeError> {
        let max_iterations = match request.max_iterations {
            Some(0) => {
                let error = UsageError::InvalidMaxIterations { given: 0, max: MAX_ITERATIONS };
                return Err(error.into());
            }
            Some(requested) => requested.min(self.settings.max_iterations),
            None => self.settings.max_iterations,
        };

        let skill = self
            .skills
            .find_by_id(&request.skill_id)
            .await?
            .ok_or_else(|| UsageError::UnknownSkill(request.skill_id.0.clone()))?;

        let input = request
            .input_message
            .filter(|message| !message.trim().is_empty())
            .or_else(|| skill.default_prompt.clone())
            .ok_or(UsageError::MissingField("inputMessage"))?;

        let task_id = match request.task_id {
            Some(task_id) => {
                if self.tasks.find_by_id(&task_id).await?.is_some() {
                    return Err(UsageError::DuplicateTask(task_id.0).into());
                }
                task_id
            }
            None => TaskId::generate(),
        };

        let now = Utc::now();
        let task = Task {
            id: task_id,
            skill_id: skill.id.clone(),
            user_id: request.user_id,
            card_id: request.card_id,
            board_id: request.board_id,
            board_agent_id: request.board_agent_id,
            status: self.lifecycle.initial_state(),
            message_history: vec![Message::user_text(input)],
            iteration_count: 0,
            max_iterations,
            usage: UsageTotals::default(),
            pending_confirmation: None,
            final_output: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        Ok(PreparedRun { task, skill, resume: None })
    }

    /// Validates a resume against the task's single pending confirmation.
    pub async fn prepare_resume(
        &self,
        request: ResumeRequest,
    ) -> Result<PreparedRun, RuntimeError> {
        let task = self
            .tasks
            .find_by_id(&request.task_id)
            .await?
            .ok_or_else(|| UsageError::UnknownTask(request.task_id.0.clone()))?;

        let plan = ConfirmationGate::validate_resume(&task, request.decision)?;

        let skill = self
            .skills
            .find_by_id(&task.skill_id)
            .await?
            .ok_or_else(|| UsageError::UnknownSkill(task.skill_id.0.clone()))?;

        Ok(PreparedRun { task, skill, resume: Some(plan) })
    }

    /// Drives the loop until the task completes, fails, or suspends for confirmation.
    /// Exactly one of `complete`, `error`, or `confirmation_needed` reaches the sink.
    pub async fn run(
        &self,
        prepared: PreparedRun,
        sink: &dyn EventSink,
    ) -> Result<RunReport, RuntimeError> {
        let emitter = EventEmitter::new(sink);
        let task_id = prepared.task.id.clone();

        match self.drive(prepared, &emitter).await {
            Ok(report) => Ok(report),
            Err(error) => {
                tracing::error!(
                    event_name = "agent.run.aborted",
                    task_id = %task_id,
                    error = %error,
                    "run aborted before reaching a persisted state"
                );
                emitter.error(&error.to_string());
                Err(error)
            }
        }
    }

    async fn drive(
        &self,
        prepared: PreparedRun,
        emitter: &EventEmitter<'_>,
    ) -> Result<RunReport, RuntimeError> {
        let PreparedRun { mut task, skill, resume } = prepared;
        let dispatcher = ToolDispatcher::new(&self.tools, &skill);
        let context = ToolContext::for_task(&task);
        let mut usage = UsageAccumulator::resume(task.usage.clone(), self.settings.pricing);

        match resume {
            None => {
                tracing::info!(
                    event_name = "agent.run.started",
                    task_id = %task.id,
                    skill_id = %skill.id,
                    max_iterations = task.max_iterations,
                    "starting agent run"
                );
                self.persist(&mut task, &usage).await?;
            }
            Some(plan) => {
                self.transition(&mut task, TaskEvent::ConfirmationResolved)?;
                task.pending_confirmation = None;
                tracing::info!(
                    event_name = "agent.run.resumed",
                    task_id = %task.id,
                    skill_id = %skill.id,
                    tool_call_id = %plan.decided.id,
                    confirmed = plan.decision.is_confirmed(),
                    "resuming suspended run"
                );

                let block = if plan.decision.is_confirmed() {
                    let result =
                        dispatcher.execute(&plan.decided, &context, emitter, &mut usage).await;
                    result.into_block()
                } else {
                    emitter.tool_result(&plan.decided.name, REJECTION_MESSAGE, false);
                    ConfirmationGate::rejection_block(plan.decided.id.clone())
                };
                append_tool_results(&mut task.message_history, vec![block]);

                let remaining = plan.remaining;
                match self
                    .resolve_calls(&mut task, remaining, &dispatcher, &context, emitter, &mut usage)
                    .await
                {
                    TurnOutcome::Suspended(pending) => {
                        return self.suspend(task, pending, &usage, emitter).await
                    }
                    TurnOutcome::Resolved => {
                        task.iteration_count += 1;
                        self.persist(&mut task, &usage).await?;
                    }
                }
            }
        }

        let tool_schemas = self.tools.schemas_for(&skill);

        loop {
            if task.iteration_limit_reached() {
                let message = format!(
                    "iteration limit reached after {} model calls without a final answer",
                    task.iteration_count
                );
                let event = TaskEvent::IterationLimitReached;
                return self.fail(task, event, message, &usage, emitter).await;
            }

            match self.budget.check(&task.user_id, &task.id).await {
                Ok(BudgetDecision::Allow) => {}
                Ok(BudgetDecision::Deny { reason }) => {
                    return self.fail(task, TaskEvent::BudgetDenied, reason, &usage, emitter).await;
                }
                Err(error) => {
                    let message = format!("budget check failed: {error:#}");
                    return self.fail(task, TaskEvent::BudgetDenied, message, &usage, emitter).await;
                }
            }

            tracing::info!(
                event_name = "agent.iteration.started",
                task_id = %task.id,
                iteration = task.iteration_count + 1,
                history_len = task.message_history.len(),
                "calling model"
            );

            let request = ModelRequest {
                model: self.settings.model.clone(),
                system: skill.system_prompt.clone(),
                messages: task.message_history.clone(),
                tools: tool_schemas.clone(),
                max_tokens: self.settings.max_tokens,
            };
            let on_token = |text: &str| emitter.token(text);
            let response = match self.model.complete(&request, &on_token).await {
                Ok(response) => response,
                Err(error) => {
                    let message = format!("model call failed: {error:#}");
                    let event = TaskEvent::ModelCallFailed;
                    return self.fail(task, event, message, &usage, emitter).await;
                }
            };

            let cost = usage.record_model_call(response.usage);
            let record = UsageRecord::new(
                task.id.clone(),
                task.user_id.clone(),
                self.settings.model.clone(),
                response.usage.input_tokens,
                response.usage.output_tokens,
                cost,
            );
            if let Err(error) = self.usage_sink.record(record).await {
                tracing::warn!(
                    event_name = "agent.usage.record_failed",
                    task_id = %task.id,
                    error = %format!("{error:#}"),
                    "usage record was not delivered"
                );
            }

            let calls = response.tool_calls();
            task.message_history.push(Message::assistant(response.content.clone()));

            if calls.is_empty() || response.stop_reason != StopReason::ToolUse {
                task.iteration_count += 1;
                return self.complete(task, response.text(), &usage, emitter).await;
            }

            match self
                .resolve_calls(&mut task, calls, &dispatcher, &context, emitter, &mut usage)
                .await
            {
                TurnOutcome::Suspended(pending) => {
                    return self.suspend(task, pending, &usage, emitter).await
                }
                TurnOutcome::Resolved => {
                    task.iteration_count += 1;
                    self.persist(&mut task, &usage).await?;
                }
            }
        }
    }

    /// Resolves calls in issue order. Stops at the first gated call after recording the
    /// results gathered so far.
    async fn resolve_calls(
        &self,
        task: &mut Task,
        calls: Vec<ToolCallRequest>,
        dispatcher: &ToolDispatcher<'_>,
        context: &ToolContext,
        emitter: &EventEmitter<'_>,
        usage: &mut UsageAccumulator,
    ) -> TurnOutcome {
        let mut blocks = Vec::with_capacity(calls.len());

        for call in calls {
            if let Some(pending) = ConfirmationGate::intercept(dispatcher, &call) {
                append_tool_results(&mut task.message_history, blocks);
                return TurnOutcome::Suspended(pending);
            }
            blocks.push(dispatcher.execute(&call, context, emitter, usage).await.into_block());
        }

        append_tool_results(&mut task.message_history, blocks);
        TurnOutcome::Resolved
    }

    async fn suspend(
        &self,
        mut task: Task,
        pending: PendingConfirmation,
        usage: &UsageAccumulator,
        emitter: &EventEmitter<'_>,
    ) -> Result<RunReport, RuntimeError> {
        self.transition(&mut task, TaskEvent::ConfirmationRequested)?;
        task.pending_confirmation = Some(pending.clone());
        self.persist_settled(&mut task, usage).await?;

        tracing::info!(
            event_name = "agent.run.suspended",
            task_id = %task.id,
            tool_call_id = %pending.tool_call_id,
            tool_name = %pending.tool_name,
            "awaiting confirmation"
        );
        emitter.confirmation_needed(&pending);

        Ok(report(&task, RunOutcome::Suspended { pending }))
    }

    async fn complete(
        &self,
        mut task: Task,
        output: String,
        usage: &UsageAccumulator,
        emitter: &EventEmitter<'_>,
    ) -> Result<RunReport, RuntimeError> {
        self.transition(&mut task, TaskEvent::FinalAnswerReceived)?;
        task.final_output = Some(output.clone());
        self.persist_settled(&mut task, usage).await?;

        tracing::info!(
            event_name = "agent.run.completed",
            task_id = %task.id,
            iterations = task.iteration_count,
            input_tokens = task.usage.input_tokens,
            output_tokens = task.usage.output_tokens,
            tool_calls = task.usage.tool_call_count,
            cost_usd = %task.usage.cost_usd,
            "agent run completed"
        );
        emitter.complete(&output);

        Ok(report(&task, RunOutcome::Completed { output }))
    }

    async fn fail(
        &self,
        mut task: Task,
        event: TaskEvent,
        message: String,
        usage: &UsageAccumulator,
        emitter: &EventEmitter<'_>,
    ) -> Result<RunReport, RuntimeError> {
        self.transition(&mut task, event.clone())?;
        task.last_error = Some(message.clone());
        self.persist_settled(&mut task, usage).await?;

        tracing::warn!(
            event_name = "agent.run.failed",
            task_id = %task.id,
            reason = ?event,
            iterations = task.iteration_count,
            error = %message,
            "agent run failed"
        );
        emitter.error(&message);

        Ok(report(&task, RunOutcome::Failed { error: message }))
    }

    fn transition(&self, task: &mut Task, event: TaskEvent) -> Result<(), RuntimeError> {
        let outcome = self.lifecycle.apply(task.status, &event)?;
        tracing::debug!(
            event_name = "agent.task.transition",
            task_id = %task.id,
            from = ?outcome.from,
            to = ?outcome.to,
            event = ?outcome.event,
            "task status changed"
        );
        task.status = outcome.to;
        Ok(())
    }

    /// Saves a completed, failed, or suspended task. A failed save is retried once; if
    /// that fails too the stored row still reads `running` and is logged as stranded.
    async fn persist_settled(
        &self,
        task: &mut Task,
        usage: &UsageAccumulator,
    ) -> Result<(), RuntimeError> {
        let Err(first) = self.persist(task, usage).await else {
            return Ok(());
        };
        tracing::warn!(
            event_name = "agent.run.persist_retry",
            task_id = %task.id,
            status = ?task.status,
            error = %first,
            "retrying final save"
        );

        self.persist(task, usage).await.inspect_err(|error| {
            tracing::error!(
                event_name = "agent.run.stranded",
                task_id = %task.id,
                status = ?task.status,
                error = %error,
                "final state was not saved; stored task is stranded as running"
            );
        })
    }

    async fn persist(&self, task: &mut Task, usage: &UsageAccumulator) -> Result<(), RuntimeError> {
        task.usage = usage.totals().clone();
        task.updated_at = Utc::now();
        self.tasks.save(task.clone()).await?;
        Ok(())
    }
}

fn report(task: &Task, outcome: RunOutcome) -> RunReport {
    RunReport {
        task_id: task.id.clone(),
        outcome,
        iteration_count: task.iteration_count,
        usage: task.usage.clone(),
    }
}
