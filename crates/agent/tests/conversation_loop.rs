use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;

use boardwright_agent::confirmation::REJECTION_MESSAGE;
use boardwright_agent::{
    AgentEvent, AgentRuntime, FunctionTool, InMemoryEventSink, ModelPricing, ModelResponse,
    RuntimeDeps, RuntimeError, RuntimeSettings, ScriptedModelClient, TokenUsage, ToolRegistry,
};
use boardwright_core::budget::{InMemoryUsageLedger, UnlimitedBudget};
use boardwright_core::domain::execution::{
    ConfirmationDecision, ResumeRequest, RunOutcome, StartRequest,
};
use boardwright_core::domain::message::{Message, ToolCallId, UserContent};
use boardwright_core::domain::skill::{Skill, SkillId};
use boardwright_core::domain::task::{Task, TaskId, TaskStatus, UserId};
use boardwright_core::errors::UsageError;
use boardwright_db::repositories::{
    InMemorySkillRepository, InMemoryTaskRepository, RepositoryError, TaskRepository,
};

struct Harness {
    runtime: AgentRuntime,
    model: Arc<ScriptedModelClient>,
    tasks: Arc<InMemoryTaskRepository>,
    ledger: InMemoryUsageLedger,
    read_calls: Arc<AtomicUsize>,
    email_calls: Arc<AtomicUsize>,
}

fn skill(id: &str, tools: &[&str]) -> Skill {
    Skill {
        id: SkillId(id.to_string()),
        name: id.to_string(),
        system_prompt: format!("You are the {id} assistant for a project board."),
        default_prompt: None,
        supported_tools: tools.iter().map(|tool| tool.to_string()).collect(),
    }
}

fn harness(responses: Vec<ModelResponse>) -> Harness {
    harness_with(responses, InMemoryUsageLedger::default(), 10)
}

fn harness_with(
    responses: Vec<ModelResponse>,
    ledger: InMemoryUsageLedger,
    max_iterations: u32,
) -> Harness {
    let read_calls = Arc::new(AtomicUsize::new(0));
    let email_calls = Arc::new(AtomicUsize::new(0));

    let mut registry = ToolRegistry::with_think();
    let reads = Arc::clone(&read_calls);
    registry.register(FunctionTool::new("get_card", "Read a card", move |input, _| {
        reads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("card {} is in Review", input["card_id"].as_str().unwrap_or("?")))
    }));
    registry.register(FunctionTool::new("move_card", "Move a card", |_, _| {
        Err(anyhow!("column `Shipped` does not exist"))
    }));
    let emails = Arc::clone(&email_calls);
    registry.register(
        FunctionTool::new("send_email", "Send an email", move |input, _| {
            emails.fetch_add(1, Ordering::SeqCst);
            Ok(format!("email sent to {}", input["to"].as_str().unwrap_or("?")))
        })
        .requiring_confirmation("Send an email with {input}?"),
    );

    let skills = InMemorySkillRepository::with_skills([
        skill("triage", &["get_card", "move_card", "send_email", "think"]),
        skill("summarize", &[]),
    ]);

    let model = Arc::new(ScriptedModelClient::new(responses));
    let tasks = Arc::new(InMemoryTaskRepository::default());
    let runtime = AgentRuntime::new(RuntimeDeps {
        model: model.clone(),
        tools: Arc::new(registry),
        tasks: tasks.clone(),
        skills: Arc::new(skills),
        budget: Arc::new(ledger.clone()),
        usage_sink: Arc::new(ledger.clone()),
        settings: RuntimeSettings {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 1024,
            max_iterations,
            pricing: ModelPricing::new(Decimal::new(3, 0), Decimal::new(15, 0)),
        },
    });

    Harness { runtime, model, tasks, ledger, read_calls, email_calls }
}

fn start(skill_id: &str, input: &str) -> StartRequest {
    StartRequest {
        task_id: None,
        skill_id: SkillId(skill_id.to_string()),
        user_id: UserId("user-1".to_string()),
        card_id: None,
        board_id: None,
        board_agent_id: None,
        input_message: Some(input.to_string()),
        max_iterations: None,
    }
}

fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage::new(input, output)
}

async fn stored(harness: &Harness, task_id: &TaskId) -> Task {
    harness.tasks.find_by_id(task_id).await.expect("load task").expect("task persisted")
}

fn tool_results(message: &Message) -> Vec<(String, String)> {
    match message {
        Message::User { content: UserContent::ToolResults(blocks) } => blocks
            .iter()
            .map(|block| (block.tool_use_id.0.clone(), block.content.clone()))
            .collect(),
        other => panic!("expected tool results, got {other:?}"),
    }
}

#[tokio::test]
async fn text_only_turn_completes_in_one_iteration() {
    let answer = ModelResponse::final_text("Three cards are blocked.", usage(300, 40));
    let harness = harness(vec![answer]);
    let sink = InMemoryEventSink::default();

    let prepared =
        harness.runtime.prepare_start(start("triage", "What is blocked?")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    assert_eq!(
        report.outcome,
        RunOutcome::Completed { output: "Three cards are blocked.".to_string() }
    );
    assert_eq!(report.iteration_count, 1);
    assert_eq!(harness.model.call_count(), 1);
    assert_eq!(sink.count("complete"), 1);
    assert_eq!(sink.count("error"), 0);

    let tokens: String = sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            AgentEvent::Token { text } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(tokens, "Three cards are blocked.");

    let task = stored(&harness, &report.task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.final_output.as_deref(), Some("Three cards are blocked."));
    assert_eq!(task.message_history.len(), 2);
}

#[tokio::test]
async fn tool_use_blocks_with_end_turn_stop_reason_still_complete() {
    let mut response = ModelResponse::tool_use(
        Some("I would move it, but I am done."),
        vec![("toolu_1", "get_card", json!({ "card_id": "c1" }))],
        usage(100, 20),
    );
    response.stop_reason = boardwright_agent::StopReason::EndTurn;
    let harness = harness(vec![response]);
    let sink = InMemoryEventSink::default();

    let prepared =
        harness.runtime.prepare_start(start("triage", "Check c1")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(harness.read_calls.load(Ordering::SeqCst), 0);
    assert_eq!(sink.count("tool_call"), 0);
}

#[tokio::test]
async fn tool_results_are_prefixed_and_loop_continues() {
    let harness = harness(vec![
        ModelResponse::tool_use(
            Some("Checking."),
            vec![
                ("toolu_1", "get_card", json!({ "card_id": "c1" })),
                ("toolu_2", "move_card", json!({ "column": "Shipped" })),
                ("toolu_3", "fax_card", json!({})),
            ],
            usage(500, 200),
        ),
        ModelResponse::final_text("Card c1 is in Review; Shipped does not exist.", usage(600, 300)),
    ]);
    let sink = InMemoryEventSink::default();

    let prepared =
        harness.runtime.prepare_start(start("triage", "Ship c1")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(report.iteration_count, 2);
    assert_eq!(report.usage.tool_call_count, 3);

    let task = stored(&harness, &report.task_id).await;
    let results = tool_results(&task.message_history[2]);
    assert_eq!(
        results,
        vec![
            ("toolu_1".to_string(), "OK: card c1 is in Review".to_string()),
            ("toolu_2".to_string(), "ERROR: column `Shipped` does not exist".to_string()),
            ("toolu_3".to_string(), "ERROR: unknown tool fax_card".to_string()),
        ]
    );

    let requests = harness.model.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 3);
    let offered: Vec<&str> = requests[0].tools.iter().map(|tool| tool.name.as_str()).collect();
    assert_eq!(offered, vec!["get_card", "move_card", "send_email", "think"]);
}

#[tokio::test]
async fn iteration_ceiling_fails_without_completing() {
    let looping: Vec<ModelResponse> = (0..5)
        .map(|_| {
            ModelResponse::tool_use(
                None,
                vec![("toolu_again", "get_card", json!({ "card_id": "c1" }))],
                usage(10, 5),
            )
        })
        .collect();
    let harness = harness_with(looping, InMemoryUsageLedger::default(), 3);
    let sink = InMemoryEventSink::default();

    let prepared =
        harness.runtime.prepare_start(start("triage", "Loop forever")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    assert!(matches!(
        report.outcome,
        RunOutcome::Failed { ref error } if error.contains("iteration limit")
    ));
    assert_eq!(report.iteration_count, 3);
    assert_eq!(harness.model.call_count(), 3);
    assert_eq!(sink.count("complete"), 0);
    assert_eq!(sink.count("error"), 1);
    assert_eq!(stored(&harness, &report.task_id).await.status, TaskStatus::Failed);
}

#[tokio::test]
async fn requested_iterations_above_ceiling_are_clamped_and_zero_is_rejected() {
    let harness = harness(Vec::new());

    let mut request = start("triage", "Hi");
    request.max_iterations = Some(50);
    let prepared = harness.runtime.prepare_start(request).await.expect("prepare");
    let sink = InMemoryEventSink::default();
    harness.model.push_failure("offline");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");
    assert_eq!(stored(&harness, &report.task_id).await.max_iterations, 10);

    let mut request = start("triage", "Hi");
    request.max_iterations = Some(0);
    let error = harness.runtime.prepare_start(request).await.expect_err("zero iterations");
    assert!(matches!(
        error,
        RuntimeError::Usage(UsageError::InvalidMaxIterations { given: 0, .. })
    ));
}

#[tokio::test]
async fn usage_accumulates_across_iterations_and_reaches_sink() {
    let harness = harness(vec![
        ModelResponse::tool_use(
            None,
            vec![("toolu_1", "get_card", json!({ "card_id": "a" }))],
            usage(500, 200),
        ),
        ModelResponse::tool_use(
            None,
            vec![("toolu_2", "get_card", json!({ "card_id": "b" }))],
            usage(600, 300),
        ),
        ModelResponse::final_text("Both cards are in Review.", usage(400, 250)),
    ]);
    let sink = InMemoryEventSink::default();

    let prepared =
        harness.runtime.prepare_start(start("triage", "Check a and b")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    assert_eq!(report.usage.input_tokens, 1500);
    assert_eq!(report.usage.output_tokens, 750);
    assert_eq!(report.usage.tool_call_count, 2);
    // 1500 * 3 / 1M + 750 * 15 / 1M
    assert_eq!(report.usage.cost_usd, Decimal::new(15750, 6));

    let records = harness.ledger.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|record| record.task_id == report.task_id));
    assert_eq!(records[1].input_tokens, 600);
}

#[tokio::test]
async fn tool_less_skill_makes_one_call_and_completes() {
    let answer = ModelResponse::final_text("The sprint is on track.", usage(200, 30));
    let harness = harness(vec![answer]);
    let sink = InMemoryEventSink::default();

    let prepared =
        harness.runtime.prepare_start(start("summarize", "Summarize")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(harness.model.call_count(), 1);
    assert!(harness.model.requests()[0].tools.is_empty());
    assert_eq!(sink.count("tool_call"), 0);
    assert_eq!(sink.count("complete"), 1);
}

#[tokio::test]
async fn think_summary_is_truncated_while_history_keeps_full_reasoning() {
    let reasoning = "x".repeat(200);
    let harness = harness(vec![
        ModelResponse::tool_use(
            None,
            vec![("toolu_t", "think", json!({ "reasoning": reasoning }))],
            usage(50, 20),
        ),
        ModelResponse::final_text("Decided.", usage(60, 5)),
    ]);
    let sink = InMemoryEventSink::default();

    let prepared =
        harness.runtime.prepare_start(start("triage", "Think first")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    let summaries: Vec<String> = sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            AgentEvent::Thinking { summary } => Some(summary),
            _ => None,
        })
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].chars().count(), 100);
    assert_eq!(sink.count("tool_call"), 0);
    assert_eq!(sink.count("tool_result"), 0);
    assert_eq!(report.usage.tool_call_count, 1);

    let task = stored(&harness, &report.task_id).await;
    let calls = task.message_history[1].tool_calls();
    assert_eq!(calls[0].input["reasoning"].as_str().map(str::len), Some(200));
    assert_eq!(
        tool_results(&task.message_history[2]),
        vec![(
            "toolu_t".to_string(),
            "OK: Reasoning recorded. Continue with your analysis.".to_string()
        )]
    );
}

fn read_then_email() -> ModelResponse {
    ModelResponse::tool_use(
        Some("Reading the card, then emailing the owner."),
        vec![
            ("toolu_read", "get_card", json!({ "card_id": "c7" })),
            ("toolu_mail", "send_email", json!({ "to": "owner@example.com" })),
        ],
        usage(400, 90),
    )
}

#[tokio::test]
async fn gated_call_suspends_after_earlier_calls_and_confirm_runs_only_it() {
    let harness = harness(vec![read_then_email()]);
    let sink = InMemoryEventSink::default();

    let prepared = harness
        .runtime
        .prepare_start(start("triage", "Notify the owner of c7"))
        .await
        .expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    let pending = match report.outcome {
        RunOutcome::Suspended { pending } => pending,
        other => panic!("expected suspension, got {other:?}"),
    };
    assert_eq!(pending.tool_call_id, ToolCallId("toolu_mail".to_string()));
    assert_eq!(pending.prompt, r#"Send an email with {"to":"owner@example.com"}?"#);
    assert_eq!(report.iteration_count, 0);
    assert_eq!(harness.read_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.email_calls.load(Ordering::SeqCst), 0);
    assert_eq!(sink.names().last(), Some(&"confirmation_needed"));
    assert_eq!(sink.count("complete") + sink.count("error"), 0);

    let suspended = stored(&harness, &report.task_id).await;
    assert_eq!(suspended.status, TaskStatus::PendingConfirmation);
    assert_eq!(tool_results(&suspended.message_history[2]).len(), 1);

    harness.model.push_response(ModelResponse::final_text("Emailed the owner.", usage(700, 20)));
    let resume_sink = InMemoryEventSink::default();
    let prepared = harness
        .runtime
        .prepare_resume(ResumeRequest {
            task_id: report.task_id.clone(),
            decision: ConfirmationDecision::Confirm(ToolCallId("toolu_mail".to_string())),
        })
        .await
        .expect("prepare resume");
    let resumed = harness.runtime.run(prepared, &resume_sink).await.expect("resume run");

    assert_eq!(resumed.outcome, RunOutcome::Completed { output: "Emailed the owner.".to_string() });
    assert_eq!(harness.read_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.email_calls.load(Ordering::SeqCst), 1);
    assert_eq!(resumed.iteration_count, 2);
    assert_eq!(resumed.usage.input_tokens, 1100);
    assert_eq!(resumed.usage.tool_call_count, 2);

    let task = stored(&harness, &report.task_id).await;
    assert_eq!(task.message_history.len(), 4);
    assert_eq!(
        tool_results(&task.message_history[2]),
        vec![
            ("toolu_read".to_string(), "OK: card c7 is in Review".to_string()),
            ("toolu_mail".to_string(), "OK: email sent to owner@example.com".to_string()),
        ]
    );
    assert_eq!(task.pending_confirmation, None);
}

#[tokio::test]
async fn rejection_skips_the_tool_and_appends_fixed_text() {
    let harness = harness(vec![read_then_email()]);
    let sink = InMemoryEventSink::default();
    let prepared =
        harness.runtime.prepare_start(start("triage", "Notify the owner")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    harness
        .model
        .push_response(ModelResponse::final_text("Understood, no email sent.", usage(650, 15)));
    let resume_sink = InMemoryEventSink::default();
    let prepared = harness
        .runtime
        .prepare_resume(ResumeRequest {
            task_id: report.task_id.clone(),
            decision: ConfirmationDecision::Reject(ToolCallId("toolu_mail".to_string())),
        })
        .await
        .expect("prepare resume");
    let resumed = harness.runtime.run(prepared, &resume_sink).await.expect("resume run");

    assert!(matches!(resumed.outcome, RunOutcome::Completed { .. }));
    assert_eq!(harness.email_calls.load(Ordering::SeqCst), 0);
    assert_eq!(resumed.usage.tool_call_count, 1);
    assert_eq!(
        resume_sink.events().first(),
        Some(&AgentEvent::ToolResult {
            name: "send_email".to_string(),
            result: REJECTION_MESSAGE.to_string(),
            success: false,
        })
    );

    let task = stored(&harness, &report.task_id).await;
    let results = tool_results(&task.message_history[2]);
    assert_eq!(results[1], ("toolu_mail".to_string(), REJECTION_MESSAGE.to_string()));
}

#[tokio::test]
async fn remaining_calls_of_the_turn_can_suspend_again() {
    let harness = harness(vec![ModelResponse::tool_use(
        None,
        vec![
            ("toolu_m1", "send_email", json!({ "to": "a@example.com" })),
            ("toolu_r", "get_card", json!({ "card_id": "c1" })),
            ("toolu_m2", "send_email", json!({ "to": "b@example.com" })),
        ],
        usage(100, 10),
    )]);
    let sink = InMemoryEventSink::default();
    let prepared =
        harness.runtime.prepare_start(start("triage", "Email both")).await.expect("prepare");
    let first = harness.runtime.run(prepared, &sink).await.expect("run");
    assert!(matches!(
        first.outcome,
        RunOutcome::Suspended { ref pending } if pending.tool_call_id.0 == "toolu_m1"
    ));

    let prepared = harness
        .runtime
        .prepare_resume(ResumeRequest {
            task_id: first.task_id.clone(),
            decision: ConfirmationDecision::Confirm(ToolCallId("toolu_m1".to_string())),
        })
        .await
        .expect("first resume");
    let second = harness.runtime.run(prepared, &InMemoryEventSink::default()).await.expect("run");

    assert!(matches!(
        second.outcome,
        RunOutcome::Suspended { ref pending } if pending.tool_call_id.0 == "toolu_m2"
    ));
    assert_eq!(harness.model.call_count(), 1);
    assert_eq!(harness.email_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.read_calls.load(Ordering::SeqCst), 1);

    let task = stored(&harness, &first.task_id).await;
    let ids: Vec<String> =
        tool_results(&task.message_history[2]).into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec!["toolu_m1", "toolu_r"]);
}

#[tokio::test]
async fn stale_or_unsuspended_resume_is_rejected_before_any_model_call() {
    let harness = harness(vec![read_then_email()]);
    let sink = InMemoryEventSink::default();
    let prepared = harness.runtime.prepare_start(start("triage", "Notify")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    let stale = harness
        .runtime
        .prepare_resume(ResumeRequest {
            task_id: report.task_id.clone(),
            decision: ConfirmationDecision::Confirm(ToolCallId("toolu_read".to_string())),
        })
        .await
        .expect_err("stale id");
    assert!(matches!(stale, RuntimeError::Usage(UsageError::StaleConfirmation { .. })));

    let unknown = harness
        .runtime
        .prepare_resume(ResumeRequest {
            task_id: TaskId("task_missing".to_string()),
            decision: ConfirmationDecision::Confirm(ToolCallId("toolu_mail".to_string())),
        })
        .await
        .expect_err("unknown task");
    assert!(matches!(unknown, RuntimeError::Usage(UsageError::UnknownTask(_))));
    assert_eq!(harness.model.call_count(), 1);
}

#[tokio::test]
async fn budget_denial_fails_without_calling_the_model() {
    let ledger = InMemoryUsageLedger::with_ceiling(Decimal::ZERO);
    let harness = harness_with(vec![ModelResponse::final_text("unused", usage(1, 1))], ledger, 10);
    let sink = InMemoryEventSink::default();

    let prepared =
        harness.runtime.prepare_start(start("triage", "Anything")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    assert!(matches!(report.outcome, RunOutcome::Failed { ref error } if error.contains("budget")));
    assert_eq!(harness.model.call_count(), 0);
    assert_eq!(report.usage.cost_usd, Decimal::ZERO);
    assert_eq!(sink.names(), vec!["error"]);
}

#[tokio::test]
async fn model_failure_emits_a_single_error() {
    let harness = harness(Vec::new());
    harness.model.push_failure("connection reset by peer");
    let sink = InMemoryEventSink::default();

    let prepared =
        harness.runtime.prepare_start(start("triage", "Anything")).await.expect("prepare");
    let report = harness.runtime.run(prepared, &sink).await.expect("run");

    assert!(matches!(
        report.outcome,
        RunOutcome::Failed { ref error } if error.contains("connection reset")
    ));
    assert_eq!(sink.count("error"), 1);
    assert_eq!(stored(&harness, &report.task_id).await.status, TaskStatus::Failed);
}

#[tokio::test]
async fn missing_input_without_default_prompt_is_a_usage_error() {
    let harness = harness(Vec::new());
    let mut request = start("triage", "");
    request.input_message = None;

    let error = harness.runtime.prepare_start(request).await.expect_err("missing input");

    assert!(matches!(error, RuntimeError::Usage(UsageError::MissingField("inputMessage"))));
    let unknown =
        harness.runtime.prepare_start(start("nope", "Hi")).await.expect_err("unknown skill");
    assert!(matches!(unknown, RuntimeError::Usage(UsageError::UnknownSkill(_))));
}

#[tokio::test]
async fn duplicate_task_id_is_rejected() {
    let harness = harness(vec![ModelResponse::final_text("Done.", usage(10, 2))]);
    let mut request = start("triage", "Hi");
    request.task_id = Some(TaskId("task_fixed".to_string()));
    let prepared = harness.runtime.prepare_start(request.clone()).await.expect("prepare");
    harness.runtime.run(prepared, &InMemoryEventSink::default()).await.expect("run");

    let error = harness.runtime.prepare_start(request).await.expect_err("duplicate");
    assert!(matches!(error, RuntimeError::Usage(UsageError::DuplicateTask(_))));
}

struct BrokenTaskRepository;

#[async_trait]
impl TaskRepository for BrokenTaskRepository {
    async fn find_by_id(&self, _id: &TaskId) -> Result<Option<Task>, RepositoryError> {
        Ok(None)
    }

    async fn save(&self, _task: Task) -> Result<(), RepositoryError> {
        Err(RepositoryError::Decode("disk full".to_string()))
    }
}

#[tokio::test]
async fn persistence_failure_returns_error_and_closes_stream_once() {
    let model = Arc::new(ScriptedModelClient::new([final_answer("unused")]));
    let tasks = Arc::new(BrokenTaskRepository);
    let runtime = bare_runtime(model.clone(), tasks, skill("summarize", &[]));
    let sink = InMemoryEventSink::default();

    let prepared = runtime.prepare_start(start("summarize", "Summarize")).await.expect("prepare");
    let error = runtime.run(prepared, &sink).await.expect_err("persistence failure");

    assert!(matches!(error, RuntimeError::Persistence(_)));
    assert_eq!(sink.names(), vec!["error"]);
    assert_eq!(model.call_count(), 0);
}

fn final_answer(text: &str) -> ModelResponse {
    ModelResponse::final_text(text, usage(5, 2))
}

fn bare_runtime(
    model: Arc<ScriptedModelClient>,
    tasks: Arc<dyn TaskRepository>,
    skill: Skill,
) -> AgentRuntime {
    AgentRuntime::new(RuntimeDeps {
        model,
        tools: Arc::new(ToolRegistry::with_think()),
        tasks,
        skills: Arc::new(InMemorySkillRepository::with_skills([skill])),
        budget: Arc::new(UnlimitedBudget),
        usage_sink: Arc::new(InMemoryUsageLedger::default()),
        settings: RuntimeSettings::default(),
    })
}

#[tokio::test]
async fn default_settings_stop_an_endless_tool_loop_at_ten_model_calls() {
    let endless: Vec<ModelResponse> = (0..12)
        .map(|turn| {
            let id = format!("toolu_{turn}");
            let call = (id.as_str(), "think", json!({ "reasoning": "one more look" }));
            ModelResponse::tool_use(None, vec![call], usage(10, 5))
        })
        .collect();
    let model = Arc::new(ScriptedModelClient::new(endless));
    let tasks = Arc::new(InMemoryTaskRepository::default());
    let runtime = bare_runtime(model.clone(), tasks.clone(), skill("ponder", &["think"]));
    let sink = InMemoryEventSink::default();

    let prepared = runtime.prepare_start(start("ponder", "Keep thinking")).await.expect("prepare");
    let report = runtime.run(prepared, &sink).await.expect("run");

    assert!(matches!(report.outcome, RunOutcome::Failed { .. }));
    assert_eq!(model.call_count(), 10);
    assert_eq!(report.iteration_count, 10);
    assert_eq!(sink.count("error"), 1);
    assert_eq!(sink.count("complete"), 0);
    let task = tasks.find_by_id(&report.task_id).await.expect("load").expect("stored");
    assert_eq!(task.status, TaskStatus::Failed);
}

/// Fails `failures` consecutive saves starting at save number `first_failing` (1-based).
struct FlakyTaskRepository {
    inner: InMemoryTaskRepository,
    saves: AtomicUsize,
    first_failing: usize,
    failures: usize,
}

impl FlakyTaskRepository {
    fn new(first_failing: usize, failures: usize) -> Self {
        Self {
            inner: InMemoryTaskRepository::default(),
            saves: AtomicUsize::new(0),
            first_failing,
            failures,
        }
    }
}

#[async_trait]
impl TaskRepository for FlakyTaskRepository {
    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn save(&self, task: Task) -> Result<(), RepositoryError> {
        let attempt = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if (self.first_failing..self.first_failing + self.failures).contains(&attempt) {
            return Err(RepositoryError::Decode("database is locked".to_string()));
        }
        self.inner.save(task).await
    }
}

#[tokio::test]
async fn final_save_is_retried_once_before_completing() {
    let model = Arc::new(ScriptedModelClient::new([final_answer("Done.")]));
    let tasks = Arc::new(FlakyTaskRepository::new(2, 1));
    let runtime = bare_runtime(model, tasks.clone(), skill("summarize", &[]));
    let sink = InMemoryEventSink::default();

    let prepared = runtime.prepare_start(start("summarize", "Summarize")).await.expect("prepare");
    let report = runtime.run(prepared, &sink).await.expect("retry succeeds");

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(tasks.saves.load(Ordering::SeqCst), 3);
    assert_eq!(sink.count("complete"), 1);
    let task = tasks.find_by_id(&report.task_id).await.expect("load").expect("stored");
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn final_save_failing_twice_leaves_the_task_stranded_as_running() {
    let model = Arc::new(ScriptedModelClient::new([final_answer("Done.")]));
    let tasks = Arc::new(FlakyTaskRepository::new(2, 2));
    let runtime = bare_runtime(model, tasks.clone(), skill("summarize", &[]));
    let sink = InMemoryEventSink::default();

    let prepared = runtime.prepare_start(start("summarize", "Summarize")).await.expect("prepare");
    let task_id = prepared.task_id().clone();
    let error = runtime.run(prepared, &sink).await.expect_err("both saves fail");

    assert!(matches!(error, RuntimeError::Persistence(_)));
    assert_eq!(tasks.saves.load(Ordering::SeqCst), 3);
    assert_eq!(sink.count("complete"), 0);
    assert_eq!(sink.count("error"), 1);
    let task = tasks.find_by_id(&task_id).await.expect("load").expect("stored");
    assert_eq!(task.status, TaskStatus::Running);
}
