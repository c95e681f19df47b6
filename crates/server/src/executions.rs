use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use boardwright_agent::{AgentRuntime, ChannelEventSink, PreparedRun, RuntimeError};
use boardwright_core::domain::execution::{ConfirmationDecision, ResumeRequest, StartRequest};
use boardwright_core::domain::skill::SkillId;
use boardwright_core::domain::task::{
    BoardId, CardId, PendingConfirmation, Task, TaskId, TaskStatus, UserId,
};
use boardwright_core::errors::{ApplicationError, ErrorKind, InterfaceError, UsageError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Task ids with a run in flight. A claim is released when its guard drops.
#[derive(Clone, Default)]
pub struct ActiveRuns {
    inner: Arc<Mutex<HashSet<String>>>,
}

pub struct RunClaim {
    task_id: String,
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ActiveRuns {
    pub fn try_claim(&self, task_id: &str) -> Option<RunClaim> {
        let mut active = match self.inner.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !active.insert(task_id.to_string()) {
            return None;
        }
        Some(RunClaim { task_id: task_id.to_string(), inner: Arc::clone(&self.inner) })
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        match self.inner.lock() {
            Ok(active) => active.contains(task_id),
            Err(poisoned) => poisoned.into_inner().contains(task_id),
        }
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        match self.inner.lock() {
            Ok(mut active) => active.remove(&self.task_id),
            Err(poisoned) => poisoned.into_inner().remove(&self.task_id),
        };
    }
}

#[derive(Clone)]
pub struct ExecutionState {
    pub runtime: Arc<AgentRuntime>,
    pub active: ActiveRuns,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub task_id: Option<String>,
    pub execution_id: Option<String>,
    pub skill_id: Option<String>,
    pub user_id: Option<String>,
    pub card_id: Option<String>,
    pub board_id: Option<String>,
    pub board_agent_id: Option<String>,
    pub input_message: Option<String>,
    pub input_prompt: Option<String>,
    pub max_iterations: Option<u32>,
    pub confirmed_tool_call_id: Option<String>,
    pub rejected_tool_call_id: Option<String>,
}

enum Inbound {
    Start(StartRequest),
    Resume(ResumeRequest),
}

impl ExecutionRequest {
    fn existing_task_id(&self) -> Option<String> {
        non_blank(self.execution_id.clone()).or_else(|| non_blank(self.task_id.clone()))
    }

    fn into_inbound(self) -> Result<Inbound, UsageError> {
        let task_id = self.existing_task_id();
        let decision = ConfirmationDecision::from_fields(
            self.confirmed_tool_call_id,
            self.rejected_tool_call_id,
        )?;

        if let Some(decision) = decision {
            let task_id = task_id.ok_or(UsageError::MissingField("taskId"))?;
            return Ok(Inbound::Resume(ResumeRequest { task_id: TaskId(task_id), decision }));
        }

        let skill_id = non_blank(self.skill_id).ok_or(UsageError::MissingField("skillId"))?;
        let user_id = non_blank(self.user_id).ok_or(UsageError::MissingField("userId"))?;

        Ok(Inbound::Start(StartRequest {
            task_id: task_id.map(TaskId),
            skill_id: SkillId(skill_id),
            user_id: UserId(user_id),
            card_id: non_blank(self.card_id).map(CardId),
            board_id: non_blank(self.board_id).map(BoardId),
            board_agent_id: non_blank(self.board_agent_id),
            input_message: non_blank(self.input_message).or_else(|| non_blank(self.input_prompt)),
            max_iterations: self.max_iterations,
        }))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub skill_id: String,
    pub status: TaskStatus,
    pub in_flight: bool,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tool_call_count: u32,
    pub cost_usd: String,
    pub pending_confirmation: Option<PendingConfirmationView>,
    pub final_output: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: String,
}

impl From<Task> for TaskSummary {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id.0,
            skill_id: task.skill_id.0,
            status: task.status,
            in_flight: false,
            iteration_count: task.iteration_count,
            max_iterations: task.max_iterations,
            input_tokens: task.usage.input_tokens,
            output_tokens: task.usage.output_tokens,
            tool_call_count: task.usage.tool_call_count,
            cost_usd: task.usage.cost_usd.to_string(),
            pending_confirmation: task.pending_confirmation.map(PendingConfirmationView::from),
            final_output: task.final_output,
            last_error: task.last_error,
            updated_at: task.updated_at.to_rfc3339(),
        }
    }
}

/// The gated call a suspended task waits on, keyed the same way as the rest of the summary.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConfirmationView {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub prompt: String,
}

impl From<PendingConfirmation> for PendingConfirmationView {
    fn from(pending: PendingConfirmation) -> Self {
        Self {
            tool_call_id: pending.tool_call_id.0,
            tool_name: pending.tool_name,
            input: pending.input,
            prompt: pending.prompt,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: &'static str,
    pub detail: String,
    pub correlation_id: String,
}

pub struct ApiError(InterfaceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorBody {
            error: self.0.kind.public_message(),
            detail: self.0.to_string(),
            correlation_id: self.0.correlation_id,
        };
        (status, Json(body)).into_response()
    }
}

fn api_error(error: impl Into<ApplicationError>, correlation_id: &str) -> ApiError {
    let interface = error.into().into_interface(correlation_id);
    tracing::warn!(
        event_name = "http.execution.rejected",
        correlation_id = %correlation_id,
        error = %interface,
        "execution request rejected"
    );
    ApiError(interface)
}

fn conflict(task_id: &str, correlation_id: &str) -> ApiError {
    tracing::warn!(
        event_name = "http.execution.conflict",
        correlation_id = %correlation_id,
        task_id = %task_id,
        "run already in progress"
    );
    ApiError(InterfaceError::new(
        ErrorKind::Conflict,
        format!("task `{task_id}` already has a run in progress"),
        correlation_id,
    ))
}

fn malformed_body(rejection: &JsonRejection, correlation_id: &str) -> ApiError {
    tracing::warn!(
        event_name = "http.execution.malformed",
        correlation_id = %correlation_id,
        status = rejection.status().as_u16(),
        error = %rejection.body_text(),
        "request body is not a valid execution request"
    );
    ApiError(InterfaceError::new(ErrorKind::BadRequest, rejection.body_text(), correlation_id))
}

pub fn router(state: ExecutionState) -> Router {
    Router::new()
        .route("/api/v1/executions", post(create_execution))
        .route("/api/v1/executions/{task_id}", get(get_execution))
        .with_state(state)
}

/// Starts or resumes a run and streams its lifecycle events as SSE. Validation
/// failures return synchronously before any model call.
pub async fn create_execution(
    State(state): State<ExecutionState>,
    body: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let Json(body) = body.map_err(|rejection| malformed_body(&rejection, &correlation_id))?;

    // Claim a known id before loading it so concurrent resumes cannot both pass validation.
    let early_claim = match body.existing_task_id() {
        Some(task_id) => {
            let claim = state.active.try_claim(&task_id);
            Some(claim.ok_or_else(|| conflict(&task_id, &correlation_id))?)
        }
        None => None,
    };

    let inbound = body.into_inbound().map_err(|error| api_error(error, &correlation_id))?;
    let prepared = match inbound {
        Inbound::Start(request) => state.runtime.prepare_start(request).await,
        Inbound::Resume(request) => state.runtime.prepare_resume(request).await,
    }
    .map_err(|error| api_error(error, &correlation_id))?;

    let claim = match early_claim {
        Some(claim) => claim,
        None => {
            let task_id = prepared.task_id().0.clone();
            state.active.try_claim(&task_id).ok_or_else(|| conflict(&task_id, &correlation_id))?
        }
    };

    tracing::info!(
        event_name = "http.execution.accepted",
        correlation_id = %correlation_id,
        task_id = %prepared.task_id(),
        resume = prepared.is_resume(),
        "execution accepted"
    );

    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(drive(Arc::clone(&state.runtime), prepared, ChannelEventSink::new(sender), claim));

    let stream = UnboundedReceiverStream::new(receiver).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event(event.name()).data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}

async fn drive(
    runtime: Arc<AgentRuntime>,
    prepared: PreparedRun,
    sink: ChannelEventSink,
    claim: RunClaim,
) {
    let task_id = prepared.task_id().clone();
    let result = runtime.run(prepared, &sink).await;
    // Release before the stream closes so a client reacting to the last event can resume.
    drop(claim);
    drop(sink);

    if let Err(error) = result {
        let severity = match &error {
            RuntimeError::Persistence(_) => "persistence",
            RuntimeError::Usage(_) | RuntimeError::Lifecycle(_) => "internal",
        };
        tracing::error!(
            event_name = "http.execution.failed",
            task_id = %task_id,
            severity,
            error = %error,
            "run ended without a persisted outcome"
        );
    }
}

pub async fn get_execution(
    State(state): State<ExecutionState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskSummary>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let task = state
        .runtime
        .tasks()
        .find_by_id(&TaskId(task_id.clone()))
        .await
        .map_err(|error| {
            api_error(ApplicationError::Persistence(error.to_string()), &correlation_id)
        })?
        .ok_or_else(|| api_error(UsageError::UnknownTask(task_id), &correlation_id))?;

    let mut summary = TaskSummary::from(task);
    summary.in_flight = state.active.is_active(&summary.task_id);
    Ok(Json(summary))
}
