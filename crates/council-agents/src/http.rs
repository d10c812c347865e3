//! HTTP facade — synchronous, asynchronous, and streaming entry points
//! over the deliberation engine, plus the studio surface (prompts,
//! experiments, metrics).
//!
//! Status conventions: 400 invalid request, 404 unknown entity, 409 state
//! conflict, 429 budget exhausted before completion, 500 internal,
//! 504 session deadline exceeded.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use deliberation::{
    AgentId, EventFilter, FailureReason, FinalResult, PromptType, Session, SessionSettings,
    SessionStatus, StoreError, TaskType,
};

use crate::config::CouncilConfig;
use crate::engine::{DeliberationEngine, EngineError};
use crate::experiments::{ExperimentError, ExperimentService};
use crate::telemetry::{aggregate, MetricsPeriod};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DeliberationEngine>,
    pub experiments: Arc<ExperimentService>,
    pub config: Arc<CouncilConfig>,
    /// Cancellation handles for sessions the facade started.
    tasks: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl AppState {
    pub fn new(
        engine: Arc<DeliberationEngine>,
        experiments: Arc<ExperimentService>,
        config: Arc<CouncilConfig>,
    ) -> Self {
        Self {
            engine,
            experiments,
            config,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Error envelope returned by every endpoint.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(_) => Self::not_found(e.to_string()),
            EngineError::Conflict(_) => Self::conflict(e.to_string()),
            EngineError::InvalidSettings(_) => Self::bad_request(e.to_string()),
            EngineError::Store(_) => Self::internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Self::not_found(e.to_string()),
            StoreError::Conflict(_) => Self::conflict(e.to_string()),
            StoreError::InvalidRecord(_) => Self::bad_request(e.to_string()),
            StoreError::LockPoisoned => Self::internal(e.to_string()),
        }
    }
}

impl From<ExperimentError> for ApiError {
    fn from(e: ExperimentError) -> Self {
        match e {
            ExperimentError::NotFound(_) | ExperimentError::UnknownVariant(_) => {
                Self::not_found(e.to_string())
            }
            ExperimentError::Concluded(_) => Self::conflict(e.to_string()),
            ExperimentError::NoRuns | ExperimentError::Invalid(_) => {
                Self::bad_request(e.to_string())
            }
            ExperimentError::LockPoisoned => Self::internal(e.to_string()),
        }
    }
}

// ── Request/response shapes ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    task: String,
    task_type: TaskType,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    max_iterations: Option<u32>,
    #[serde(default)]
    consensus_threshold: Option<f64>,
    #[serde(default)]
    budget_usd: Option<f64>,
    #[serde(default)]
    enabled_agents: Option<Vec<AgentId>>,
    #[serde(default)]
    models: Option<BTreeMap<AgentId, String>>,
    #[serde(default)]
    temperature: Option<f64>,
}

impl AnalyzeRequest {
    fn into_session(self) -> Result<Session, ApiError> {
        if self.task.trim().is_empty() {
            return Err(ApiError::bad_request("task must not be empty"));
        }
        let mut settings = SessionSettings::default();
        if let Some(agents) = self.enabled_agents {
            settings.enabled_agents = agents;
        }
        if let Some(models) = self.models {
            settings.models = models;
        }
        if let Some(temperature) = self.temperature {
            settings.temperature = temperature;
        }
        if let Some(max_iterations) = self.max_iterations {
            settings.max_iterations = max_iterations;
        }
        if let Some(threshold) = self.consensus_threshold {
            settings.consensus_threshold = threshold;
        }
        if let Some(budget) = self.budget_usd {
            settings.budget_usd = budget;
        }
        settings.validate().map_err(ApiError::bad_request)?;

        let mut session = Session::new(&self.task, self.task_type, settings);
        if let Some(context) = self.context {
            session = session.with_context(&context);
        }
        Ok(session)
    }
}

#[derive(Debug, Serialize)]
struct AgentInfo {
    id: AgentId,
    role: &'static str,
    default_model: String,
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct TaskStatusResponse {
    status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<FinalResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    source: String,
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptPublishRequest {
    agent_id: AgentId,
    prompt_type: PromptType,
    content: String,
}

#[derive(Debug, Deserialize)]
struct PromptActivateRequest {
    agent_id: AgentId,
    prompt_type: PromptType,
    version: u32,
}

#[derive(Debug, Deserialize)]
struct ExperimentCreateRequest {
    name: String,
    agent_id: AgentId,
    prompt_type: PromptType,
    variants: Vec<String>,
}

/// PUT /studio/experiments either records a run or promotes the winner.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExperimentUpdateRequest {
    Run {
        id: String,
        variant_id: String,
        test_input: String,
        quality_score: f64,
        latency_ms: u64,
        cost_usd: f64,
    },
    Promote {
        id: String,
        promote: bool,
    },
}

#[derive(Debug, Deserialize)]
struct ExperimentDeleteQuery {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    period: String,
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut agents = Vec::new();
    for agent in AgentId::ALL {
        let reachable = match state.engine.runner().adapter(agent) {
            Some(adapter) => adapter.reachable().await,
            None => false,
        };
        agents.push(json!({
            "id": agent,
            "role": agent.role(),
            "model": state.config.endpoint(agent).model,
            "reachable": reachable,
        }));
    }
    Json(json!({
        "status": "ok",
        "source": state.engine.store().source().to_string(),
        "agents": agents,
    }))
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentInfo>> {
    Json(
        AgentId::ALL
            .iter()
            .map(|agent| AgentInfo {
                id: *agent,
                role: agent.role(),
                default_model: state.config.endpoint(*agent).model.clone(),
                enabled: true,
            })
            .collect(),
    )
}

/// Map a terminal result to the response status the exit conventions
/// demand: 429 for budget exhaustion, 504 for the session deadline, 200
/// otherwise (failures still carry the partial result and error block).
fn result_status(result: &FinalResult) -> StatusCode {
    match &result.error {
        Some(FailureReason::BudgetExhausted { .. }) => StatusCode::TOO_MANY_REQUESTS,
        Some(FailureReason::DeadlineExceeded) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::OK,
    }
}

async fn analyze_sync(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Response, ApiError> {
    let session = request.into_session()?;
    state.engine.store().create_session(&session)?;

    let cancel = CancellationToken::new();
    state
        .tasks
        .write()
        .await
        .insert(session.id.clone(), cancel.clone());

    let result = state.engine.run_session(&session.id, cancel).await;
    state.tasks.write().await.remove(&session.id);

    let result = result?;
    let status = result_status(&result);
    Ok((status, Json(result)).into_response())
}

async fn analyze_async(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = request.into_session()?;
    state.engine.store().create_session(&session)?;

    let cancel = CancellationToken::new();
    state
        .tasks
        .write()
        .await
        .insert(session.id.clone(), cancel.clone());

    let engine = state.engine.clone();
    let tasks = state.tasks.clone();
    let task_id = session.id.clone();
    let background_id = task_id.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.run_session(&background_id, cancel).await {
            warn!(session_id = %background_id, error = %e, "background session failed");
        }
        tasks.write().await.remove(&background_id);
    });

    Ok(Json(json!({ "task_id": task_id })))
}

async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let store = state.engine.store();
    let session = store
        .load_session(&id)
        .map_err(|_| ApiError::not_found(format!("unknown task: {id}")))?;

    let result = store.final_result(&id)?;
    let progress = if result.is_none() {
        Some(json!({
            "analyses": store.analyses(&id)?.len(),
            "critiques": store.critiques(&id)?.len(),
            "syntheses": store.syntheses(&id)?.len(),
        }))
    } else {
        None
    };
    let error = result
        .as_ref()
        .and_then(|r| r.error.as_ref())
        .map(|e| e.to_string());

    // Terminal results map to the same status codes as the sync endpoint.
    let http_status = result
        .as_ref()
        .map(result_status)
        .unwrap_or(StatusCode::OK);

    let body = TaskStatusResponse {
        status: session.status,
        progress,
        result,
        error,
        source: store.source().to_string(),
    };
    Ok((http_status, Json(body)).into_response())
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .engine
        .store()
        .load_session(&id)
        .map_err(|_| ApiError::not_found(format!("unknown task: {id}")))?;
    if session.status.is_terminal() {
        return Err(ApiError::conflict(format!(
            "session {id} is already {}",
            session.status
        )));
    }
    match state.tasks.read().await.get(&id) {
        Some(token) => {
            token.cancel();
            info!(session_id = %id, "cancellation requested");
            Ok(Json(json!({ "cancelled": true })))
        }
        None => Err(ApiError::conflict(format!("session {id} is not running"))),
    }
}

fn sse_stream(
    state: AppState,
    filter: EventFilter,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let session_scoped = filter.session_id.is_some();
    let receiver = state.engine.bus().subscribe_filtered(filter);
    futures::stream::unfold(
        (receiver, false),
        move |(mut receiver, done)| async move {
            if done {
                return None;
            }
            let event = receiver.recv().await?;
            // A session-scoped stream ends after the terminal event.
            let finished = session_scoped && event.is_terminal();
            let payload = serde_json::to_string(&event).unwrap_or_default();
            let sse_event = Event::default().event(event.event_type()).data(payload);
            Some((Ok(sse_event), (receiver, finished)))
        },
    )
}

async fn analyze_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut filter = EventFilter::new();
    if let Some(session_id) = query.session_id {
        filter = filter.session(&session_id);
    }
    Sse::new(sse_stream(state, filter))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

async fn list_prompts(State(state): State<AppState>) -> Json<serde_json::Value> {
    let templates = state.engine.runner().resolver().registry().list();
    Json(json!({
        "default_version": crate::prompts::PROMPT_VERSION,
        "templates": templates,
    }))
}

async fn publish_prompt(
    State(state): State<AppState>,
    Json(request): Json<PromptPublishRequest>,
) -> Result<Json<deliberation::PromptTemplate>, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("content must not be empty"));
    }
    let template = state
        .engine
        .runner()
        .resolver()
        .registry()
        .publish(request.agent_id, request.prompt_type, &request.content)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(template))
}

async fn activate_prompt(
    State(state): State<AppState>,
    Json(request): Json<PromptActivateRequest>,
) -> Result<Json<deliberation::PromptTemplate>, ApiError> {
    let template = state
        .engine
        .runner()
        .resolver()
        .registry()
        .activate(request.agent_id, request.prompt_type, request.version)
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    Ok(Json(template))
}

async fn list_experiments(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "experiments": state.experiments.list() }))
}

async fn create_experiment(
    State(state): State<AppState>,
    Json(request): Json<ExperimentCreateRequest>,
) -> Result<Json<crate::experiments::Experiment>, ApiError> {
    let experiment = state.experiments.create(
        &request.name,
        request.agent_id,
        request.prompt_type,
        request.variants,
    )?;
    Ok(Json(experiment))
}

async fn update_experiment(
    State(state): State<AppState>,
    Json(request): Json<ExperimentUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match request {
        ExperimentUpdateRequest::Run {
            id,
            variant_id,
            test_input,
            quality_score,
            latency_ms,
            cost_usd,
        } => {
            state.experiments.record_run(
                &id,
                &variant_id,
                &test_input,
                quality_score,
                latency_ms,
                cost_usd,
            )?;
            Ok(Json(json!({ "recorded": true })))
        }
        ExperimentUpdateRequest::Promote { id, promote } => {
            if !promote {
                return Err(ApiError::bad_request("promote must be true"));
            }
            let template = state.experiments.promote_winner(&id)?;
            Ok(Json(json!({ "promoted": template })))
        }
    }
}

async fn delete_experiment(
    State(state): State<AppState>,
    Query(query): Query<ExperimentDeleteQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.experiments.delete(&query.id)?;
    Ok(Json(json!({ "deleted": true })))
}

async fn studio_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let period: MetricsPeriod = query
        .period
        .parse()
        .map_err(|e: String| ApiError::bad_request(e))?;
    let metrics = state.engine.store().all_metrics()?;
    let summary = aggregate(&metrics, period, chrono::Utc::now());
    Ok(Json(json!({
        "source": state.engine.store().source().to_string(),
        "summary": summary,
    })))
}

// ── Router & server ─────────────────────────────────────────────────────

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .route("/analyze", axum::routing::post(analyze_sync))
        .route("/analyze/async", axum::routing::post(analyze_async))
        .route("/analyze/stream", get(analyze_stream))
        .route("/tasks/{id}", get(task_status))
        .route("/tasks/{id}/cancel", axum::routing::post(cancel_task))
        .route(
            "/studio/prompts",
            get(list_prompts)
                .post(publish_prompt)
                .put(activate_prompt),
        )
        .route(
            "/studio/experiments",
            get(list_experiments)
                .post(create_experiment)
                .put(update_experiment)
                .delete(delete_experiment),
        )
        .route("/studio/metrics", get(studio_metrics))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "council-agents listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
