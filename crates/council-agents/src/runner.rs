//! Agent runner — turns a logical agent call into a validated phase
//! payload.
//!
//! The runner owns everything between the engine and the wire: prompt
//! composition, the per-call deadline, exponential backoff on transient
//! transport errors, the one-shot strict-JSON reprompt on parse failure,
//! cost accounting, and RunMetric emission. Every attempt that reaches a
//! provider emits its own RunMetric, successful or not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use deliberation::{
    call_cost, parse_output, price_or_default, AgentId, DeliberationEvent, ModelPrice,
    ParseError, PhasePayload, RunMetric, RunPhase, RunStatus, Session, SessionStore,
    SharedEventBus,
};

use crate::config::EngineSettings;
use crate::prompts::{interpolate, PromptResolver, STRICT_JSON_SUFFIX};
use crate::providers::{ProviderAdapter, ProviderError, ProviderRequest, ProviderResponse};

/// Base delay for exponential backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Default completion budget per call.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// One logical call for the engine to dispatch.
pub struct AgentCall {
    pub agent: AgentId,
    pub phase: RunPhase,
    pub iteration: u32,
    /// Interpolation variables for the phase template.
    pub vars: Vec<(&'static str, String)>,
    /// Residual session deadline; the effective per-attempt deadline is
    /// `min(call_timeout, residual)`.
    pub residual: Duration,
    pub cancel: CancellationToken,
}

/// Validated output of a successful call.
#[derive(Debug, Clone)]
pub struct CallOutput {
    pub payload: PhasePayload,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_usd: f64,
    /// Wall-clock time across all attempts of this logical call.
    pub duration_ms: u64,
    pub warnings: Vec<String>,
}

/// Failure of a logical call after retries and the reprompt were spent.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("output failed validation: {0}")]
    Parse(#[from] ParseError),

    #[error("provider returned empty output")]
    EmptyOutput,

    #[error("call cancelled")]
    Cancelled,
}

impl RunnerError {
    fn metric_status(&self) -> RunStatus {
        match self {
            Self::Provider(ProviderError::Timeout { .. }) => RunStatus::Timeout,
            _ => RunStatus::Error,
        }
    }
}

/// Running token/cost tally across the attempts of one logical call.
#[derive(Debug, Default)]
struct AttemptTotals {
    tokens_in: u32,
    tokens_out: u32,
    cost_usd: f64,
}

/// Wraps the provider adapters with retry, parsing, and accounting.
pub struct AgentRunner {
    adapters: HashMap<AgentId, Arc<dyn ProviderAdapter>>,
    resolver: PromptResolver,
    store: Arc<dyn SessionStore>,
    bus: SharedEventBus,
    /// Soft cap on in-flight calls per provider endpoint.
    limits: HashMap<String, Arc<Semaphore>>,
    settings: EngineSettings,
}

impl AgentRunner {
    pub fn new(
        adapters: HashMap<AgentId, Arc<dyn ProviderAdapter>>,
        resolver: PromptResolver,
        store: Arc<dyn SessionStore>,
        bus: SharedEventBus,
        settings: EngineSettings,
    ) -> Self {
        let mut limits = HashMap::new();
        for adapter in adapters.values() {
            limits
                .entry(adapter.endpoint_name().to_string())
                .or_insert_with(|| {
                    Arc::new(Semaphore::new(settings.max_in_flight_per_provider))
                });
        }
        Self {
            adapters,
            resolver,
            store,
            bus,
            limits,
            settings,
        }
    }

    /// The prompt resolver, for studio endpoints.
    pub fn resolver(&self) -> &PromptResolver {
        &self.resolver
    }

    /// Adapter bound to an agent, for health probes.
    pub fn adapter(&self, agent: AgentId) -> Option<&Arc<dyn ProviderAdapter>> {
        self.adapters.get(&agent)
    }

    fn backoff_delay(attempt: u32) -> Duration {
        let base = BACKOFF_BASE.as_millis() as u64 * (1u64 << attempt.min(8));
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((base as f64 * jitter) as u64)
    }

    fn emit_metric(&self, session: &Session, metric: RunMetric) {
        if let Err(e) = self.store.append_metric(&metric) {
            warn!(session_id = %session.id, error = %e, "failed to persist run metric");
        }
        self.bus.publish(DeliberationEvent::Metric {
            session_id: session.id.clone(),
            metric,
            timestamp: Utc::now(),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn metric_for(
        &self,
        session: &Session,
        call: &AgentCall,
        model: &str,
        tokens: (u32, u32),
        cost_usd: f64,
        latency_ms: u64,
        status: RunStatus,
        error_message: Option<String>,
        warnings: Vec<String>,
    ) -> RunMetric {
        RunMetric {
            session_id: session.id.clone(),
            agent_id: call.agent,
            model: model.to_string(),
            phase: call.phase,
            tokens_in: tokens.0,
            tokens_out: tokens.1,
            cost_usd,
            latency_ms,
            status,
            error_message,
            warnings,
            created_at: Utc::now(),
        }
    }

    /// Account one provider response that reached us (parse outcome may
    /// still be a failure) and emit its RunMetric.
    #[allow(clippy::too_many_arguments)]
    fn account_response(
        &self,
        session: &Session,
        call: &AgentCall,
        price: ModelPrice,
        unknown_price: bool,
        response: &ProviderResponse,
        outcome: Result<&[String], &RunnerError>,
        latency_ms: u64,
        totals: &mut AttemptTotals,
    ) {
        let cost = call_cost(price, response.tokens_in, response.tokens_out);
        totals.tokens_in += response.tokens_in;
        totals.tokens_out += response.tokens_out;
        totals.cost_usd += cost;

        let mut warnings: Vec<String> = match outcome {
            Ok(parse_warnings) => parse_warnings.to_vec(),
            Err(_) => Vec::new(),
        };
        if unknown_price {
            warnings.push("unknown_model_price".to_string());
        }
        let (status, error_message) = match outcome {
            Ok(_) => (RunStatus::Success, None),
            Err(e) => (e.metric_status(), Some(e.to_string())),
        };

        let metric = self.metric_for(
            session,
            call,
            &response.model_id,
            (response.tokens_in, response.tokens_out),
            cost,
            latency_ms,
            status,
            error_message,
            warnings,
        );
        self.emit_metric(session, metric);
    }

    /// One transport attempt with the per-attempt deadline and
    /// cancellation linked in.
    async fn attempt(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse, RunnerError> {
        let _permit = tokio::select! {
            permit = self.limits[adapter.endpoint_name()].clone().acquire_owned() => {
                permit.expect("semaphore never closed")
            }
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
        };

        let deadline = request.deadline;
        tokio::select! {
            result = tokio::time::timeout(deadline, adapter.invoke(request)) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(RunnerError::Provider(e)),
                Err(_) => Err(RunnerError::Provider(ProviderError::Timeout {
                    elapsed_ms: deadline.as_millis() as u64,
                })),
            },
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
        }
    }

    /// Invoke with backoff on transient errors. Emits a RunMetric for
    /// every failed attempt; the successful response is accounted by the
    /// caller once its parse outcome is known.
    async fn invoke_with_retry(
        &self,
        session: &Session,
        call: &AgentCall,
        adapter: &Arc<dyn ProviderAdapter>,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, RunnerError> {
        let mut attempt_no = 0u32;
        loop {
            let started = Instant::now();
            match self.attempt(adapter, request.clone(), &call.cancel).await {
                Ok(response) => return Ok(response),
                Err(RunnerError::Cancelled) => return Err(RunnerError::Cancelled),
                Err(err) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let transient = matches!(
                        &err,
                        RunnerError::Provider(e) if e.is_transient()
                    );
                    let metric = self.metric_for(
                        session,
                        call,
                        &request.model,
                        (0, 0),
                        0.0,
                        latency_ms,
                        err.metric_status(),
                        Some(err.to_string()),
                        Vec::new(),
                    );
                    self.emit_metric(session, metric);

                    if !transient || attempt_no >= self.settings.max_retries {
                        return Err(err);
                    }
                    let delay = Self::backoff_delay(attempt_no);
                    warn!(
                        session_id = %session.id,
                        agent = %call.agent,
                        phase = %call.phase,
                        attempt = attempt_no + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider error, backing off"
                    );
                    attempt_no += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = call.cancel.cancelled() => return Err(RunnerError::Cancelled),
                    }
                }
            }
        }
    }

    /// Run one logical agent call to a validated payload.
    pub async fn run(&self, session: &Session, call: AgentCall) -> Result<CallOutput, RunnerError> {
        let adapter = self
            .adapters
            .get(&call.agent)
            .expect("every agent has an adapter")
            .clone();

        let model = session.settings.model_for(call.agent).to_string();
        let system_prompt = self.resolver.system_prompt(call.agent);
        let template = self.resolver.phase_template(call.agent, call.phase);
        let var_refs: Vec<(&str, &str)> =
            call.vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let user_prompt = interpolate(&template, &var_refs);

        let deadline = Duration::from_secs(self.settings.call_timeout_secs).min(call.residual);
        if deadline.is_zero() {
            return Err(RunnerError::Cancelled);
        }

        let request = ProviderRequest {
            system_prompt,
            user_prompt,
            model: model.clone(),
            temperature: session.settings.temperature,
            max_tokens: DEFAULT_MAX_TOKENS,
            deadline,
        };

        let call_started = Instant::now();
        let (price, unknown_price) = price_or_default(&model);
        let mut totals = AttemptTotals::default();

        let response = self
            .invoke_with_retry(session, &call, &adapter, &request)
            .await?;
        let first_latency = call_started.elapsed().as_millis() as u64;

        let first_outcome = if response.text.trim().is_empty() {
            Err(RunnerError::EmptyOutput)
        } else {
            parse_output(call.phase, &response.text).map_err(RunnerError::Parse)
        };

        match first_outcome {
            Ok(parsed) => {
                self.account_response(
                    session,
                    &call,
                    price,
                    unknown_price,
                    &response,
                    Ok(&parsed.warnings),
                    first_latency,
                    &mut totals,
                );
                return Ok(CallOutput {
                    payload: parsed.payload,
                    tokens_in: totals.tokens_in,
                    tokens_out: totals.tokens_out,
                    cost_usd: totals.cost_usd,
                    duration_ms: call_started.elapsed().as_millis() as u64,
                    warnings: parsed.warnings,
                });
            }
            Err(err) => {
                self.account_response(
                    session,
                    &call,
                    price,
                    unknown_price,
                    &response,
                    Err(&err),
                    first_latency,
                    &mut totals,
                );
                if matches!(err, RunnerError::EmptyOutput) {
                    return Err(err);
                }
                debug!(
                    session_id = %session.id,
                    agent = %call.agent,
                    phase = %call.phase,
                    "parse failed, reprompting with strict-JSON suffix"
                );
            }
        }

        // One strict-JSON reprompt.
        let residual = call.residual.saturating_sub(call_started.elapsed());
        let reprompt_deadline =
            Duration::from_secs(self.settings.call_timeout_secs).min(residual);
        if reprompt_deadline.is_zero() {
            return Err(RunnerError::Cancelled);
        }
        // Raised completion budget covers the case where the first reply
        // was truncated at max_tokens rather than malformed.
        let reprompt = ProviderRequest {
            user_prompt: format!("{}{}", request.user_prompt, STRICT_JSON_SUFFIX),
            deadline: reprompt_deadline,
            max_tokens: request.max_tokens.saturating_mul(2),
            ..request.clone()
        };

        let reprompt_started = Instant::now();
        let response = self
            .invoke_with_retry(session, &call, &adapter, &reprompt)
            .await?;
        let reprompt_latency = reprompt_started.elapsed().as_millis() as u64;

        let outcome = if response.text.trim().is_empty() {
            Err(RunnerError::EmptyOutput)
        } else {
            parse_output(call.phase, &response.text).map_err(RunnerError::Parse)
        };

        match outcome {
            Ok(parsed) => {
                self.account_response(
                    session,
                    &call,
                    price,
                    unknown_price,
                    &response,
                    Ok(&parsed.warnings),
                    reprompt_latency,
                    &mut totals,
                );
                Ok(CallOutput {
                    payload: parsed.payload,
                    tokens_in: totals.tokens_in,
                    tokens_out: totals.tokens_out,
                    cost_usd: totals.cost_usd,
                    duration_ms: call_started.elapsed().as_millis() as u64,
                    warnings: parsed.warnings,
                })
            }
            Err(err) => {
                self.account_response(
                    session,
                    &call,
                    price,
                    unknown_price,
                    &response,
                    Err(&err),
                    reprompt_latency,
                    &mut totals,
                );
                Err(err)
            }
        }
    }
}
