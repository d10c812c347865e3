//! Deliberation engine — drives a session through Analyze → Critique →
//! Synthesize → Evaluate until consensus, budget, or the iteration cap
//! terminates it.
//!
//! Concurrency model: the engine task owns all session state; phases fan
//! out children (one per agent, or per ordered pair for critiques) and
//! rejoin at a barrier before the phase transition. Children never touch
//! the store — the engine persists surviving records after the barrier,
//! so strict happens-before holds between phases. Cancellation and the
//! session deadline propagate into every child call.
//!
//! Budget semantics: spend is re-derived from persisted RunMetrics before
//! every gate, so the ledger and the store cannot disagree. When the
//! budget is exhausted mid-debate, the engine stops issuing analyze and
//! critique calls but performs one final synthesis over what exists (the
//! `ε_last_call` grace) so the partial result is usable, then fails the
//! session with `budget_exhausted`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use deliberation::{
    calls_per_iteration, confidence_spread_agreement, AgentAnalysis, AgentId, BudgetLedger,
    ConsensusEvaluator, Critique, DeliberationEvent, DeliberationPhase, FailureReason,
    FinalResult, IterationOutcome, PhaseMachine, PhasePayload, RunPhase, RunStatus, RunTotals,
    Session, SessionStatus, SessionStore, SharedEventBus, StoreError, Synthesis,
    TerminationCause,
};

use crate::config::EngineSettings;
use crate::runner::{AgentCall, AgentRunner, CallOutput, RunnerError};

/// Engine-level failures surfaced to the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("state conflict: {0}")]
    Conflict(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// The deliberation engine. One instance serves all sessions; each run
/// owns its session exclusively for the duration.
pub struct DeliberationEngine {
    store: Arc<dyn SessionStore>,
    bus: SharedEventBus,
    runner: Arc<AgentRunner>,
    settings: EngineSettings,
}

impl DeliberationEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        bus: SharedEventBus,
        runner: Arc<AgentRunner>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            bus,
            runner,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn runner(&self) -> &Arc<AgentRunner> {
        &self.runner
    }

    /// Drive a pending session to a terminal state and return its final
    /// result. Running it again on a completed session is a no-op that
    /// returns the stored result.
    pub async fn run_session(
        &self,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<FinalResult, EngineError> {
        if let Some(existing) = self.store.final_result(session_id)? {
            debug!(session_id, "session already finalized, returning stored result");
            return Ok(existing);
        }

        let session = self
            .store
            .load_session(session_id)
            .map_err(|_| EngineError::NotFound(session_id.to_string()))?;

        if session.status == SessionStatus::Running {
            return Err(EngineError::Conflict(format!(
                "session {session_id} is already running"
            )));
        }
        if session.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "session {session_id} is already {}",
                session.status
            )));
        }
        session
            .settings
            .validate()
            .map_err(EngineError::InvalidSettings)?;

        self.store
            .update_status(session_id, SessionStatus::Running)?;

        let deadline = Instant::now() + Duration::from_secs(self.settings.session_timeout_secs);
        let result = self.drive(&session, deadline, cancel).await;

        match &result {
            Ok(final_result) => info!(
                session_id,
                status = %final_result.status,
                iterations = final_result.totals.iterations_used,
                cost_usd = final_result.totals.total_cost_usd,
                "session finished"
            ),
            Err(e) => {
                // Persistence failures end the session in Failed rather
                // than leaving it stuck in Running.
                error!(session_id, error = %e, "session aborted");
                let _ = self.store.update_status(session_id, SessionStatus::Failed);
            }
        }
        result
    }

    async fn drive(
        &self,
        session: &Session,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Result<FinalResult, EngineError> {
        let session = Arc::new(session.clone());
        let mut machine = PhaseMachine::new();
        let agents = session.settings.agents_in_order();
        let evaluator = ConsensusEvaluator::new(
            session.settings.consensus_threshold,
            session.settings.max_iterations,
        );
        let iteration_calls = calls_per_iteration(agents.len() as u32);

        machine
            .advance(
                DeliberationPhase::Analyzing,
                &format!("{} agents enabled", agents.len()),
            )
            .expect("pending always allows analyzing");

        loop {
            let iteration = machine.iteration();

            // ── Analyzing ────────────────────────────────────────────────
            if let Some(result) = self
                .check_boundary(&session, &mut machine, deadline, &cancel)
                .await?
            {
                return Ok(result);
            }
            self.emit_phase_start(&session, &machine);

            if self.ledger(&session)?.exhausted() {
                return self.budget_stop(&session, &mut machine).await;
            }

            let analyses = self
                .run_analyze_phase(&session, iteration, deadline, &cancel)
                .await?;

            let required = if agents.len() == 1 { 1 } else { 2 };
            if analyses.len() < required {
                if cancel.is_cancelled() {
                    return self
                        .finish_cancelled(&session, &mut machine, FailureReason::Cancelled)
                        .await;
                }
                let reason = FailureReason::PhaseStarved {
                    phase: "analyze".to_string(),
                    detail: format!(
                        "{} of {} analyses succeeded, need {required}",
                        analyses.len(),
                        agents.len()
                    ),
                };
                return self.finish_failed(&session, &mut machine, reason).await;
            }

            // ── Critiquing (skipped for a single surviving analysis) ─────
            let mut budget_stopped = false;
            if analyses.len() > 1 {
                machine
                    .advance(
                        DeliberationPhase::Critiquing,
                        &format!("{} analyses survived", analyses.len()),
                    )
                    .expect("analyzing allows critiquing");
                if let Some(result) = self
                    .check_boundary(&session, &mut machine, deadline, &cancel)
                    .await?
                {
                    return Ok(result);
                }
                self.emit_phase_start(&session, &machine);

                if self.ledger(&session)?.exhausted() {
                    warn!(
                        session_id = %session.id,
                        iteration,
                        "budget exhausted before critiques, skipping to grace synthesis"
                    );
                    budget_stopped = true;
                } else {
                    let surviving = self
                        .run_critique_phase(&session, iteration, &analyses, deadline, &cancel)
                        .await?;
                    // A collapsed critique wave degrades the iteration to
                    // analyses-only synthesis rather than failing the session;
                    // below the N−1 floor we say so loudly.
                    let floor = analyses.len().saturating_sub(1);
                    if surviving < floor {
                        warn!(
                            session_id = %session.id,
                            iteration,
                            surviving,
                            floor,
                            "critique wave below floor, synthesizing from analyses only"
                        );
                    }
                }
            }

            // ── Synthesizing ─────────────────────────────────────────────
            machine
                .advance(DeliberationPhase::Synthesizing, "debate phase done")
                .expect("analyzing/critiquing allow synthesizing");
            if let Some(result) = self
                .check_boundary(&session, &mut machine, deadline, &cancel)
                .await?
            {
                return Ok(result);
            }
            self.emit_phase_start(&session, &machine);

            let synthesis = match self
                .run_synthesize_phase(&session, iteration, deadline, &cancel)
                .await?
            {
                Some(synthesis) => synthesis,
                None => {
                    if cancel.is_cancelled() {
                        return self
                            .finish_cancelled(&session, &mut machine, FailureReason::Cancelled)
                            .await;
                    }
                    let reason = FailureReason::PhaseStarved {
                        phase: "synthesize".to_string(),
                        detail: "synthesizer call failed".to_string(),
                    };
                    return self.finish_failed(&session, &mut machine, reason).await;
                }
            };

            if budget_stopped {
                let ledger = self.ledger(&session)?;
                let reason = FailureReason::BudgetExhausted {
                    spent_usd: ledger.spent_usd,
                    budget_usd: ledger.budget_usd,
                };
                return self.finish_failed(&session, &mut machine, reason).await;
            }

            // ── Evaluating ───────────────────────────────────────────────
            machine
                .advance(DeliberationPhase::Evaluating, "synthesis persisted")
                .expect("synthesizing allows evaluating");
            let ledger = self.ledger(&session)?;

            if ledger.exhausted() {
                let reason = FailureReason::BudgetExhausted {
                    spent_usd: ledger.spent_usd,
                    budget_usd: ledger.budget_usd,
                };
                return self.finish_failed(&session, &mut machine, reason).await;
            }

            let decision = evaluator.decide(
                synthesis.consensus_level,
                iteration,
                &ledger,
                iteration_calls,
            );
            self.bus.publish(DeliberationEvent::IterationComplete {
                session_id: session.id.clone(),
                iteration,
                decision,
                timestamp: Utc::now(),
            });
            info!(
                session_id = %session.id,
                iteration,
                consensus = synthesis.consensus_level,
                ?decision,
                "iteration evaluated"
            );

            match decision {
                IterationOutcome::Refine => {
                    machine
                        .advance(
                            DeliberationPhase::Refining,
                            &format!(
                                "consensus {:.2} below threshold {:.2}",
                                synthesis.consensus_level, session.settings.consensus_threshold
                            ),
                        )
                        .expect("evaluating allows refining");
                    machine
                        .advance(DeliberationPhase::Analyzing, "refinement granted")
                        .expect("refining allows analyzing");
                }
                IterationOutcome::Terminate(cause) => {
                    return self
                        .finish_completed(&session, &mut machine, cause)
                        .await;
                }
            }
        }
    }

    // ── Phase fan-outs ──────────────────────────────────────────────────

    async fn run_analyze_phase(
        &self,
        session: &Arc<Session>,
        iteration: u32,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<AgentAnalysis>, EngineError> {
        let agents = session.settings.agents_in_order();
        let previous_synthesis = if iteration > 1 {
            self.store
                .syntheses(&session.id)?
                .into_iter()
                .find(|s| s.iteration == iteration - 1)
        } else {
            None
        };
        let previous_critiques = if iteration > 1 {
            self.store
                .critiques(&session.id)?
                .into_iter()
                .filter(|c| c.iteration == iteration - 1)
                .collect()
        } else {
            Vec::new()
        };

        let mut join_set: JoinSet<(AgentId, Result<CallOutput, RunnerError>)> = JoinSet::new();
        for agent in agents {
            let vars = analyze_vars(session, agent, previous_synthesis.as_ref(), &previous_critiques);
            let call = AgentCall {
                agent,
                phase: RunPhase::Analyze,
                iteration,
                vars,
                residual: residual_of(deadline),
                cancel: cancel.child_token(),
            };
            let runner = self.runner.clone();
            let session = session.clone();
            join_set.spawn(async move { (agent, runner.run(&session, call).await) });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(session_id = %session.id, error = %e, "analysis task panicked"),
            }
        }
        // Persist in canonical order regardless of completion order.
        outcomes.sort_by_key(|(agent, _)| *agent);

        let mut analyses = Vec::new();
        for (agent, outcome) in outcomes {
            match outcome {
                Ok(output) => {
                    self.emit_agent_completed(
                        session,
                        agent,
                        RunPhase::Analyze,
                        iteration,
                        output.duration_ms,
                        RunStatus::Success,
                    );
                    let analysis = analysis_from_output(session, agent, iteration, &output);
                    self.store.append_analysis(&analysis)?;
                    analyses.push(analysis);
                }
                Err(RunnerError::Cancelled) => {
                    debug!(session_id = %session.id, agent = %agent, "analysis cancelled");
                }
                Err(e) => {
                    self.emit_agent_completed(
                        session,
                        agent,
                        RunPhase::Analyze,
                        iteration,
                        0,
                        match e {
                            RunnerError::Provider(ref p)
                                if matches!(
                                    p,
                                    crate::providers::ProviderError::Timeout { .. }
                                ) =>
                            {
                                RunStatus::Timeout
                            }
                            _ => RunStatus::Error,
                        },
                    );
                    warn!(session_id = %session.id, agent = %agent, error = %e, "analysis failed");
                }
            }
        }
        Ok(analyses)
    }

    /// Dispatch all ordered-pair critiques; returns how many survived.
    async fn run_critique_phase(
        &self,
        session: &Arc<Session>,
        iteration: u32,
        analyses: &[AgentAnalysis],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<usize, EngineError> {
        let mut join_set: JoinSet<((AgentId, AgentId), Result<CallOutput, RunnerError>)> =
            JoinSet::new();
        for critic in analyses.iter().map(|a| a.agent_id) {
            for target in analyses.iter().map(|a| a.agent_id) {
                if critic == target {
                    continue;
                }
                let vars = critique_vars(session, analyses, target);
                let call = AgentCall {
                    agent: critic,
                    phase: RunPhase::Critique,
                    iteration,
                    vars,
                    residual: residual_of(deadline),
                    cancel: cancel.child_token(),
                };
                let runner = self.runner.clone();
                let session = session.clone();
                join_set
                    .spawn(async move { ((critic, target), runner.run(&session, call).await) });
            }
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(session_id = %session.id, error = %e, "critique task panicked"),
            }
        }
        outcomes.sort_by_key(|((from, to), _)| (*from, *to));

        let mut surviving = 0usize;
        for ((from, to), outcome) in outcomes {
            match outcome {
                Ok(output) => {
                    if let PhasePayload::Critique(payload) = &output.payload {
                        let critique = Critique {
                            session_id: session.id.clone(),
                            iteration,
                            from_agent: from,
                            to_agent: to,
                            score: payload.score,
                            critique_text: payload.critique.clone(),
                            weaknesses: payload.weaknesses.clone(),
                            strengths: payload.strengths.clone(),
                            created_at: Utc::now(),
                        };
                        self.store.append_critique(&critique)?;
                        surviving += 1;
                        self.emit_agent_completed(
                            session,
                            from,
                            RunPhase::Critique,
                            iteration,
                            output.duration_ms,
                            RunStatus::Success,
                        );
                        self.bus.publish(DeliberationEvent::CritiqueCompleted {
                            session_id: session.id.clone(),
                            iteration,
                            from,
                            to,
                            timestamp: Utc::now(),
                        });
                    }
                }
                Err(RunnerError::Cancelled) => {
                    debug!(session_id = %session.id, from = %from, to = %to, "critique cancelled");
                }
                Err(e) => {
                    // A single bad critique is an expected value, not an
                    // unwind; it is simply omitted.
                    warn!(
                        session_id = %session.id,
                        from = %from,
                        to = %to,
                        error = %e,
                        "critique failed, omitting"
                    );
                }
            }
        }
        Ok(surviving)
    }

    async fn run_synthesize_phase(
        &self,
        session: &Arc<Session>,
        iteration: u32,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<Synthesis>, EngineError> {
        let analyses: Vec<AgentAnalysis> = self
            .store
            .analyses(&session.id)?
            .into_iter()
            .filter(|a| a.iteration == iteration)
            .collect();
        let critiques: Vec<Critique> = self
            .store
            .critiques(&session.id)?
            .into_iter()
            .filter(|c| c.iteration == iteration)
            .collect();

        let synthesizer = session.settings.synthesizer;
        let call = AgentCall {
            agent: synthesizer,
            phase: RunPhase::Synthesize,
            iteration,
            vars: synthesis_vars(session, iteration, &analyses, &critiques),
            residual: residual_of(deadline),
            cancel: cancel.child_token(),
        };

        match self.runner.run(session, call).await {
            Ok(output) => {
                if let PhasePayload::Synthesis(payload) = &output.payload {
                    let synthesis = Synthesis {
                        session_id: session.id.clone(),
                        iteration,
                        summary: payload.summary.clone(),
                        conclusions: payload.conclusions.clone(),
                        recommendations: payload.recommendations.clone(),
                        formalized_result: payload.formalized_result.clone(),
                        consensus_level: payload.consensus_level,
                        created_at: Utc::now(),
                    };
                    self.store.append_synthesis(&synthesis)?;
                    self.emit_agent_completed(
                        session,
                        synthesizer,
                        RunPhase::Synthesize,
                        iteration,
                        output.duration_ms,
                        RunStatus::Success,
                    );
                    let confidences: Vec<f64> =
                        analyses.iter().map(|a| a.confidence).collect();
                    debug!(
                        session_id = %session.id,
                        iteration,
                        reported_consensus = synthesis.consensus_level,
                        advisory_spread_agreement = confidence_spread_agreement(&confidences),
                        "synthesis ready"
                    );
                    self.bus.publish(DeliberationEvent::SynthesisReady {
                        session_id: session.id.clone(),
                        iteration,
                        consensus: synthesis.consensus_level,
                        timestamp: Utc::now(),
                    });
                    Ok(Some(synthesis))
                } else {
                    Ok(None)
                }
            }
            Err(RunnerError::Cancelled) => Ok(None),
            Err(e) => {
                error!(session_id = %session.id, iteration, error = %e, "synthesis failed");
                Ok(None)
            }
        }
    }

    // ── Termination paths ───────────────────────────────────────────────

    /// Budget exhausted before any analyze call of this iteration could be
    /// issued. Prior iterations' records (including their syntheses) stay
    /// in the partial result.
    async fn budget_stop(
        &self,
        session: &Arc<Session>,
        machine: &mut PhaseMachine,
    ) -> Result<FinalResult, EngineError> {
        let ledger = self.ledger(session)?;
        let reason = FailureReason::BudgetExhausted {
            spent_usd: ledger.spent_usd,
            budget_usd: ledger.budget_usd,
        };
        self.finish_failed(session, machine, reason).await
    }

    async fn finish_completed(
        &self,
        session: &Arc<Session>,
        machine: &mut PhaseMachine,
        cause: TerminationCause,
    ) -> Result<FinalResult, EngineError> {
        machine
            .advance(DeliberationPhase::Completed, &cause.to_string())
            .expect("evaluating allows completed");
        let result = self
            .build_final(session, SessionStatus::Completed, machine, None)
            .await?;
        self.bus.publish(DeliberationEvent::SessionCompleted {
            session_id: session.id.clone(),
            iterations_used: machine.iteration(),
            timestamp: Utc::now(),
        });
        Ok(result)
    }

    async fn finish_failed(
        &self,
        session: &Arc<Session>,
        machine: &mut PhaseMachine,
        reason: FailureReason,
    ) -> Result<FinalResult, EngineError> {
        let _ = machine.fail(&reason.to_string());
        let result = self
            .build_final(session, SessionStatus::Failed, machine, Some(reason.clone()))
            .await?;
        self.bus.publish(DeliberationEvent::SessionFailed {
            session_id: session.id.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(result)
    }

    async fn finish_cancelled(
        &self,
        session: &Arc<Session>,
        machine: &mut PhaseMachine,
        reason: FailureReason,
    ) -> Result<FinalResult, EngineError> {
        // Explicit cancel and the session deadline are both cancellation;
        // only starvation, budget, and persistence end in Failed.
        let status = match reason {
            FailureReason::Cancelled | FailureReason::DeadlineExceeded => {
                let _ = machine.cancel(&reason.to_string());
                SessionStatus::Cancelled
            }
            _ => {
                let _ = machine.fail(&reason.to_string());
                SessionStatus::Failed
            }
        };
        let result = self
            .build_final(session, status, machine, Some(reason.clone()))
            .await?;
        match status {
            SessionStatus::Cancelled => self.bus.publish(DeliberationEvent::SessionCancelled {
                session_id: session.id.clone(),
                timestamp: Utc::now(),
            }),
            _ => self.bus.publish(DeliberationEvent::SessionFailed {
                session_id: session.id.clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            }),
        }
        Ok(result)
    }

    /// Persist the final result (including whatever completed) and move
    /// the session row to its terminal status.
    async fn build_final(
        &self,
        session: &Arc<Session>,
        status: SessionStatus,
        machine: &PhaseMachine,
        error: Option<FailureReason>,
    ) -> Result<FinalResult, EngineError> {
        let analyses = self.store.analyses(&session.id)?;
        let critiques = self.store.critiques(&session.id)?;
        let mut syntheses = self.store.syntheses(&session.id)?;
        syntheses.sort_by_key(|s| s.iteration);
        let metrics = self.store.metrics(&session.id)?;

        let mut agents_used: Vec<AgentId> = analyses.iter().map(|a| a.agent_id).collect();
        agents_used.sort();
        agents_used.dedup();

        let totals = RunTotals {
            total_tokens: metrics
                .iter()
                .map(|m| m.tokens_in as u64 + m.tokens_out as u64)
                .sum(),
            total_cost_usd: metrics.iter().map(|m| m.cost_usd).sum(),
            iterations_used: machine.iteration(),
            agents_used: agents_used.len() as u32,
        };

        let result = FinalResult {
            session_id: session.id.clone(),
            status,
            synthesis: syntheses.last().cloned(),
            analyses,
            critiques,
            syntheses,
            totals,
            error,
            created_at: Utc::now(),
        };

        self.store.finalize(&result)?;
        self.store.update_status(&session.id, status)?;
        Ok(result)
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Re-derive the budget ledger from persisted RunMetrics.
    fn ledger(&self, session: &Session) -> Result<BudgetLedger, EngineError> {
        let metrics = self.store.metrics(&session.id)?;
        let mut ledger = BudgetLedger::new(session.settings.budget_usd);
        for metric in metrics {
            ledger.record(metric.cost_usd);
        }
        Ok(ledger)
    }

    /// Handle cancellation and the session deadline at a phase boundary.
    /// Returns a final result when the session must stop here.
    async fn check_boundary(
        &self,
        session: &Arc<Session>,
        machine: &mut PhaseMachine,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<FinalResult>, EngineError> {
        if cancel.is_cancelled() {
            info!(session_id = %session.id, "cancellation observed at phase boundary");
            let result = self
                .finish_cancelled(session, machine, FailureReason::Cancelled)
                .await?;
            return Ok(Some(result));
        }
        if residual_of(deadline).is_zero() {
            warn!(session_id = %session.id, "session deadline exceeded");
            let result = self
                .finish_cancelled(session, machine, FailureReason::DeadlineExceeded)
                .await?;
            return Ok(Some(result));
        }
        Ok(None)
    }

    fn emit_phase_start(&self, session: &Session, machine: &PhaseMachine) {
        self.bus.publish(DeliberationEvent::PhaseStart {
            session_id: session.id.clone(),
            phase: machine.current().to_string(),
            iteration: machine.iteration(),
            timestamp: Utc::now(),
        });
    }

    fn emit_agent_completed(
        &self,
        session: &Session,
        agent: AgentId,
        phase: RunPhase,
        iteration: u32,
        duration_ms: u64,
        status: RunStatus,
    ) {
        self.bus.publish(DeliberationEvent::AgentCompleted {
            session_id: session.id.clone(),
            agent_id: agent,
            phase,
            iteration,
            duration_ms,
            status,
            timestamp: Utc::now(),
        });
    }
}

fn residual_of(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn analysis_from_output(
    session: &Session,
    agent: AgentId,
    iteration: u32,
    output: &CallOutput,
) -> AgentAnalysis {
    let payload = match &output.payload {
        PhasePayload::Analysis(p) => p,
        other => unreachable!("analyze call returned {:?}", other.phase()),
    };
    AgentAnalysis {
        session_id: session.id.clone(),
        agent_id: agent,
        iteration,
        analysis_text: payload.analysis.clone(),
        confidence: payload.confidence.unwrap_or(0.5),
        key_points: payload.key_points.clone(),
        risks: payload.risks.clone(),
        assumptions: payload.assumptions.clone(),
        tokens_in: output.tokens_in,
        tokens_out: output.tokens_out,
        cost_usd: output.cost_usd,
        duration_ms: output.duration_ms,
        created_at: Utc::now(),
    }
}

/// Interpolation variables for an analyze call. Refinement iterations see
/// the previous synthesis and the critiques aimed at them.
fn analyze_vars(
    session: &Session,
    agent: AgentId,
    previous_synthesis: Option<&Synthesis>,
    previous_critiques: &[Critique],
) -> Vec<(&'static str, String)> {
    let context = match &session.context_text {
        Some(text) => format!("\n## Context\n{text}\n"),
        None => String::new(),
    };
    let refinement = match previous_synthesis {
        Some(synthesis) => {
            let of_self: Vec<&Critique> = previous_critiques
                .iter()
                .filter(|c| c.to_agent == agent)
                .collect();
            let critiques_text = if of_self.is_empty() {
                "(none)".to_string()
            } else {
                of_self
                    .iter()
                    .map(|c| format!("- [{} scored {:.1}] {}", c.from_agent, c.score, c.critique_text))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            crate::prompts::interpolate(
                crate::prompts::REFINEMENT_BLOCK,
                &[
                    ("previous_synthesis", &synthesis.summary),
                    ("critiques_of_self", &critiques_text),
                ],
            )
        }
        None => String::new(),
    };

    vec![
        ("task", session.task_text.clone()),
        ("task_type", session.task_type.to_string()),
        ("context", context),
        ("refinement", refinement),
    ]
}

/// Analyses enumerated in canonical order; the target's is marked when a
/// critic needs to know which one to review.
fn format_analyses(analyses: &[AgentAnalysis], target: Option<AgentId>) -> String {
    let mut ordered: Vec<&AgentAnalysis> = analyses.iter().collect();
    ordered.sort_by_key(|a| a.agent_id);
    ordered
        .iter()
        .map(|a| {
            let marker = if target == Some(a.agent_id) {
                " [TARGET]"
            } else {
                ""
            };
            format!(
                "### {} ({}){} — confidence {:.2}\n{}\n",
                a.agent_id,
                a.agent_id.role(),
                marker,
                a.confidence,
                a.analysis_text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_critiques(critiques: &[Critique]) -> String {
    if critiques.is_empty() {
        return "(no critiques this iteration)".to_string();
    }
    let mut ordered: Vec<&Critique> = critiques.iter().collect();
    ordered.sort_by_key(|c| (c.from_agent, c.to_agent));
    ordered
        .iter()
        .map(|c| {
            format!(
                "- {} → {} (score {:.1}): {}",
                c.from_agent, c.to_agent, c.score, c.critique_text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn critique_vars(
    session: &Session,
    analyses: &[AgentAnalysis],
    target: AgentId,
) -> Vec<(&'static str, String)> {
    vec![
        ("task", session.task_text.clone()),
        ("task_type", session.task_type.to_string()),
        ("other_analyses", format_analyses(analyses, Some(target))),
        ("target_agent", target.to_string()),
    ]
}

fn synthesis_vars(
    session: &Session,
    iteration: u32,
    analyses: &[AgentAnalysis],
    critiques: &[Critique],
) -> Vec<(&'static str, String)> {
    vec![
        ("task", session.task_text.clone()),
        ("task_type", session.task_type.to_string()),
        ("iteration", iteration.to_string()),
        ("other_analyses", format_analyses(analyses, None)),
        ("critiques", format_critiques(critiques)),
    ]
}
