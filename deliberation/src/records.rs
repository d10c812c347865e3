//! Persisted deliberation records — analyses, critiques, syntheses,
//! run metrics, and the final result.
//!
//! Child records are append-only and immutable once written. Uniqueness
//! keys: analysis `(session, agent, iteration)`, critique
//! `(session, iteration, from, to)`, synthesis `(session, iteration)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{AgentId, SessionStatus};

/// One agent's independent analysis for one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAnalysis {
    pub session_id: String,
    pub agent_id: AgentId,
    /// Iteration this analysis belongs to (1-indexed).
    pub iteration: u32,
    pub analysis_text: String,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
    pub key_points: Vec<String>,
    pub risks: Vec<String>,
    pub assumptions: Vec<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// A directed review of one agent's analysis by another agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critique {
    pub session_id: String,
    pub iteration: u32,
    pub from_agent: AgentId,
    pub to_agent: AgentId,
    /// Quality score the critic assigns the target analysis, in [0, 10].
    pub score: f64,
    pub critique_text: String,
    pub weaknesses: Vec<String>,
    pub strengths: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A probabilistic conclusion inside a synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conclusion {
    pub statement: String,
    /// Probability the statement holds, in [0, 1].
    pub probability: f64,
    /// What observation would falsify the statement, when the synthesizer
    /// can name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub falsification_condition: Option<String>,
}

/// The integrated output of one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    pub session_id: String,
    pub iteration: u32,
    pub summary: String,
    pub conclusions: Vec<Conclusion>,
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formalized_result: Option<String>,
    /// Agreement among analyses after critique, in [0, 1], as reported by
    /// the synthesizer itself.
    pub consensus_level: f64,
    pub created_at: DateTime<Utc>,
}

/// Phase a provider call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Analyze,
    Critique,
    Synthesize,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Analyze => write!(f, "analyze"),
            Self::Critique => write!(f, "critique"),
            Self::Synthesize => write!(f, "synthesize"),
        }
    }
}

/// Outcome of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
    Timeout,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Append-only record of a single provider call, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetric {
    pub session_id: String,
    pub agent_id: AgentId,
    pub model: String,
    pub phase: RunPhase,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Degraded-path flags (unknown model price, imputed confidence, …).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate counters derived from a session's RunMetrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub iterations_used: u32,
    pub agents_used: u32,
}

/// Why a session terminated without completing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum FailureReason {
    /// Too few successful calls in a phase to proceed.
    PhaseStarved { phase: String, detail: String },
    /// Budget would be exceeded by further calls.
    BudgetExhausted { spent_usd: f64, budget_usd: f64 },
    /// Session wall-clock deadline elapsed.
    DeadlineExceeded,
    /// Externally cancelled.
    Cancelled,
    /// The store rejected a write.
    Persistence { detail: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PhaseStarved { phase, detail } => {
                write!(f, "phase_starved({phase}): {detail}")
            }
            Self::BudgetExhausted {
                spent_usd,
                budget_usd,
            } => write!(f, "budget_exhausted: {spent_usd:.4} of {budget_usd:.4} USD"),
            Self::DeadlineExceeded => write!(f, "deadline_exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Persistence { detail } => write!(f, "persistence: {detail}"),
        }
    }
}

/// The terminal product of a session: every record produced, the last
/// synthesis, aggregate metrics, and — for non-completed sessions — the
/// terminating condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub session_id: String,
    pub status: SessionStatus,
    /// Synthesis of the terminal iteration, when one was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<Synthesis>,
    /// All analyses across iterations.
    pub analyses: Vec<AgentAnalysis>,
    /// All surviving critiques across iterations.
    pub critiques: Vec<Critique>,
    /// All syntheses across iterations, oldest first.
    pub syntheses: Vec<Synthesis>,
    pub totals: RunTotals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
}

impl FinalResult {
    /// Consensus level of the terminal synthesis, if any.
    pub fn consensus_level(&self) -> Option<f64> {
        self.synthesis.as_ref().map(|s| s.consensus_level)
    }
}
