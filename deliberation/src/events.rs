//! Lifecycle events emitted while a session deliberates.
//!
//! Events drive the SSE streaming endpoint and external log consumers.
//! Lifecycle events are lossless within channel capacity; `metric` events
//! may be dropped under pressure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consensus::IterationOutcome;
use crate::records::{RunMetric, RunPhase, RunStatus};
use crate::session::AgentId;

/// All deliberation lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliberationEvent {
    /// A phase began for an iteration.
    PhaseStart {
        session_id: String,
        phase: String,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },

    /// One agent's call finished (successfully or not).
    AgentCompleted {
        session_id: String,
        agent_id: AgentId,
        phase: RunPhase,
        iteration: u32,
        duration_ms: u64,
        status: RunStatus,
        timestamp: DateTime<Utc>,
    },

    /// A directed critique was produced.
    CritiqueCompleted {
        session_id: String,
        iteration: u32,
        from: AgentId,
        to: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// The iteration's synthesis is available.
    SynthesisReady {
        session_id: String,
        iteration: u32,
        consensus: f64,
        timestamp: DateTime<Utc>,
    },

    /// The evaluator decided to refine or terminate.
    IterationComplete {
        session_id: String,
        iteration: u32,
        decision: IterationOutcome,
        timestamp: DateTime<Utc>,
    },

    /// Terminal: the session completed with a final result.
    SessionCompleted {
        session_id: String,
        iterations_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// Terminal: the session failed.
    SessionFailed {
        session_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Terminal: the session was cancelled externally.
    SessionCancelled {
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A RunMetric was recorded. Droppable under back-pressure.
    Metric {
        session_id: String,
        metric: RunMetric,
        timestamp: DateTime<Utc>,
    },
}

impl DeliberationEvent {
    /// Event type as a wire string.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PhaseStart { .. } => "phase_start",
            Self::AgentCompleted { .. } => "agent_completed",
            Self::CritiqueCompleted { .. } => "critique_completed",
            Self::SynthesisReady { .. } => "synthesis_ready",
            Self::IterationComplete { .. } => "iteration_complete",
            Self::SessionCompleted { .. } => "session_completed",
            Self::SessionFailed { .. } => "session_failed",
            Self::SessionCancelled { .. } => "session_cancelled",
            Self::Metric { .. } => "metric",
        }
    }

    /// Session this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::PhaseStart { session_id, .. }
            | Self::AgentCompleted { session_id, .. }
            | Self::CritiqueCompleted { session_id, .. }
            | Self::SynthesisReady { session_id, .. }
            | Self::IterationComplete { session_id, .. }
            | Self::SessionCompleted { session_id, .. }
            | Self::SessionFailed { session_id, .. }
            | Self::SessionCancelled { session_id, .. }
            | Self::Metric { session_id, .. } => session_id,
        }
    }

    /// When the event occurred.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::PhaseStart { timestamp, .. }
            | Self::AgentCompleted { timestamp, .. }
            | Self::CritiqueCompleted { timestamp, .. }
            | Self::SynthesisReady { timestamp, .. }
            | Self::IterationComplete { timestamp, .. }
            | Self::SessionCompleted { timestamp, .. }
            | Self::SessionFailed { timestamp, .. }
            | Self::SessionCancelled { timestamp, .. }
            | Self::Metric { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this event marks the end of a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SessionCompleted { .. }
                | Self::SessionFailed { .. }
                | Self::SessionCancelled { .. }
        )
    }

    /// Whether delivery must not be dropped. Only `metric` events are
    /// droppable under pressure.
    pub fn is_lossless(&self) -> bool {
        !matches!(self, Self::Metric { .. })
    }
}
