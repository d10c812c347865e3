//! Deliberation phase machine — phases, legal transitions, and the
//! per-session transition log.
//!
//! # Phase flow
//!
//! ```text
//! Pending → Analyzing(i) → Critiquing(i) → Synthesizing(i) → Evaluating(i)
//!    │           │ (single agent)  ▲             │                │
//!    │           └────────────────-┼─────────────┘                ├─ consensus / caps → Completed
//!    │                             │                              └─ refine → Refining → Analyzing(i+1)
//!    └─ abort at any point → Cancelled; starvation/budget → Failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of a deliberation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliberationPhase {
    /// Session created but not started.
    Pending,
    /// Enabled agents are producing independent analyses.
    Analyzing,
    /// Agents are cross-critiquing each other's analyses.
    Critiquing,
    /// The synthesizer is folding analyses and critiques together.
    Synthesizing,
    /// Deciding whether to refine or terminate.
    Evaluating,
    /// Another iteration was granted.
    Refining,
    /// Consensus reached or caps hit with a synthesis in hand — terminal.
    Completed,
    /// Phase starvation, budget exhaustion, or persistence failure — terminal.
    Failed,
    /// Externally cancelled — terminal.
    Cancelled,
}

impl DeliberationPhase {
    /// Whether this is a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this phase. `Failed` and `Cancelled` are
    /// reachable from every non-terminal phase and are not repeated here.
    pub fn valid_transitions(self) -> &'static [DeliberationPhase] {
        match self {
            Self::Pending => &[Self::Analyzing],
            // Single-agent sessions skip Critiquing entirely.
            Self::Analyzing => &[Self::Critiquing, Self::Synthesizing],
            Self::Critiquing => &[Self::Synthesizing],
            Self::Synthesizing => &[Self::Evaluating],
            Self::Evaluating => &[Self::Refining, Self::Completed],
            Self::Refining => &[Self::Analyzing],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    fn allows(self, to: DeliberationPhase) -> bool {
        if to == Self::Failed || to == Self::Cancelled {
            return !self.is_terminal();
        }
        self.valid_transitions().contains(&to)
    }
}

impl std::fmt::Display for DeliberationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Critiquing => write!(f, "critiquing"),
            Self::Synthesizing => write!(f, "synthesizing"),
            Self::Evaluating => write!(f, "evaluating"),
            Self::Refining => write!(f, "refining"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    /// Previous phase.
    pub from: DeliberationPhase,
    /// New phase.
    pub to: DeliberationPhase,
    /// Iteration number at transition time (0 before the first iteration).
    pub iteration: u32,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Why this transition happened.
    pub reason: String,
}

/// Error for illegal phase transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} → {to}")]
pub struct TransitionError {
    pub from: DeliberationPhase,
    pub to: DeliberationPhase,
}

/// Tracks the current phase and iteration of a running session and keeps
/// a complete transition log for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMachine {
    current: DeliberationPhase,
    iteration: u32,
    transitions: Vec<PhaseTransition>,
}

impl PhaseMachine {
    /// Create a new machine at `Pending`, iteration 0.
    pub fn new() -> Self {
        Self {
            current: DeliberationPhase::Pending,
            iteration: 0,
            transitions: Vec::new(),
        }
    }

    /// Current phase.
    pub fn current(&self) -> DeliberationPhase {
        self.current
    }

    /// Current iteration (1-indexed once analysis begins).
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Whether the machine is in a terminal phase.
    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Attempt to advance, recording the transition with a reason.
    ///
    /// Entering `Analyzing` increments the iteration counter.
    pub fn advance(
        &mut self,
        to: DeliberationPhase,
        reason: &str,
    ) -> Result<(), TransitionError> {
        if !self.current.allows(to) {
            return Err(TransitionError {
                from: self.current,
                to,
            });
        }

        if to == DeliberationPhase::Analyzing {
            self.iteration += 1;
        }

        tracing::debug!(
            from = %self.current,
            to = %to,
            iteration = self.iteration,
            reason,
            "phase transition"
        );

        self.transitions.push(PhaseTransition {
            from: self.current,
            to,
            iteration: self.iteration,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.current = to;
        Ok(())
    }

    /// Transition to `Failed` — legal from any non-terminal phase.
    pub fn fail(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.advance(DeliberationPhase::Failed, reason)
    }

    /// Transition to `Cancelled` — legal from any non-terminal phase.
    pub fn cancel(&mut self, reason: &str) -> Result<(), TransitionError> {
        self.advance(DeliberationPhase::Cancelled, reason)
    }

    /// The full transition log.
    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    /// Compact status line for logging.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] iteration {} | {} transitions",
            self.current,
            self.iteration,
            self.transitions.len()
        )
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}
