//! Consensus and budget evaluation — decide whether an iteration's
//! synthesis ends the session or another refinement pass is warranted.
//!
//! The synthesizer-reported `consensus_level` is authoritative. The
//! confidence-spread helper is advisory only and never feeds the decision,
//! so runs stay reproducible under deterministic providers.

use serde::{Deserialize, Serialize};

/// Why a session terminated instead of refining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    /// Consensus met or exceeded the threshold.
    ConsensusReached,
    /// The iteration cap was hit.
    IterationCapReached,
    /// The remaining budget cannot fund another full iteration.
    BudgetFloorReached,
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConsensusReached => write!(f, "consensus_reached"),
            Self::IterationCapReached => write!(f, "iteration_cap_reached"),
            Self::BudgetFloorReached => write!(f, "budget_floor_reached"),
        }
    }
}

/// Outcome of evaluating an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    /// Run another Analyze → Critique → Synthesize pass.
    Refine,
    /// Stop and finalize with the current synthesis.
    Terminate(TerminationCause),
}

/// Running spend tally for one session. Spend is recorded from the same
/// RunMetrics the store persists, so the ledger and the store always agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLedger {
    /// Hard ceiling in USD.
    pub budget_usd: f64,
    /// Total recorded spend in USD.
    pub spent_usd: f64,
    /// Number of provider calls recorded (including failed ones).
    pub calls: u32,
}

impl BudgetLedger {
    /// Fresh ledger for a budget.
    pub fn new(budget_usd: f64) -> Self {
        Self {
            budget_usd,
            spent_usd: 0.0,
            calls: 0,
        }
    }

    /// Record one call's cost.
    pub fn record(&mut self, cost_usd: f64) {
        self.spent_usd += cost_usd;
        self.calls += 1;
    }

    /// Remaining budget, never negative.
    pub fn remaining(&self) -> f64 {
        (self.budget_usd - self.spent_usd).max(0.0)
    }

    /// Whether the ceiling has been reached. The gate runs before each
    /// call, so the call that crosses the line still completes and is
    /// accounted (the `ε_last_call` tolerance).
    pub fn exhausted(&self) -> bool {
        self.spent_usd >= self.budget_usd
    }

    /// Average cost per recorded call; zero before any call.
    pub fn average_call_cost(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.spent_usd / self.calls as f64
        }
    }

    /// Estimated cost of one more full iteration from the running average.
    pub fn estimated_iteration_cost(&self, calls_per_iteration: u32) -> f64 {
        self.average_call_cost() * calls_per_iteration as f64
    }
}

/// Provider calls one full iteration makes for `n` debating agents:
/// `n` analyses + `n·(n−1)` critiques + 1 synthesis.
pub fn calls_per_iteration(agents: u32) -> u32 {
    agents + agents.saturating_mul(agents.saturating_sub(1)) + 1
}

/// The refine/terminate evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusEvaluator {
    /// Consensus level at which the session terminates.
    pub threshold: f64,
    /// Maximum iterations.
    pub max_iterations: u32,
}

impl ConsensusEvaluator {
    pub fn new(threshold: f64, max_iterations: u32) -> Self {
        Self {
            threshold,
            max_iterations,
        }
    }

    /// Refine iff consensus is below threshold, the cap is not hit, and the
    /// remaining budget can fund one more full iteration.
    pub fn decide(
        &self,
        consensus_level: f64,
        iteration: u32,
        ledger: &BudgetLedger,
        calls_per_iteration: u32,
    ) -> IterationOutcome {
        if consensus_level >= self.threshold {
            return IterationOutcome::Terminate(TerminationCause::ConsensusReached);
        }
        if iteration >= self.max_iterations {
            return IterationOutcome::Terminate(TerminationCause::IterationCapReached);
        }
        let floor = ledger.estimated_iteration_cost(calls_per_iteration);
        if ledger.remaining() <= floor {
            return IterationOutcome::Terminate(TerminationCause::BudgetFloorReached);
        }
        IterationOutcome::Refine
    }
}

/// Advisory agreement measure from the iteration's analysis confidences:
/// 1 minus the confidence spread. Logged next to the synthesizer-reported
/// consensus; never used for control flow.
pub fn confidence_spread_agreement(confidences: &[f64]) -> f64 {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &c in confidences {
        min = min.min(c);
        max = max.max(c);
    }
    if confidences.is_empty() {
        0.0
    } else {
        (1.0 - (max - min)).clamp(0.0, 1.0)
    }
}
