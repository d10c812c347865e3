//! Domain primitives for multi-agent deliberation.
//!
//! This crate holds everything that is deterministic about a deliberation:
//! the session model and settings, the phase machine, the typed records a
//! session produces, structured-output parsing, consensus and budget
//! evaluation, cost accounting, lifecycle events with a broadcast bus, the
//! session store façade, and versioned prompt templates. Provider
//! transports and the orchestration loop live in `council-agents`.

pub mod bus;
pub mod consensus;
pub mod events;
pub mod parser;
pub mod phase;
pub mod pricing;
pub mod prompt;
pub mod records;
pub mod schema;
pub mod session;
pub mod store;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use consensus::{
    calls_per_iteration, confidence_spread_agreement, BudgetLedger, ConsensusEvaluator,
    IterationOutcome, TerminationCause,
};
pub use events::DeliberationEvent;
pub use parser::{parse_output, ParseError, ParsedOutput};
pub use phase::{DeliberationPhase, PhaseMachine, PhaseTransition, TransitionError};
pub use pricing::{call_cost, price, price_or_default, ModelPrice, DEFAULT_PRICE};
pub use prompt::{PromptError, PromptRegistry, PromptTemplate, PromptType};
pub use records::{
    AgentAnalysis, Conclusion, Critique, FailureReason, FinalResult, RunMetric, RunPhase,
    RunStatus, RunTotals, Synthesis,
};
pub use schema::{
    schema_hint, AnalysisPayload, CritiquePayload, PhasePayload, SynthesisPayload,
};
pub use session::{
    AgentId, Session, SessionSettings, SessionStatus, TaskType,
};
pub use store::{MemoryStore, SessionStore, StoreError, StoreResult, StoreSource};
