//! Deliberation sessions — agent catalog, settings, and session lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Temperature applied when a session does not override it.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Iteration cap applied when a session does not override it.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
/// Consensus threshold applied when a session does not override it.
pub const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.8;
/// Budget (USD) applied when a session does not override it.
pub const DEFAULT_BUDGET_USD: f64 = 2.0;

/// A logical deliberation persona. Each agent is bound to a provider
/// endpoint, a default model, and a set of prompts.
///
/// Declaration order is alphabetical, so deriving `Ord` gives the canonical
/// agent order used when enumerating analyses for the synthesizer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    /// Logical Analyst — general-purpose stepwise reasoning.
    Analyst,
    /// Systems Architect — synthesis and integration; default synthesizer.
    Architect,
    /// Alternatives Generator — broad-coverage lateral options.
    Explorer,
    /// Formal Analyst — cost-efficient formal/quantified checking.
    Formalist,
}

impl AgentId {
    /// All agents in canonical order.
    pub const ALL: [AgentId; 4] = [
        AgentId::Analyst,
        AgentId::Architect,
        AgentId::Explorer,
        AgentId::Formalist,
    ];

    /// Human-readable role name.
    pub fn role(self) -> &'static str {
        match self {
            Self::Analyst => "Logical Analyst",
            Self::Architect => "Systems Architect",
            Self::Explorer => "Alternatives Generator",
            Self::Formalist => "Formal Analyst",
        }
    }

    /// Model used when the session settings do not override it.
    pub fn default_model(self) -> &'static str {
        match self {
            Self::Analyst => "gpt-4o",
            Self::Architect => "claude-sonnet-4",
            Self::Explorer => "gemini-2.5-pro",
            Self::Formalist => "deepseek-chat",
        }
    }

    /// Wire-format identifier (matches the serde rename).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::Architect => "architect",
            Self::Explorer => "explorer",
            Self::Formalist => "formalist",
        }
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyst" => Ok(Self::Analyst),
            "architect" => Ok(Self::Architect),
            "explorer" => Ok(Self::Explorer),
            "formalist" => Ok(Self::Formalist),
            other => Err(format!("unknown agent id: {other}")),
        }
    }
}

/// Kind of task being deliberated. Steers prompt framing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Strategy,
    Research,
    Investment,
    Development,
    Audit,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strategy => write!(f, "strategy"),
            Self::Research => write!(f, "research"),
            Self::Investment => write!(f, "investment"),
            Self::Development => write!(f, "development"),
            Self::Audit => write!(f, "audit"),
        }
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created but not started.
    Pending,
    /// Engine is driving iterations.
    Running,
    /// Terminal — consensus reached or caps hit with a synthesis in hand.
    Completed,
    /// Terminal — phase starvation, budget exhaustion, or persistence failure.
    Failed,
    /// Terminal — externally cancelled.
    Cancelled,
}

impl SessionStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-session knobs. Validated before a session may leave `Pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Agents participating in analysis and critique. Must be non-empty.
    pub enabled_agents: Vec<AgentId>,
    /// Per-agent model overrides; absent agents use their default model.
    #[serde(default)]
    pub models: BTreeMap<AgentId, String>,
    /// Sampling temperature for all agent calls, in [0, 1].
    pub temperature: f64,
    /// Maximum Analyze→Critique→Synthesize passes, in [1, 5].
    pub max_iterations: u32,
    /// Consensus level at which the session terminates, in [0.5, 0.95].
    pub consensus_threshold: f64,
    /// Hard spend ceiling in USD. Must be positive.
    pub budget_usd: f64,
    /// Agent performing synthesis. Defaults to the Systems Architect.
    #[serde(default = "default_synthesizer")]
    pub synthesizer: AgentId,
}

fn default_synthesizer() -> AgentId {
    AgentId::Architect
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            enabled_agents: AgentId::ALL.to_vec(),
            models: BTreeMap::new(),
            temperature: DEFAULT_TEMPERATURE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            consensus_threshold: DEFAULT_CONSENSUS_THRESHOLD,
            budget_usd: DEFAULT_BUDGET_USD,
            synthesizer: default_synthesizer(),
        }
    }
}

impl SessionSettings {
    /// Validate all knobs; returns the first violation as an error string.
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled_agents.is_empty() {
            return Err("enabled_agents must not be empty".to_string());
        }
        let mut seen = self.enabled_agents.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.enabled_agents.len() {
            return Err("enabled_agents contains duplicates".to_string());
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(format!(
                "temperature must be in [0, 1], got {}",
                self.temperature
            ));
        }
        if !(1..=5).contains(&self.max_iterations) {
            return Err(format!(
                "max_iterations must be in [1, 5], got {}",
                self.max_iterations
            ));
        }
        if !(0.5..=0.95).contains(&self.consensus_threshold) {
            return Err(format!(
                "consensus_threshold must be in [0.5, 0.95], got {}",
                self.consensus_threshold
            ));
        }
        if self.budget_usd <= 0.0 {
            return Err(format!("budget_usd must be > 0, got {}", self.budget_usd));
        }
        Ok(())
    }

    /// Enabled agents in canonical (alphabetical) order.
    pub fn agents_in_order(&self) -> Vec<AgentId> {
        let mut agents = self.enabled_agents.clone();
        agents.sort();
        agents
    }

    /// Model assigned to an agent, honoring per-session overrides.
    pub fn model_for(&self, agent: AgentId) -> &str {
        self.models
            .get(&agent)
            .map(String::as_str)
            .unwrap_or_else(|| agent.default_model())
    }
}

/// A deliberation session: one task driven through iterations of
/// Analyze → Critique → Synthesize until consensus, budget, or the
/// iteration cap terminates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// The task under deliberation.
    pub task_text: String,
    /// Task kind, steering prompt framing.
    pub task_type: TaskType,
    /// Optional supplied background context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_text: Option<String>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Validated settings.
    pub settings: SessionSettings,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Monotonically advanced on every mutation.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a pending session with a fresh id.
    pub fn new(task_text: &str, task_type: TaskType, settings: SessionSettings) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_text: task_text.to_string(),
            task_type,
            context_text: None,
            status: SessionStatus::Pending,
            settings,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach background context.
    pub fn with_context(mut self, context: &str) -> Self {
        self.context_text = Some(context.to_string());
        self
    }

    /// Whether the session may still be started.
    pub fn is_startable(&self) -> bool {
        self.status == SessionStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_order_is_alphabetical() {
        let mut shuffled = vec![
            AgentId::Formalist,
            AgentId::Analyst,
            AgentId::Explorer,
            AgentId::Architect,
        ];
        shuffled.sort();
        assert_eq!(shuffled, AgentId::ALL.to_vec());
    }

    #[test]
    fn agent_serde_uses_snake_case() {
        let json = serde_json::to_string(&AgentId::Formalist).unwrap();
        assert_eq!(json, "\"formalist\"");
        let parsed: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, AgentId::Formalist);
    }

    #[test]
    fn agent_from_str_roundtrip() {
        for agent in AgentId::ALL {
            let parsed: AgentId = agent.as_str().parse().unwrap();
            assert_eq!(parsed, agent);
        }
        assert!("overseer".parse::<AgentId>().is_err());
    }

    #[test]
    fn default_settings_validate() {
        SessionSettings::default().validate().unwrap();
    }

    #[test]
    fn empty_agents_rejected() {
        let settings = SessionSettings {
            enabled_agents: vec![],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn duplicate_agents_rejected() {
        let settings = SessionSettings {
            enabled_agents: vec![AgentId::Analyst, AgentId::Analyst],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn out_of_range_knobs_rejected() {
        let mut settings = SessionSettings::default();
        settings.max_iterations = 6;
        assert!(settings.validate().is_err());

        let mut settings = SessionSettings::default();
        settings.consensus_threshold = 0.99;
        assert!(settings.validate().is_err());

        let mut settings = SessionSettings::default();
        settings.budget_usd = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = SessionSettings::default();
        settings.temperature = 1.2;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn model_override_honored() {
        let mut settings = SessionSettings::default();
        settings
            .models
            .insert(AgentId::Analyst, "gpt-4o-mini".to_string());
        assert_eq!(settings.model_for(AgentId::Analyst), "gpt-4o-mini");
        assert_eq!(settings.model_for(AgentId::Explorer), "gemini-2.5-pro");
    }

    #[test]
    fn new_session_is_pending() {
        let session = Session::new(
            "Evaluate SaaS market entry",
            TaskType::Strategy,
            SessionSettings::default(),
        );
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.is_startable());
        assert!(!session.status.is_terminal());
        assert_eq!(session.created_at, session.updated_at);
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
    }

    #[test]
    fn status_display_matches_wire() {
        assert_eq!(SessionStatus::Pending.to_string(), "pending");
        assert_eq!(SessionStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(TaskType::Investment.to_string(), "investment");
    }
}
