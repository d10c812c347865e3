//! Session store façade — narrow persistence interface plus the in-memory
//! backend.
//!
//! Child records are append-only; the session row itself carries a
//! monotonic `updated_at`. A session exclusively owns its analyses,
//! critiques, syntheses, metrics, and final result: deleting the session
//! cascades to all of them. Memory mode is ephemeral and single-process;
//! external SQL/row backends plug in behind the same trait.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;

use crate::records::{AgentAnalysis, Critique, FinalResult, RunMetric, Synthesis};
use crate::session::{Session, SessionStatus};

/// Error type for store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Which backing engine serves the data. Responses annotate this so
/// clients can tell ephemeral memory mode from a database deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreSource {
    Memory,
    Database,
}

impl std::fmt::Display for StoreSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Database => write!(f, "database"),
        }
    }
}

/// Narrow persistence interface consumed by the deliberation engine.
pub trait SessionStore: Send + Sync {
    fn create_session(&self, session: &Session) -> StoreResult<()>;
    fn load_session(&self, session_id: &str) -> StoreResult<Session>;
    fn list_sessions(&self) -> StoreResult<Vec<Session>>;
    fn update_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<()>;

    fn append_analysis(&self, analysis: &AgentAnalysis) -> StoreResult<()>;
    fn append_critique(&self, critique: &Critique) -> StoreResult<()>;
    fn append_synthesis(&self, synthesis: &Synthesis) -> StoreResult<()>;
    fn append_metric(&self, metric: &RunMetric) -> StoreResult<()>;

    fn analyses(&self, session_id: &str) -> StoreResult<Vec<AgentAnalysis>>;
    fn critiques(&self, session_id: &str) -> StoreResult<Vec<Critique>>;
    fn syntheses(&self, session_id: &str) -> StoreResult<Vec<Synthesis>>;
    fn metrics(&self, session_id: &str) -> StoreResult<Vec<RunMetric>>;
    /// Metrics across all sessions (for aggregation windows).
    fn all_metrics(&self) -> StoreResult<Vec<RunMetric>>;

    /// Store the terminal result. Exactly one per session.
    fn finalize(&self, result: &FinalResult) -> StoreResult<()>;
    fn final_result(&self, session_id: &str) -> StoreResult<Option<FinalResult>>;

    /// Delete the session and everything it owns.
    fn delete_session(&self, session_id: &str) -> StoreResult<()>;

    /// Which backing engine serves this store.
    fn source(&self) -> StoreSource;
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, Session>,
    analyses: HashMap<String, Vec<AgentAnalysis>>,
    critiques: HashMap<String, Vec<Critique>>,
    syntheses: HashMap<String, Vec<Synthesis>>,
    metrics: HashMap<String, Vec<RunMetric>>,
    finals: HashMap<String, FinalResult>,
}

/// In-memory store. Ephemeral by design: data dies with the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, MemoryInner>> {
        self.inner.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, MemoryInner>> {
        self.inner.write().map_err(|_| StoreError::LockPoisoned)
    }
}

impl SessionStore for MemoryStore {
    fn create_session(&self, session: &Session) -> StoreResult<()> {
        let mut inner = self.write()?;
        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> StoreResult<Session> {
        self.read()?
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self.read()?.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    fn update_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<()> {
        let mut inner = self.write()?;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() && session.status != status {
            return Err(StoreError::Conflict(format!(
                "session {session_id} is already {}",
                session.status
            )));
        }
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    fn append_analysis(&self, analysis: &AgentAnalysis) -> StoreResult<()> {
        let mut inner = self.write()?;
        let session = inner
            .sessions
            .get(&analysis.session_id)
            .ok_or_else(|| StoreError::NotFound(analysis.session_id.clone()))?;
        if !session.settings.enabled_agents.contains(&analysis.agent_id) {
            return Err(StoreError::InvalidRecord(format!(
                "agent {} is not enabled for session {}",
                analysis.agent_id, analysis.session_id
            )));
        }
        let rows = inner
            .analyses
            .entry(analysis.session_id.clone())
            .or_default();
        if rows
            .iter()
            .any(|a| a.agent_id == analysis.agent_id && a.iteration == analysis.iteration)
        {
            return Err(StoreError::Conflict(format!(
                "analysis ({}, {}, {}) already exists",
                analysis.session_id, analysis.agent_id, analysis.iteration
            )));
        }
        rows.push(analysis.clone());
        if let Some(session) = inner.sessions.get_mut(&analysis.session_id) {
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    fn append_critique(&self, critique: &Critique) -> StoreResult<()> {
        if critique.from_agent == critique.to_agent {
            return Err(StoreError::InvalidRecord(
                "critique must target a different agent".to_string(),
            ));
        }
        let mut inner = self.write()?;
        if !inner.sessions.contains_key(&critique.session_id) {
            return Err(StoreError::NotFound(critique.session_id.clone()));
        }
        let rows = inner
            .critiques
            .entry(critique.session_id.clone())
            .or_default();
        if rows.iter().any(|c| {
            c.iteration == critique.iteration
                && c.from_agent == critique.from_agent
                && c.to_agent == critique.to_agent
        }) {
            return Err(StoreError::Conflict(format!(
                "critique ({}, {}, {}→{}) already exists",
                critique.session_id, critique.iteration, critique.from_agent, critique.to_agent
            )));
        }
        rows.push(critique.clone());
        if let Some(session) = inner.sessions.get_mut(&critique.session_id) {
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    fn append_synthesis(&self, synthesis: &Synthesis) -> StoreResult<()> {
        let mut inner = self.write()?;
        if !inner.sessions.contains_key(&synthesis.session_id) {
            return Err(StoreError::NotFound(synthesis.session_id.clone()));
        }
        let rows = inner
            .syntheses
            .entry(synthesis.session_id.clone())
            .or_default();
        if rows.iter().any(|s| s.iteration == synthesis.iteration) {
            return Err(StoreError::Conflict(format!(
                "synthesis ({}, {}) already exists",
                synthesis.session_id, synthesis.iteration
            )));
        }
        rows.push(synthesis.clone());
        if let Some(session) = inner.sessions.get_mut(&synthesis.session_id) {
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    fn append_metric(&self, metric: &RunMetric) -> StoreResult<()> {
        let mut inner = self.write()?;
        if !inner.sessions.contains_key(&metric.session_id) {
            return Err(StoreError::NotFound(metric.session_id.clone()));
        }
        inner
            .metrics
            .entry(metric.session_id.clone())
            .or_default()
            .push(metric.clone());
        Ok(())
    }

    fn analyses(&self, session_id: &str) -> StoreResult<Vec<AgentAnalysis>> {
        Ok(self.read()?.analyses.get(session_id).cloned().unwrap_or_default())
    }

    fn critiques(&self, session_id: &str) -> StoreResult<Vec<Critique>> {
        Ok(self.read()?.critiques.get(session_id).cloned().unwrap_or_default())
    }

    fn syntheses(&self, session_id: &str) -> StoreResult<Vec<Synthesis>> {
        Ok(self.read()?.syntheses.get(session_id).cloned().unwrap_or_default())
    }

    fn metrics(&self, session_id: &str) -> StoreResult<Vec<RunMetric>> {
        Ok(self.read()?.metrics.get(session_id).cloned().unwrap_or_default())
    }

    fn all_metrics(&self) -> StoreResult<Vec<RunMetric>> {
        Ok(self.read()?.metrics.values().flatten().cloned().collect())
    }

    fn finalize(&self, result: &FinalResult) -> StoreResult<()> {
        let mut inner = self.write()?;
        if !inner.sessions.contains_key(&result.session_id) {
            return Err(StoreError::NotFound(result.session_id.clone()));
        }
        if inner.finals.contains_key(&result.session_id) {
            return Err(StoreError::Conflict(format!(
                "session {} is already finalized",
                result.session_id
            )));
        }
        inner.finals.insert(result.session_id.clone(), result.clone());
        Ok(())
    }

    fn final_result(&self, session_id: &str) -> StoreResult<Option<FinalResult>> {
        Ok(self.read()?.finals.get(session_id).cloned())
    }

    fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner
            .sessions
            .remove(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        inner.analyses.remove(session_id);
        inner.critiques.remove(session_id);
        inner.syntheses.remove(session_id);
        inner.metrics.remove(session_id);
        inner.finals.remove(session_id);
        Ok(())
    }

    fn source(&self) -> StoreSource {
        StoreSource::Memory
    }
}
