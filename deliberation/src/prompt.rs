//! Versioned prompt templates with a read-mostly registry.
//!
//! At most one template is active per `(agent, prompt_type)`. Publishing a
//! new version deactivates the previous active one. The registry is the
//! process-wide cache the resolver reads through; writes take the single
//! writer lock and are immediately visible.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::AgentId;

/// Kind of prompt a template provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    /// Role preamble for the agent.
    System,
    /// Analyze-phase user prompt.
    UserTemplate,
    /// Critique-phase user prompt.
    Critique,
    /// Synthesize-phase user prompt.
    Synthesis,
}

impl std::fmt::Display for PromptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::UserTemplate => write!(f, "user_template"),
            Self::Critique => write!(f, "critique"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// One version of a prompt for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub agent_id: AgentId,
    pub prompt_type: PromptType,
    /// Version lineage, starting at 1.
    pub version: u32,
    pub content: String,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

/// Error type for registry operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PromptError {
    #[error("no template for ({agent}, {prompt_type}) version {version}")]
    VersionNotFound {
        agent: AgentId,
        prompt_type: PromptType,
        version: u32,
    },

    #[error("lock poisoned")]
    LockPoisoned,
}

/// In-process registry of prompt template versions.
#[derive(Default)]
pub struct PromptRegistry {
    inner: RwLock<HashMap<(AgentId, PromptType), Vec<PromptTemplate>>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish new content as the next version and make it active.
    pub fn publish(
        &self,
        agent: AgentId,
        prompt_type: PromptType,
        content: &str,
    ) -> Result<PromptTemplate, PromptError> {
        let mut inner = self.inner.write().map_err(|_| PromptError::LockPoisoned)?;
        let versions = inner.entry((agent, prompt_type)).or_default();
        let next_version = versions.iter().map(|t| t.version).max().unwrap_or(0) + 1;
        for existing in versions.iter_mut() {
            existing.is_active = false;
        }
        let template = PromptTemplate {
            agent_id: agent,
            prompt_type,
            version: next_version,
            content: content.to_string(),
            is_active: true,
            updated_at: Utc::now(),
        };
        versions.push(template.clone());
        tracing::info!(
            agent = %agent,
            prompt_type = %prompt_type,
            version = next_version,
            "prompt template published"
        );
        Ok(template)
    }

    /// Make a stored version the active one.
    pub fn activate(
        &self,
        agent: AgentId,
        prompt_type: PromptType,
        version: u32,
    ) -> Result<PromptTemplate, PromptError> {
        let mut inner = self.inner.write().map_err(|_| PromptError::LockPoisoned)?;
        let versions = inner
            .get_mut(&(agent, prompt_type))
            .ok_or(PromptError::VersionNotFound {
                agent,
                prompt_type,
                version,
            })?;
        if !versions.iter().any(|t| t.version == version) {
            return Err(PromptError::VersionNotFound {
                agent,
                prompt_type,
                version,
            });
        }
        let mut activated = None;
        for template in versions.iter_mut() {
            template.is_active = template.version == version;
            if template.is_active {
                template.updated_at = Utc::now();
                activated = Some(template.clone());
            }
        }
        Ok(activated.expect("version presence checked above"))
    }

    /// The active template for `(agent, prompt_type)`, if any.
    pub fn active(&self, agent: AgentId, prompt_type: PromptType) -> Option<PromptTemplate> {
        self.inner
            .read()
            .ok()?
            .get(&(agent, prompt_type))?
            .iter()
            .find(|t| t.is_active)
            .cloned()
    }

    /// All stored templates, all versions.
    pub fn list(&self) -> Vec<PromptTemplate> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return Vec::new(),
        };
        let mut templates: Vec<PromptTemplate> =
            inner.values().flatten().cloned().collect();
        templates.sort_by(|a, b| {
            (a.agent_id, a.prompt_type as u8, a.version).cmp(&(
                b.agent_id,
                b.prompt_type as u8,
                b.version,
            ))
        });
        templates
    }
}
