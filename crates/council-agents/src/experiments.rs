//! Prompt A/B experiments — candidate variants, scored runs, and winner
//! promotion into the prompt registry.
//!
//! Experiments live outside the normal session flow: a variant is a
//! candidate prompt content string, a run is one execution of that variant
//! over a test input with quality, latency, and cost recorded. Promoting
//! the winner publishes its content as the next active template version.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use deliberation::{AgentId, PromptRegistry, PromptTemplate, PromptType};

/// Lifecycle of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Accepting variants and runs.
    Running,
    /// Winner promoted; read-only.
    Concluded,
}

/// A candidate prompt content string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub content: String,
}

/// One execution of a variant over a test input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRun {
    pub variant_id: String,
    pub test_input: String,
    /// Judged quality in [0, 1].
    pub quality_score: f64,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

/// A prompt experiment for one `(agent, prompt_type)` slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub agent_id: AgentId,
    pub prompt_type: PromptType,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    pub runs: Vec<ExperimentRun>,
    pub created_at: DateTime<Utc>,
}

/// Mean quality per variant, used to pick the winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantScore {
    pub variant_id: String,
    pub runs: u32,
    pub mean_quality: f64,
}

/// Error type for experiment operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExperimentError {
    #[error("experiment not found: {0}")]
    NotFound(String),

    #[error("unknown variant: {0}")]
    UnknownVariant(String),

    #[error("experiment {0} is concluded")]
    Concluded(String),

    #[error("no scored runs to decide a winner")]
    NoRuns,

    #[error("invalid experiment: {0}")]
    Invalid(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

/// In-process experiment catalog bound to the prompt registry.
pub struct ExperimentService {
    experiments: RwLock<HashMap<String, Experiment>>,
    registry: Arc<PromptRegistry>,
}

impl ExperimentService {
    pub fn new(registry: Arc<PromptRegistry>) -> Self {
        Self {
            experiments: RwLock::new(HashMap::new()),
            registry,
        }
    }

    /// Create an experiment with its candidate variants.
    pub fn create(
        &self,
        name: &str,
        agent_id: AgentId,
        prompt_type: PromptType,
        variant_contents: Vec<String>,
    ) -> Result<Experiment, ExperimentError> {
        if variant_contents.len() < 2 {
            return Err(ExperimentError::Invalid(
                "an experiment needs at least two variants".to_string(),
            ));
        }
        let experiment = Experiment {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            agent_id,
            prompt_type,
            status: ExperimentStatus::Running,
            variants: variant_contents
                .into_iter()
                .map(|content| Variant {
                    id: uuid::Uuid::new_v4().to_string(),
                    content,
                })
                .collect(),
            runs: Vec::new(),
            created_at: Utc::now(),
        };
        self.experiments
            .write()
            .map_err(|_| ExperimentError::LockPoisoned)?
            .insert(experiment.id.clone(), experiment.clone());
        Ok(experiment)
    }

    pub fn get(&self, id: &str) -> Result<Experiment, ExperimentError> {
        self.experiments
            .read()
            .map_err(|_| ExperimentError::LockPoisoned)?
            .get(id)
            .cloned()
            .ok_or_else(|| ExperimentError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<Experiment> {
        let mut experiments: Vec<Experiment> = match self.experiments.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        experiments
    }

    pub fn delete(&self, id: &str) -> Result<(), ExperimentError> {
        self.experiments
            .write()
            .map_err(|_| ExperimentError::LockPoisoned)?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ExperimentError::NotFound(id.to_string()))
    }

    /// Record a scored run for a variant.
    pub fn record_run(
        &self,
        experiment_id: &str,
        variant_id: &str,
        test_input: &str,
        quality_score: f64,
        latency_ms: u64,
        cost_usd: f64,
    ) -> Result<(), ExperimentError> {
        if !(0.0..=1.0).contains(&quality_score) {
            return Err(ExperimentError::Invalid(format!(
                "quality_score must be in [0, 1], got {quality_score}"
            )));
        }
        let mut experiments = self
            .experiments
            .write()
            .map_err(|_| ExperimentError::LockPoisoned)?;
        let experiment = experiments
            .get_mut(experiment_id)
            .ok_or_else(|| ExperimentError::NotFound(experiment_id.to_string()))?;
        if experiment.status == ExperimentStatus::Concluded {
            return Err(ExperimentError::Concluded(experiment_id.to_string()));
        }
        if !experiment.variants.iter().any(|v| v.id == variant_id) {
            return Err(ExperimentError::UnknownVariant(variant_id.to_string()));
        }
        experiment.runs.push(ExperimentRun {
            variant_id: variant_id.to_string(),
            test_input: test_input.to_string(),
            quality_score,
            latency_ms,
            cost_usd,
            created_at: Utc::now(),
        });
        Ok(())
    }

    /// Mean quality per variant, best first. Variants without runs are
    /// excluded.
    pub fn scores(&self, experiment_id: &str) -> Result<Vec<VariantScore>, ExperimentError> {
        let experiment = self.get(experiment_id)?;
        let mut scores = Vec::new();
        for variant in &experiment.variants {
            let qualities: Vec<f64> = experiment
                .runs
                .iter()
                .filter(|r| r.variant_id == variant.id)
                .map(|r| r.quality_score)
                .collect();
            if qualities.is_empty() {
                continue;
            }
            scores.push(VariantScore {
                variant_id: variant.id.clone(),
                runs: qualities.len() as u32,
                mean_quality: qualities.iter().sum::<f64>() / qualities.len() as f64,
            });
        }
        scores.sort_by(|a, b| {
            b.mean_quality
                .partial_cmp(&a.mean_quality)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(scores)
    }

    /// Promote the best-scoring variant: publish its content as the next
    /// active template version and conclude the experiment.
    pub fn promote_winner(&self, experiment_id: &str) -> Result<PromptTemplate, ExperimentError> {
        let scores = self.scores(experiment_id)?;
        let winner = scores.first().ok_or(ExperimentError::NoRuns)?.clone();

        let mut experiments = self
            .experiments
            .write()
            .map_err(|_| ExperimentError::LockPoisoned)?;
        let experiment = experiments
            .get_mut(experiment_id)
            .ok_or_else(|| ExperimentError::NotFound(experiment_id.to_string()))?;
        if experiment.status == ExperimentStatus::Concluded {
            return Err(ExperimentError::Concluded(experiment_id.to_string()));
        }
        let content = experiment
            .variants
            .iter()
            .find(|v| v.id == winner.variant_id)
            .map(|v| v.content.clone())
            .ok_or_else(|| ExperimentError::UnknownVariant(winner.variant_id.clone()))?;

        let template = self
            .registry
            .publish(experiment.agent_id, experiment.prompt_type, &content)
            .map_err(|e| ExperimentError::Invalid(e.to_string()))?;
        experiment.status = ExperimentStatus::Concluded;

        tracing::info!(
            experiment = %experiment.id,
            variant = %winner.variant_id,
            mean_quality = winner.mean_quality,
            version = template.version,
            "experiment winner promoted"
        );
        Ok(template)
    }
}
