//! Typed payloads for each phase output, centralized in one place.
//!
//! Every model-facing step declares its payload here, together with a
//! compact shape hint that prompt templates embed so agents know the exact
//! JSON to return. The parser decodes raw model text into these types and
//! the engine converts them into persisted records.

use serde::{Deserialize, Serialize};

use crate::records::{Conclusion, RunPhase};

/// Analyze-phase payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPayload {
    /// The full analysis text.
    pub analysis: String,
    /// Self-reported confidence in [0, 1]. Absent values are imputed as 0.5
    /// by the parser, with a warning.
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
}

/// Critique-phase payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiquePayload {
    /// Quality score for the target analysis, in [0, 10].
    pub score: f64,
    /// The critique prose.
    pub critique: String,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
}

/// Synthesize-phase payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisPayload {
    pub summary: String,
    #[serde(default)]
    pub conclusions: Vec<Conclusion>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub formalized_result: Option<String>,
    /// Agreement among the analyses after critique, in [0, 1].
    pub consensus_level: f64,
}

/// A validated phase output — one variant per phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhasePayload {
    Analysis(AnalysisPayload),
    Critique(CritiquePayload),
    Synthesis(SynthesisPayload),
}

impl PhasePayload {
    /// The phase this payload belongs to.
    pub fn phase(&self) -> RunPhase {
        match self {
            Self::Analysis(_) => RunPhase::Analyze,
            Self::Critique(_) => RunPhase::Critique,
            Self::Synthesis(_) => RunPhase::Synthesize,
        }
    }
}

/// Compact JSON shape embedded in prompts (and in the strict-JSON
/// reprompt) so agents know exactly what to return.
pub fn schema_hint(phase: RunPhase) -> &'static str {
    match phase {
        RunPhase::Analyze => {
            r#"{"analysis": "<full analysis>", "confidence": 0.0-1.0, "key_points": ["..."], "risks": ["..."], "assumptions": ["..."]}"#
        }
        RunPhase::Critique => {
            r#"{"score": 0.0-10.0, "critique": "<critique of the target analysis>", "weaknesses": ["..."], "strengths": ["..."]}"#
        }
        RunPhase::Synthesize => {
            r#"{"summary": "<integrated summary>", "conclusions": [{"statement": "...", "probability": 0.0-1.0, "falsification_condition": "..."}], "recommendations": ["..."], "formalized_result": null, "consensus_level": 0.0-1.0}"#
        }
    }
}
