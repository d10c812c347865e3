//! Structured-output parsing — turn free-form model text into a validated
//! phase payload.
//!
//! Extraction policy, in order:
//! 1. the first fenced code block (``` with optional language tag);
//! 2. the entire body as JSON;
//! 3. the first balanced `{…}` block.
//!
//! Validation then rejects payloads with values outside their declared
//! domain. A missing analysis confidence is imputed as 0.5 and reported as
//! a warning rather than a failure.

use serde::de::DeserializeOwned;

use crate::records::RunPhase;
use crate::schema::{AnalysisPayload, CritiquePayload, PhasePayload, SynthesisPayload};

/// How much of the offending raw text a parse error carries.
const RAW_EXCERPT_LEN: usize = 400;

/// Parse failure, carrying an excerpt of the offending raw text.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    /// No JSON-looking payload could be located in the output.
    #[error("no structured payload found in output: {raw_excerpt}")]
    NoPayload { raw_excerpt: String },

    /// A candidate was found but did not decode against the phase schema.
    #[error("payload did not match the {phase} schema: {detail}")]
    Schema {
        phase: RunPhase,
        detail: String,
        raw_excerpt: String,
    },

    /// The payload decoded but a value is outside its declared domain.
    #[error("{field} out of domain: {reason}")]
    Domain { field: &'static str, reason: String },
}

/// A successfully parsed payload plus any degraded-path warnings.
#[derive(Debug, Clone)]
pub struct ParsedOutput {
    pub payload: PhasePayload,
    /// Warning flags, e.g. `imputed_confidence`.
    pub warnings: Vec<String>,
}

fn excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() <= RAW_EXCERPT_LEN {
        trimmed.to_string()
    } else {
        let mut end = RAW_EXCERPT_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

/// Locate the first fenced code block and return its body.
fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after_fence = &raw[open + 3..];
    // Skip an optional language tag up to the first newline.
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

/// Locate the first balanced top-level `{…}` block, respecting strings.
fn balanced_braces(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn decode<T: DeserializeOwned>(phase: RunPhase, raw: &str) -> Result<T, ParseError> {
    let mut last_err = None;

    for candidate in [fenced_block(raw), Some(raw.trim()), balanced_braces(raw)]
        .into_iter()
        .flatten()
        // Only JSON-looking candidates count toward a schema failure; prose
        // with no object in it is NoPayload.
        .filter(|c| c.starts_with('{'))
    {
        match serde_json::from_str::<T>(candidate) {
            Ok(value) => return Ok(value),
            Err(e) => last_err = Some(e),
        }
    }

    match last_err {
        Some(e) => Err(ParseError::Schema {
            phase,
            detail: e.to_string(),
            raw_excerpt: excerpt(raw),
        }),
        None => Err(ParseError::NoPayload {
            raw_excerpt: excerpt(raw),
        }),
    }
}

fn check_range(field: &'static str, value: f64, lo: f64, hi: f64) -> Result<(), ParseError> {
    if value.is_finite() && (lo..=hi).contains(&value) {
        Ok(())
    } else {
        Err(ParseError::Domain {
            field,
            reason: format!("expected [{lo}, {hi}], got {value}"),
        })
    }
}

fn check_non_empty(field: &'static str, value: &str) -> Result<(), ParseError> {
    if value.trim().is_empty() {
        Err(ParseError::Domain {
            field,
            reason: "must not be empty".to_string(),
        })
    } else {
        Ok(())
    }
}

/// Parse and validate raw model output for the given phase.
pub fn parse_output(phase: RunPhase, raw: &str) -> Result<ParsedOutput, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::NoPayload {
            raw_excerpt: String::new(),
        });
    }

    match phase {
        RunPhase::Analyze => {
            let mut payload: AnalysisPayload = decode(phase, raw)?;
            check_non_empty("analysis", &payload.analysis)?;
            let mut warnings = Vec::new();
            match payload.confidence {
                Some(confidence) => check_range("confidence", confidence, 0.0, 1.0)?,
                None => {
                    payload.confidence = Some(0.5);
                    warnings.push("imputed_confidence".to_string());
                }
            }
            Ok(ParsedOutput {
                payload: PhasePayload::Analysis(payload),
                warnings,
            })
        }
        RunPhase::Critique => {
            let payload: CritiquePayload = decode(phase, raw)?;
            check_non_empty("critique", &payload.critique)?;
            check_range("score", payload.score, 0.0, 10.0)?;
            Ok(ParsedOutput {
                payload: PhasePayload::Critique(payload),
                warnings: Vec::new(),
            })
        }
        RunPhase::Synthesize => {
            let payload: SynthesisPayload = decode(phase, raw)?;
            check_non_empty("summary", &payload.summary)?;
            check_range("consensus_level", payload.consensus_level, 0.0, 1.0)?;
            for conclusion in &payload.conclusions {
                check_range("conclusions[].probability", conclusion.probability, 0.0, 1.0)?;
            }
            Ok(ParsedOutput {
                payload: PhasePayload::Synthesis(payload),
                warnings: Vec::new(),
            })
        }
    }
}
