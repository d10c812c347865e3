//! Service configuration — provider endpoints per agent and engine knobs.
//!
//! Precedence (highest to lowest):
//! 1. `COUNCIL_*` environment variables
//! 2. values from a TOML config file (`--config`)
//! 3. built-in defaults (every agent on one OpenAI-compatible gateway)
//!
//! All four default providers are reached through chat-completions
//! gateways, so one gateway URL covers the whole panel out of the box;
//! per-agent URL/key/model overrides split them across real providers.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use deliberation::AgentId;
use serde::Deserialize;

/// Default gateway serving all agents (LiteLLM-style proxy).
const DEFAULT_GATEWAY_URL: &str = "http://localhost:4000/v1";
const DEFAULT_GATEWAY_KEY: &str = "not-needed";

/// Default per-call deadline in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;
/// Default whole-session wall-clock deadline in seconds.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 600;
/// Default retry count for transient provider errors (3 attempts total).
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Default soft cap on in-flight calls per provider endpoint.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// One provider endpoint bound to an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    pub api_key: String,
    /// Model used when the session does not override it.
    pub model: String,
}

/// Engine timing and concurrency knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub call_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub max_retries: u32,
    pub max_in_flight_per_provider: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: env_u64("COUNCIL_CALL_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT_SECS),
            session_timeout_secs: env_u64(
                "COUNCIL_SESSION_TIMEOUT_SECS",
                DEFAULT_SESSION_TIMEOUT_SECS,
            ),
            max_retries: env_u64("COUNCIL_MAX_RETRIES", DEFAULT_MAX_RETRIES as u64) as u32,
            max_in_flight_per_provider: env_u64(
                "COUNCIL_MAX_IN_FLIGHT",
                DEFAULT_MAX_IN_FLIGHT as u64,
            ) as usize,
        }
    }
}

/// File shape for the optional TOML config.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    agents: BTreeMap<String, EndpointConfig>,
    #[serde(default)]
    engine: Option<EngineSettings>,
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct CouncilConfig {
    pub endpoints: BTreeMap<AgentId, EndpointConfig>,
    pub engine: EngineSettings,
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_override(agent: AgentId, suffix: &str) -> Option<String> {
    let var = format!("COUNCIL_{}_{suffix}", agent.as_str().to_uppercase());
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn default_endpoint(agent: AgentId) -> EndpointConfig {
    let gateway_url =
        std::env::var("COUNCIL_GATEWAY_URL").unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string());
    let gateway_key =
        std::env::var("COUNCIL_GATEWAY_KEY").unwrap_or_else(|_| DEFAULT_GATEWAY_KEY.to_string());
    EndpointConfig {
        base_url: gateway_url,
        api_key: gateway_key,
        model: agent.default_model().to_string(),
    }
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self::from_file_contents(None)
    }
}

impl CouncilConfig {
    /// Load from an optional TOML file, then apply env overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let file = match config_path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                Some(
                    toml::from_str::<ConfigFile>(&contents)
                        .with_context(|| format!("parsing config file {}", path.display()))?,
                )
            }
            None => None,
        };
        Ok(Self::from_file_contents(file))
    }

    fn from_file_contents(file: Option<ConfigFile>) -> Self {
        let file = file.unwrap_or_default();
        let mut endpoints = BTreeMap::new();

        for agent in AgentId::ALL {
            let mut endpoint = file
                .agents
                .get(agent.as_str())
                .cloned()
                .unwrap_or_else(|| default_endpoint(agent));
            if let Some(url) = env_override(agent, "URL") {
                endpoint.base_url = url;
            }
            if let Some(key) = env_override(agent, "API_KEY") {
                endpoint.api_key = key;
            }
            if let Some(model) = env_override(agent, "MODEL") {
                endpoint.model = model;
            }
            endpoints.insert(agent, endpoint);
        }

        Self {
            endpoints,
            engine: file.engine.unwrap_or_default(),
        }
    }

    /// Configuration pointing every agent at one gateway. Used by
    /// integration setups running against a local proxy.
    pub fn gateway(url: &str, api_key: &str) -> Self {
        let mut endpoints = BTreeMap::new();
        for agent in AgentId::ALL {
            endpoints.insert(
                agent,
                EndpointConfig {
                    base_url: url.to_string(),
                    api_key: api_key.to_string(),
                    model: agent.default_model().to_string(),
                },
            );
        }
        Self {
            endpoints,
            engine: EngineSettings::default(),
        }
    }

    /// Endpoint for an agent. Every agent always has one.
    pub fn endpoint(&self, agent: AgentId) -> &EndpointConfig {
        &self.endpoints[&agent]
    }
}
