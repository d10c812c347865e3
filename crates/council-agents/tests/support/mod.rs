//! Shared test support: deterministic scripted provider adapters and an
//! engine harness wired over the in-memory store.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use council_agents::config::EngineSettings;
use council_agents::engine::DeliberationEngine;
use council_agents::prompts::PromptResolver;
use council_agents::providers::{
    ProviderAdapter, ProviderError, ProviderRequest, ProviderResponse,
};
use council_agents::runner::AgentRunner;
use deliberation::{
    AgentId, EventBus, MemoryStore, PromptRegistry, Session, SessionSettings, SessionStore,
    SharedEventBus, TaskType,
};

/// Which phase a stubbed request belongs to, inferred from the prompt.
fn phase_of(request: &ProviderRequest) -> &'static str {
    if request.user_prompt.contains("consensus_level") {
        "synthesize"
    } else if request.user_prompt.contains("\"score\"") {
        "critique"
    } else {
        "analyze"
    }
}

/// Extract the critique target marker from a critique prompt.
fn critique_target(request: &ProviderRequest) -> String {
    request
        .user_prompt
        .split("TARGET, from ")
        .nth(1)
        .and_then(|rest| rest.split(')').next())
        .unwrap_or("unknown")
        .to_string()
}

/// Deterministic scripted provider adapter.
pub struct StubAdapter {
    name: String,
    confidence: f64,
    tokens: (u32, u32),
    /// Consensus levels returned by successive synthesize calls; the last
    /// value repeats once the script is spent.
    consensus: Mutex<VecDeque<f64>>,
    always_rate_limited: bool,
    fail_critiques: bool,
    prose_first_analyze: AtomicBool,
    critique_delay: Option<Duration>,
    /// Every request this adapter received, in arrival order.
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl StubAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            confidence: 0.8,
            tokens: (100, 50),
            consensus: Mutex::new(VecDeque::from([0.85])),
            always_rate_limited: false,
            fail_critiques: false,
            prose_first_analyze: AtomicBool::new(false),
            critique_delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_tokens(mut self, tokens_in: u32, tokens_out: u32) -> Self {
        self.tokens = (tokens_in, tokens_out);
        self
    }

    pub fn with_consensus(mut self, levels: Vec<f64>) -> Self {
        self.consensus = Mutex::new(levels.into());
        self
    }

    pub fn always_rate_limited(mut self) -> Self {
        self.always_rate_limited = true;
        self
    }

    pub fn fail_critiques(mut self) -> Self {
        self.fail_critiques = true;
        self
    }

    pub fn prose_first_analyze(self) -> Self {
        self.prose_first_analyze.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_critique_delay(mut self, delay: Duration) -> Self {
        self.critique_delay = Some(delay);
        self
    }

    fn next_consensus(&self) -> f64 {
        let mut script = self.consensus.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            *script.front().unwrap_or(&0.85)
        }
    }

    fn respond(&self, text: String) -> ProviderResponse {
        ProviderResponse {
            text,
            tokens_in: self.tokens.0,
            tokens_out: self.tokens.1,
            model_id: "stub-model".to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for StubAdapter {
    async fn invoke(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());

        if self.always_rate_limited {
            return Err(ProviderError::RateLimited);
        }

        match phase_of(&request) {
            "analyze" => {
                if self.prose_first_analyze.swap(false, Ordering::SeqCst) {
                    return Ok(self.respond(
                        "Let me think about this in prose instead of JSON.".to_string(),
                    ));
                }
                Ok(self.respond(
                    json!({
                        "analysis": format!("{} position on the task", self.name),
                        "confidence": self.confidence,
                        "key_points": ["core point"],
                        "risks": ["main risk"],
                        "assumptions": ["baseline assumption"],
                    })
                    .to_string(),
                ))
            }
            "critique" => {
                if self.fail_critiques {
                    return Err(ProviderError::Upstream {
                        status: 500,
                        message: "critique backend down".to_string(),
                    });
                }
                if let Some(delay) = self.critique_delay {
                    tokio::time::sleep(delay).await;
                }
                let target = critique_target(&request);
                Ok(self.respond(
                    json!({
                        "score": 7.0,
                        "critique": format!("target={target} needs more depth"),
                        "weaknesses": ["thin evidence"],
                        "strengths": ["clear structure"],
                    })
                    .to_string(),
                ))
            }
            _ => Ok(self.respond(
                json!({
                    "summary": "integrated panel summary",
                    "conclusions": [
                        {"statement": "primary direction holds", "probability": 0.8,
                         "falsification_condition": "a counterexample ships"}
                    ],
                    "recommendations": ["proceed with the pilot"],
                    "consensus_level": self.next_consensus(),
                })
                .to_string(),
            )),
        }
    }

    async fn reachable(&self) -> bool {
        !self.always_rate_limited
    }

    fn endpoint_name(&self) -> &str {
        &self.name
    }
}

/// Engine plus its collaborators, wired over stub adapters.
pub struct Harness {
    pub engine: Arc<DeliberationEngine>,
    pub store: Arc<dyn SessionStore>,
    pub bus: SharedEventBus,
    pub registry: Arc<PromptRegistry>,
    pub adapters: HashMap<AgentId, Arc<StubAdapter>>,
}

/// Fast engine settings so retry backoffs stay test-friendly.
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        call_timeout_secs: 5,
        session_timeout_secs: 60,
        max_retries: 2,
        max_in_flight_per_provider: 4,
    }
}

/// Build a harness with one stub adapter per agent.
pub fn harness(stubs: HashMap<AgentId, StubAdapter>) -> Harness {
    harness_with_settings(stubs, test_settings())
}

pub fn harness_with_settings(
    stubs: HashMap<AgentId, StubAdapter>,
    settings: EngineSettings,
) -> Harness {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let bus = EventBus::new().shared();
    let registry = Arc::new(PromptRegistry::new());

    let adapters: HashMap<AgentId, Arc<StubAdapter>> = stubs
        .into_iter()
        .map(|(agent, stub)| (agent, Arc::new(stub)))
        .collect();
    let dyn_adapters: HashMap<AgentId, Arc<dyn ProviderAdapter>> = adapters
        .iter()
        .map(|(agent, stub)| (*agent, stub.clone() as Arc<dyn ProviderAdapter>))
        .collect();

    let runner = Arc::new(AgentRunner::new(
        dyn_adapters,
        PromptResolver::new(registry.clone()),
        store.clone(),
        bus.clone(),
        settings.clone(),
    ));
    let engine = Arc::new(DeliberationEngine::new(
        store.clone(),
        bus.clone(),
        runner,
        settings,
    ));

    Harness {
        engine,
        store,
        bus,
        registry,
        adapters,
    }
}

/// An HTTP application state wired over stub adapters.
pub fn test_app_state(stubs: HashMap<AgentId, StubAdapter>) -> (council_agents::http::AppState, Harness) {
    test_app_state_with_settings(stubs, test_settings())
}

pub fn test_app_state_with_settings(
    stubs: HashMap<AgentId, StubAdapter>,
    settings: EngineSettings,
) -> (council_agents::http::AppState, Harness) {
    let h = harness_with_settings(stubs, settings);
    let experiments = Arc::new(council_agents::experiments::ExperimentService::new(
        h.registry.clone(),
    ));
    let config = Arc::new(council_agents::config::CouncilConfig::gateway(
        "http://localhost:4000/v1",
        "test-key",
    ));
    let state = council_agents::http::AppState::new(h.engine.clone(), experiments, config);
    (state, h)
}

/// Default stubs for all four agents.
pub fn default_stubs() -> HashMap<AgentId, StubAdapter> {
    AgentId::ALL
        .iter()
        .map(|agent| (*agent, StubAdapter::new(agent.as_str())))
        .collect()
}

/// A pending session stored and ready to run.
pub fn make_session(harness: &Harness, settings: SessionSettings) -> Session {
    let session = Session::new("Evaluate SaaS market entry", TaskType::Strategy, settings);
    harness.store.create_session(&session).unwrap();
    session
}
