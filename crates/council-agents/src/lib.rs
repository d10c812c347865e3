//! Multi-agent deliberation service.
//!
//! Fans a task out to four differently-specialized model agents, runs
//! adversarial cross-critique, synthesizes a single answer with explicit
//! uncertainty, and iterates until consensus, budget, or the iteration cap
//! stops it. Domain primitives live in the `deliberation` crate; this
//! crate adds the provider transports, the agent runner, the engine loop,
//! and the HTTP facade.

pub mod config;
pub mod engine;
pub mod experiments;
pub mod http;
pub mod prompts;
pub mod providers;
pub mod runner;
pub mod telemetry;

use std::collections::HashMap;
use std::sync::Arc;

use deliberation::{AgentId, EventBus, MemoryStore, PromptRegistry, SessionStore};

use config::CouncilConfig;
use engine::DeliberationEngine;
use experiments::ExperimentService;
use http::AppState;
use prompts::PromptResolver;
use providers::{HttpAdapter, ProviderAdapter};
use runner::AgentRunner;

/// Wire the full service over HTTP provider adapters and an in-memory
/// store. Storage credentials are the caller's concern; without them the
/// store runs in memory (single-process, ephemeral).
pub fn build_app_state(config: CouncilConfig) -> AppState {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    build_app_state_with_store(config, store)
}

/// Wire the service over an explicit store implementation.
pub fn build_app_state_with_store(
    config: CouncilConfig,
    store: Arc<dyn SessionStore>,
) -> AppState {
    let bus = EventBus::new().shared();
    let registry = Arc::new(PromptRegistry::new());

    let mut adapters: HashMap<AgentId, Arc<dyn ProviderAdapter>> = HashMap::new();
    for agent in AgentId::ALL {
        let endpoint = config.endpoint(agent);
        adapters.insert(
            agent,
            Arc::new(HttpAdapter::new(
                agent.as_str(),
                &endpoint.base_url,
                &endpoint.api_key,
            )),
        );
    }

    let runner = Arc::new(AgentRunner::new(
        adapters,
        PromptResolver::new(registry.clone()),
        store.clone(),
        bus.clone(),
        config.engine.clone(),
    ));
    let engine = Arc::new(DeliberationEngine::new(
        store,
        bus,
        runner,
        config.engine.clone(),
    ));
    let experiments = Arc::new(ExperimentService::new(registry));

    AppState::new(engine, experiments, Arc::new(config))
}
