//! End-to-end engine scenarios over deterministic stub providers.

mod support;

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use council_agents::config::EngineSettings;
use deliberation::{
    AgentId, DeliberationEvent, EventFilter, FailureReason, SessionSettings, SessionStatus,
};
use support::{default_stubs, harness, harness_with_settings, make_session, StubAdapter};

fn run_token() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn s1_happy_path_single_iteration() {
    let h = harness(default_stubs());
    let session = make_session(&h, SessionSettings::default());

    let result = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.totals.iterations_used, 1);
    assert_eq!(result.analyses.len(), 4);
    assert_eq!(result.critiques.len(), 12);
    assert_eq!(result.syntheses.len(), 1);
    assert_eq!(result.consensus_level(), Some(0.85));
    assert_eq!(result.totals.agents_used, 4);
    assert!(result.error.is_none());

    // Record invariants: confidences and scores in range, no self-critique,
    // every analysis from an enabled agent.
    for analysis in &result.analyses {
        assert!((0.0..=1.0).contains(&analysis.confidence));
        assert!(session
            .settings
            .enabled_agents
            .contains(&analysis.agent_id));
    }
    for critique in &result.critiques {
        assert_ne!(critique.from_agent, critique.to_agent);
        assert!((0.0..=10.0).contains(&critique.score));
    }

    // Cost totals always come from the metric rows.
    let metric_cost: f64 = h
        .store
        .metrics(&session.id)
        .unwrap()
        .iter()
        .map(|m| m.cost_usd)
        .sum();
    assert!((result.totals.total_cost_usd - metric_cost).abs() < 1e-9);
    assert!(metric_cost <= session.settings.budget_usd);
}

#[tokio::test]
async fn s2_refine_then_stop() {
    let mut stubs = default_stubs();
    stubs.insert(
        AgentId::Architect,
        StubAdapter::new("architect").with_consensus(vec![0.70, 0.82]),
    );
    let h = harness(stubs);
    let settings = SessionSettings {
        consensus_threshold: 0.80,
        max_iterations: 3,
        ..Default::default()
    };
    let session = make_session(&h, settings);

    let result = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.totals.iterations_used, 2);
    assert_eq!(result.syntheses.len(), 2);
    assert_eq!(result.analyses.len(), 8);
    assert_eq!(result.critiques.len(), 24);

    // Monotonic consensus across a refinement.
    assert!(result.syntheses[0].consensus_level <= result.syntheses[1].consensus_level);
    assert_eq!(result.consensus_level(), Some(0.82));

    // The second Analyzing pass must show each agent the critiques aimed
    // at it, and only those.
    let analyst_requests = h.adapters[&AgentId::Analyst].requests.lock().unwrap();
    let refine_prompt = analyst_requests
        .iter()
        .find(|r| r.user_prompt.contains("Critiques of your last analysis"))
        .expect("refinement analyze prompt");
    assert!(refine_prompt.user_prompt.contains("target=analyst needs more depth"));
    assert!(!refine_prompt.user_prompt.contains("target=explorer needs more depth"));
    assert!(refine_prompt.user_prompt.contains("integrated panel summary"));
}

#[tokio::test]
async fn s3_budget_stop_after_grace_synthesis() {
    let mut stubs = std::collections::HashMap::new();
    for agent in AgentId::ALL {
        // 4000 in / 2000 out on an unpriced model = 0.02 USD per call.
        stubs.insert(
            agent,
            StubAdapter::new(agent.as_str()).with_tokens(4000, 2000),
        );
    }
    let h = harness(stubs);
    let settings = SessionSettings {
        budget_usd: 0.05,
        models: AgentId::ALL
            .iter()
            .map(|a| (*a, "stub-model".to_string()))
            .collect::<BTreeMap<_, _>>(),
        ..Default::default()
    };
    let session = make_session(&h, settings);

    let result = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Failed);
    assert!(matches!(
        result.error,
        Some(FailureReason::BudgetExhausted { .. })
    ));
    // The analyses landed, critiques were never issued, and one grace
    // synthesis makes the partial result usable.
    assert_eq!(result.analyses.len(), 4);
    assert!(result.critiques.is_empty());
    assert_eq!(result.syntheses.len(), 1);
    assert!(result.synthesis.is_some());
}

#[tokio::test]
async fn s4_one_provider_down() {
    let mut stubs = default_stubs();
    stubs.insert(
        AgentId::Formalist,
        StubAdapter::new("formalist").always_rate_limited(),
    );
    let h = harness(stubs);
    let session = make_session(&h, SessionSettings::default());

    let result = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.analyses.len(), 3);
    assert_eq!(result.critiques.len(), 6);
    assert_eq!(result.totals.agents_used, 3);
    assert!(result
        .analyses
        .iter()
        .all(|a| a.agent_id != AgentId::Formalist));

    // The downed provider exhausted its retries and left error metrics.
    let metrics = h.store.metrics(&session.id).unwrap();
    let formalist_errors = metrics
        .iter()
        .filter(|m| m.agent_id == AgentId::Formalist)
        .count();
    assert_eq!(formalist_errors, 3); // 1 attempt + 2 retries
}

#[tokio::test]
async fn s5_invalid_json_then_recovery() {
    let mut stubs = default_stubs();
    stubs.insert(
        AgentId::Explorer,
        StubAdapter::new("explorer").prose_first_analyze(),
    );
    let h = harness(stubs);
    let session = make_session(&h, SessionSettings::default());

    let result = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.analyses.len(), 4);

    // Exactly one extra RunMetric for the reprompted analyze call.
    let metrics = h.store.metrics(&session.id).unwrap();
    let explorer_analyze: Vec<_> = metrics
        .iter()
        .filter(|m| {
            m.agent_id == AgentId::Explorer
                && m.phase == deliberation::RunPhase::Analyze
        })
        .collect();
    assert_eq!(explorer_analyze.len(), 2);
    assert_eq!(
        explorer_analyze
            .iter()
            .filter(|m| m.status == deliberation::RunStatus::Error)
            .count(),
        1
    );

    // The retry carried the strict-JSON instruction.
    let requests = h.adapters[&AgentId::Explorer].requests.lock().unwrap();
    assert!(requests
        .iter()
        .any(|r| r.user_prompt.contains("not valid JSON")));
}

#[tokio::test]
async fn s6_cancellation_mid_critique() {
    let mut stubs = std::collections::HashMap::new();
    for agent in AgentId::ALL {
        stubs.insert(
            agent,
            StubAdapter::new(agent.as_str()).with_critique_delay(Duration::from_secs(5)),
        );
    }
    let h = harness(stubs);
    let session = make_session(&h, SessionSettings::default());

    let mut phase_events = h
        .bus
        .subscribe_filtered(EventFilter::new().session(&session.id).types(vec!["phase_start"]));

    let cancel = run_token();
    let engine = h.engine.clone();
    let session_id = session.id.clone();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { engine.run_session(&session_id, cancel).await }
    });

    // Cancel once the critique phase has begun.
    loop {
        match phase_events.recv().await {
            Some(DeliberationEvent::PhaseStart { phase, .. }) if phase == "critiquing" => {
                cancel.cancel();
                break;
            }
            Some(_) => continue,
            None => panic!("bus closed before critiquing started"),
        }
    }

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, SessionStatus::Cancelled);
    assert!(matches!(result.error, Some(FailureReason::Cancelled)));
    // Completed records were persisted; aborted critiques were not.
    assert_eq!(result.analyses.len(), 4);
    assert!(result.critiques.is_empty());
    assert!(result.synthesis.is_none());
}

#[tokio::test]
async fn single_agent_skips_critiques() {
    let h = harness(default_stubs());
    let settings = SessionSettings {
        enabled_agents: vec![AgentId::Analyst],
        ..Default::default()
    };
    let session = make_session(&h, settings);

    let result = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.analyses.len(), 1);
    assert!(result.critiques.is_empty());
    assert!(result.synthesis.is_some());
}

#[tokio::test]
async fn all_critiques_failing_degrades_to_analyses_only() {
    let mut stubs = std::collections::HashMap::new();
    for agent in AgentId::ALL {
        stubs.insert(agent, StubAdapter::new(agent.as_str()).fail_critiques());
    }
    // No transport retries so the collapsed wave resolves quickly.
    let settings = EngineSettings {
        max_retries: 0,
        ..support::test_settings()
    };
    let h = harness_with_settings(stubs, settings);
    let session = make_session(&h, SessionSettings::default());

    let result = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.analyses.len(), 4);
    assert!(result.critiques.is_empty());
    assert!(result.synthesis.is_some());
}

#[tokio::test]
async fn iteration_cap_of_one_stops_regardless_of_consensus() {
    let mut stubs = default_stubs();
    stubs.insert(
        AgentId::Architect,
        StubAdapter::new("architect").with_consensus(vec![0.55]),
    );
    let h = harness(stubs);
    let settings = SessionSettings {
        max_iterations: 1,
        ..Default::default()
    };
    let session = make_session(&h, settings.clone());

    let result = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.totals.iterations_used, 1);
    assert!(result.totals.iterations_used <= settings.max_iterations);
    assert_eq!(result.consensus_level(), Some(0.55));
}

#[tokio::test]
async fn session_deadline_exceeded() {
    let mut stubs = std::collections::HashMap::new();
    for agent in AgentId::ALL {
        stubs.insert(
            agent,
            StubAdapter::new(agent.as_str()).with_critique_delay(Duration::from_secs(3)),
        );
    }
    let settings = EngineSettings {
        session_timeout_secs: 1,
        max_retries: 0,
        ..support::test_settings()
    };
    let h = harness_with_settings(stubs, settings);
    let session = make_session(&h, SessionSettings::default());

    let result = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Cancelled);
    assert!(matches!(result.error, Some(FailureReason::DeadlineExceeded)));
    assert_eq!(result.analyses.len(), 4);
}

#[tokio::test]
async fn rerunning_completed_session_is_a_noop() {
    let h = harness(default_stubs());
    let session = make_session(&h, SessionSettings::default());

    let first = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();
    let second = h
        .engine
        .run_session(&session.id, run_token())
        .await
        .unwrap();

    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::to_value(&second).unwrap()
    );
    // No extra provider calls were made by the second run.
    let calls: usize = h
        .adapters
        .values()
        .map(|a| a.requests.lock().unwrap().len())
        .sum();
    assert_eq!(calls, 17); // 4 analyses + 12 critiques + 1 synthesis
}

#[tokio::test]
async fn synthesis_prompt_is_reproducible() {
    let prompt_of = |h: &support::Harness| {
        let requests = h.adapters[&AgentId::Architect].requests.lock().unwrap();
        requests
            .iter()
            .find(|r| r.user_prompt.contains("consensus_level"))
            .expect("synthesis prompt")
            .user_prompt
            .clone()
    };

    let h1 = harness(default_stubs());
    let s1 = make_session(&h1, SessionSettings::default());
    h1.engine.run_session(&s1.id, run_token()).await.unwrap();

    let h2 = harness(default_stubs());
    let s2 = make_session(&h2, SessionSettings::default());
    h2.engine.run_session(&s2.id, run_token()).await.unwrap();

    assert_eq!(prompt_of(&h1), prompt_of(&h2));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let h = harness(default_stubs());
    let err = h
        .engine
        .run_session("no-such-session", run_token())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}
