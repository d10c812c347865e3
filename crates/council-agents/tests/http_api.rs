//! Router-level tests for the HTTP facade, driven with tower `oneshot`.

mod support;

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use council_agents::config::EngineSettings;
use council_agents::http::router;
use deliberation::AgentId;
use support::{default_stubs, test_app_state, test_app_state_with_settings, StubAdapter};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn analyze_body() -> Value {
    json!({
        "task": "Evaluate SaaS market entry",
        "task_type": "strategy",
        "enabled_agents": ["analyst", "architect"],
    })
}

#[tokio::test]
async fn health_reports_agents_and_source() {
    let (state, _h) = test_app_state(default_stubs());
    let response = router(state).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["source"], "memory");
    assert_eq!(body["agents"].as_array().unwrap().len(), 4);
    assert_eq!(body["agents"][0]["reachable"], true);
}

#[tokio::test]
async fn agents_lists_roles_and_models() {
    let (state, _h) = test_app_state(default_stubs());
    let response = router(state).oneshot(get("/agents")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let agents = body.as_array().unwrap();
    assert_eq!(agents.len(), 4);
    assert_eq!(agents[0]["id"], "analyst");
    assert_eq!(agents[0]["role"], "Logical Analyst");
    assert_eq!(agents[0]["enabled"], true);
}

#[tokio::test]
async fn analyze_sync_returns_final_result() {
    let (state, _h) = test_app_state(default_stubs());
    let response = router(state)
        .oneshot(post("/analyze", analyze_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["analyses"].as_array().unwrap().len(), 2);
    assert_eq!(body["critiques"].as_array().unwrap().len(), 2);
    assert_eq!(body["synthesis"]["consensus_level"], 0.85);
}

#[tokio::test]
async fn analyze_rejects_invalid_settings() {
    let (state, _h) = test_app_state(default_stubs());
    let mut body = analyze_body();
    body["consensus_threshold"] = json!(0.99);
    let response = router(state).oneshot(post("/analyze", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (state, _h) = test_app_state(default_stubs());
    let response = router(state)
        .oneshot(post("/analyze", json!({"task": "  ", "task_type": "audit"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn analyze_budget_exhaustion_maps_to_429() {
    let mut stubs = HashMap::new();
    for agent in AgentId::ALL {
        stubs.insert(
            agent,
            StubAdapter::new(agent.as_str()).with_tokens(4000, 2000),
        );
    }
    let (state, _h) = test_app_state(stubs);
    let mut body = analyze_body();
    body["enabled_agents"] = json!(["analyst", "architect", "explorer", "formalist"]);
    body["budget_usd"] = json!(0.05);
    body["models"] = json!({
        "analyst": "stub-model",
        "architect": "stub-model",
        "explorer": "stub-model",
        "formalist": "stub-model",
    });

    let response = router(state).oneshot(post("/analyze", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let body = body_json(response).await;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["reason"], "budget_exhausted");
}

#[tokio::test]
async fn async_flow_polls_to_completion() {
    let (state, _h) = test_app_state(default_stubs());
    let app = router(state);

    let response = app
        .clone()
        .oneshot(post("/analyze/async", analyze_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let task_id = body_json(response).await["task_id"]
        .as_str()
        .unwrap()
        .to_string();

    let mut last = Value::Null;
    for _ in 0..50 {
        let response = app
            .clone()
            .oneshot(get(&format!("/tasks/{task_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        last = body_json(response).await;
        if last["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(last["status"], "completed");
    assert_eq!(last["source"], "memory");
    assert_eq!(last["result"]["analyses"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn async_deadline_exceeded_polls_as_cancelled_with_504() {
    // Slow critiques against a one-second session deadline force a
    // deadline-exceeded termination in the background task.
    let mut stubs = HashMap::new();
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
    let (state, _h) = test_app_state_with_settings(stubs, settings);
    let app = router(state);

    let mut body = analyze_body();
    body["enabled_agents"] = json!(["analyst", "architect", "explorer", "formalist"]);
    let response = app
        .clone()
        .oneshot(post("/analyze/async", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let task_id = body_json(response).await["task_id"]
        .as_str()
        .unwrap()
        .to_string();

    let mut status_code = StatusCode::OK;
    let mut last = Value::Null;
    for _ in 0..100 {
        let response = app
            .clone()
            .oneshot(get(&format!("/tasks/{task_id}")))
            .await
            .unwrap();
        status_code = response.status();
        last = body_json(response).await;
        if last["status"] != "pending" && last["status"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Deadline abort is cancellation, not failure, and the polling
    // endpoint maps it to 504 like the sync endpoint does.
    assert_eq!(last["status"], "cancelled");
    assert_eq!(status_code, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(last["result"]["error"]["reason"], "deadline_exceeded");
    assert_eq!(last["error"], "deadline_exceeded");
    assert_eq!(last["result"]["analyses"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn unknown_task_is_404() {
    let (state, _h) = test_app_state(default_stubs());
    let response = router(state)
        .oneshot(get("/tasks/no-such-task"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_on_terminal_session_is_409() {
    let (state, _h) = test_app_state(default_stubs());
    let app = router(state);

    let response = app
        .clone()
        .oneshot(post("/analyze", analyze_body()))
        .await
        .unwrap();
    let session_id = body_json(response).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .oneshot(post(&format!("/tasks/{session_id}/cancel"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn prompt_publish_and_activate() {
    let (state, _h) = test_app_state(default_stubs());
    let app = router(state);

    let response = app
        .clone()
        .oneshot(post(
            "/studio/prompts",
            json!({
                "agent_id": "analyst",
                "prompt_type": "system",
                "content": "be extremely rigorous",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let published = body_json(response).await;
    assert_eq!(published["version"], 1);
    assert_eq!(published["is_active"], true);

    let response = app.clone().oneshot(get("/studio/prompts")).await.unwrap();
    let listing = body_json(response).await;
    assert_eq!(listing["templates"].as_array().unwrap().len(), 1);

    // Publish v2 then roll back to v1.
    app.clone()
        .oneshot(post(
            "/studio/prompts",
            json!({
                "agent_id": "analyst",
                "prompt_type": "system",
                "content": "v2",
            }),
        ))
        .await
        .unwrap();
    let response = app
        .oneshot(put(
            "/studio/prompts",
            json!({"agent_id": "analyst", "prompt_type": "system", "version": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let activated = body_json(response).await;
    assert_eq!(activated["version"], 1);
    assert_eq!(activated["content"], "be extremely rigorous");
}

#[tokio::test]
async fn experiment_lifecycle_over_http() {
    let (state, _h) = test_app_state(default_stubs());
    let app = router(state);

    let response = app
        .clone()
        .oneshot(post(
            "/studio/experiments",
            json!({
                "name": "analyst tune",
                "agent_id": "analyst",
                "prompt_type": "system",
                "variants": ["weak variant", "strong variant"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let experiment = body_json(response).await;
    let experiment_id = experiment["id"].as_str().unwrap().to_string();
    let strong = experiment["variants"][1]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(put(
            "/studio/experiments",
            json!({
                "id": experiment_id,
                "variant_id": strong,
                "test_input": "sample task",
                "quality_score": 0.9,
                "latency_ms": 120,
                "cost_usd": 0.01,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(put(
            "/studio/experiments",
            json!({"id": experiment_id, "promote": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let promoted = body_json(response).await;
    assert_eq!(promoted["promoted"]["content"], "strong variant");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/studio/experiments?id={experiment_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/studio/experiments")).await.unwrap();
    let listing = body_json(response).await;
    assert!(listing["experiments"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn metrics_period_validation() {
    let (state, _h) = test_app_state(default_stubs());
    let app = router(state);

    let response = app
        .clone()
        .oneshot(get("/studio/metrics?period=2h"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.oneshot(get("/studio/metrics?period=1h")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["source"], "memory");
    assert_eq!(body["summary"]["period"], "1h");
}

#[tokio::test]
async fn metrics_aggregate_after_a_session() {
    let (state, _h) = test_app_state(default_stubs());
    let app = router(state);

    app.clone()
        .oneshot(post("/analyze", analyze_body()))
        .await
        .unwrap();

    let response = app.oneshot(get("/studio/metrics?period=1h")).await.unwrap();
    let body = body_json(response).await;
    // 2 analyses + 2 critiques + 1 synthesis
    assert_eq!(body["summary"]["total_calls"], 5);
    assert_eq!(body["summary"]["success"], 5);
}
