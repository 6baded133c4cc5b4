//! HTTP integration tests for the Waypoint REST API.
//!
//! The app runs on in-memory stores with a scripted model, so these tests need
//! no database. They drive the Axum router with `oneshot` and also call the
//! inner functions directly.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use waypoint_core::agent::{ModelResponse, ScriptedModel};
use waypoint_core::models::NewMessage;
use waypoint_core::{GenerateOptions, MemoryStore, WaypointConfig};
use waypoint_server::app::App;
use waypoint_server::http::{build_router, health_inner, version_inner, HttpState};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn japan_suggestions() -> ModelResponse {
    ModelResponse::object(json!({"suggestions": [
        {"location": "Kyoto", "description": "temples, tea houses and gardens"},
        {"location": "Tokyo", "description": "food markets and neon nights"},
        {"location": "Hakone", "description": "hot springs with views of Fuji"}
    ]}))
}

fn scripted_app(responses: Vec<ModelResponse>) -> (Arc<App>, Arc<ScriptedModel>) {
    let model = Arc::new(ScriptedModel::new(responses));
    let app = App::assemble(WaypointConfig::default(), None, model.clone()).unwrap();
    (Arc::new(app), model)
}

fn router(app: Arc<App>) -> Router {
    build_router(Arc::new(HttpState { app }))
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let req = match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

// ===========================================================================
// Travel workflow: suspend with suggestions, resume with a selection
// ===========================================================================
#[tokio::test]
async fn test_travel_workflow_suspends_then_completes() {
    let (app, model) = scripted_app(vec![
        japan_suggestions(),
        ModelResponse::text("Day 1: Fushimi Inari at dawn. Day 2: Arashiyama bamboo grove."),
    ]);
    let router = router(app);

    let (status, body) = call(
        &router,
        "POST",
        "/workflows/travel-agent-workflow/runs",
        Some(json!({"vacationDescription": "5 days in Japan"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "start failed: {body}");
    assert_eq!(body["status"], "suspended");
    assert_eq!(body["step_id"], "human-input");
    let suggestions = body["payload"]["suggestions"].as_array().unwrap();
    assert_eq!(suggestions.len(), 3);
    assert_eq!(suggestions[0], "Kyoto: temples, tea houses and gardens");
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let (status, run) = call(&router, "GET", &format!("/runs/{run_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "suspended");

    let (status, body) = call(
        &router,
        "POST",
        &format!("/runs/{run_id}/resume"),
        Some(json!({"selection": "Kyoto: temples, tea houses and gardens"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "resume failed: {body}");
    assert_eq!(body["status"], "completed");
    let plan = body["output"]["travelPlan"].as_str().unwrap();
    assert!(!plan.is_empty());

    // planner saw the original description as an assistant turn, then the selection
    let requests = model.requests().await;
    assert_eq!(requests.len(), 2);
    let planner = &requests[1].messages;
    let tail: Vec<String> = planner.iter().rev().take(2).map(|m| m.content.as_text()).collect();
    assert_eq!(tail, vec!["Kyoto: temples, tea houses and gardens", "5 days in Japan"]);

    let (status, body) = call(
        &router,
        "POST",
        &format!("/runs/{run_id}/resume"),
        Some(json!({"selection": "Tokyo"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "invalid_run_state");
}

#[tokio::test]
async fn test_invalid_resume_reports_step_and_keeps_run_suspended() {
    let (app, _) = scripted_app(vec![japan_suggestions()]);
    let router = router(app);

    let (_, body) = call(
        &router,
        "POST",
        "/workflows/travel-agent-workflow/runs",
        Some(json!({"vacationDescription": "5 days in Japan"})),
    )
    .await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &router,
        "POST",
        &format!("/runs/{run_id}/resume"),
        Some(json!({"selection": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "resume_schema_violation");
    assert_eq!(body["step_id"], "human-input");

    let (_, run) = call(&router, "GET", &format!("/runs/{run_id}"), None).await;
    assert_eq!(run["status"], "suspended");
}

#[tokio::test]
async fn test_empty_selection_suspends_again() {
    let (app, _) = scripted_app(vec![japan_suggestions()]);
    let router = router(app);

    let (_, body) = call(
        &router,
        "POST",
        "/workflows/travel-agent-workflow/runs",
        Some(json!({"vacationDescription": "a week in Portugal"})),
    )
    .await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &router,
        "POST",
        &format!("/runs/{run_id}/resume"),
        Some(json!({"selection": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "suspended");
    assert_eq!(body["payload"]["suggestions"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_fail_run_cancels_suspended_run() {
    let (app, _) = scripted_app(vec![japan_suggestions()]);
    let router = router(app);

    let (_, body) = call(
        &router,
        "POST",
        "/workflows/travel-agent-workflow/runs",
        Some(json!({"vacationDescription": "5 days in Japan"})),
    )
    .await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let (status, run) = call(
        &router,
        "POST",
        &format!("/runs/{run_id}/fail"),
        Some(json!({"reason": "traveller never answered"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "failed");
    assert_eq!(run["error"], "traveller never answered");
}

#[tokio::test]
async fn test_model_failure_fails_run_with_step_id() {
    // nothing scripted: the first model call errors
    let (app, _) = scripted_app(vec![]);
    let router = router(app);

    let (status, body) = call(
        &router,
        "POST",
        "/workflows/travel-agent-workflow/runs",
        Some(json!({"vacationDescription": "5 days in Japan"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["step_id"], "generate-suggestions");
}

#[tokio::test]
async fn test_not_found_statuses() {
    let (app, _) = scripted_app(vec![]);
    let router = router(app);

    let (status, body) = call(&router, "POST", "/workflows/nope/runs", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "workflow_not_found");

    let (status, _) = call(&router, "GET", &format!("/runs/{}", uuid::Uuid::new_v4()), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        &router,
        "POST",
        "/agents/nobody/generate",
        Some(json!({"messages": [{"role": "user", "content": {"kind": "text", "value": "hi"}}]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "agent_not_found");
}

#[tokio::test]
async fn test_invalid_workflow_input_is_unprocessable() {
    let (app, _) = scripted_app(vec![]);
    let router = router(app);

    let (status, body) = call(
        &router,
        "POST",
        "/workflows/travel-agent-workflow/runs",
        Some(json!({"vacationDescription": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "input_schema_violation");
}

// ===========================================================================
// Memory endpoints
// ===========================================================================
#[tokio::test]
async fn test_working_memory_get_and_patch() {
    let (app, _) = scripted_app(vec![]);
    let router = router(app);

    let (status, doc) = call(&router, "GET", "/memory/alice/working", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["content"].as_str().unwrap().contains("# USER PROFILE"));

    let (status, doc) = call(
        &router,
        "PATCH",
        "/memory/alice/working",
        Some(json!({"likes": "street food", "dislikes": "pizza"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let content = doc["content"].as_str().unwrap();
    assert!(content.contains("- likes: street food"));
    assert!(content.contains("- dislikes: pizza"));

    let (status, body) = call(&router, "PATCH", "/memory/alice/working", Some(json!("wipe"))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "working_memory_policy");
}

#[tokio::test]
async fn test_context_endpoint_returns_recent_messages() {
    let (app, _) = scripted_app(vec![]);
    let router = router(app);

    for text in ["hello", "I am planning a trip"] {
        let (status, _) = call(
            &router,
            "POST",
            "/memory/context",
            Some(json!({"resource_id": "alice", "thread_id": "t1", "message": text})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, bundle) = call(
        &router,
        "POST",
        "/memory/context",
        Some(json!({"resource_id": "alice", "thread_id": "t1", "message": "to Japan"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let recent = bundle["recent_messages"].as_array().unwrap();
    assert_eq!(recent.len(), 3);
    assert!(bundle["working_memory"].is_object());

    let (status, _) = call(
        &router,
        "POST",
        "/memory/context",
        Some(json!({"resource_id": "alice", "thread_id": "t1", "message": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ===========================================================================
// Agents
// ===========================================================================
#[tokio::test]
async fn test_agent_tool_call_updates_working_memory() {
    let (app, _) = scripted_app(vec![
        ModelResponse::tool_call("updateWorkingMemory", json!({"memory": {"likes": "onsen"}})),
        ModelResponse::text("Noted, you like onsen."),
    ]);
    let router = router(app);

    let (status, body) = call(
        &router,
        "POST",
        "/agents/travelAgent/generate",
        Some(json!({
            "messages": [{"role": "user", "content": {"kind": "text", "value": "I like onsen"}}],
            "resource_id": "kai",
            "thread_id": "chat-1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "generate failed: {body}");
    assert_eq!(body["text"], "Noted, you like onsen.");

    let (_, doc) = call(&router, "GET", "/memory/kai/working", None).await;
    assert!(doc["content"].as_str().unwrap().contains("- likes: onsen"));
}

#[tokio::test]
async fn test_generate_rejects_empty_messages() {
    let (app, _) = scripted_app(vec![]);
    let router = router(app);
    let (status, _) = call(
        &router,
        "POST",
        "/agents/memoryAgent/generate",
        Some(json!({"messages": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ===========================================================================
// Financial agent: own memory profile, configured HTTP tools
// ===========================================================================
#[tokio::test]
async fn test_financial_agent_skips_recall_and_working_memory() {
    let (app, model) = scripted_app(vec![
        ModelResponse::text("You spent $42 on coffee this month."),
        ModelResponse::text("Coffee Spending"),
    ]);
    app.memory
        .update_working_memory("kai", &json!({"likes": "onsen"}))
        .await
        .unwrap();
    app.memory
        .save_message("kai", "older-chat", NewMessage::user("coffee budget was tight last month"))
        .await
        .unwrap();

    let financial = app.agent("financialAgent").unwrap();
    let memory = financial.memory().unwrap();
    assert!(memory.working_memory().is_none());
    assert!(!memory.config().semantic_recall.enabled);

    let router = router(app.clone());
    let (status, body) = call(
        &router,
        "POST",
        "/agents/financialAgent/generate",
        Some(json!({
            "messages": [{"role": "user", "content": {"kind": "text", "value": "How much did I spend on coffee?"}}],
            "resource_id": "kai",
            "thread_id": "fin-1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "generate failed: {body}");

    let requests = model.requests().await;
    let prompt: Vec<String> = requests[0].messages.iter().map(|m| m.content.as_text()).collect();
    assert!(prompt.iter().all(|m| !m.contains("onsen")), "{prompt:?}");
    assert!(prompt.iter().all(|m| !m.contains("last month")), "{prompt:?}");
    assert!(requests[0].tools.is_empty());

    let thread = app.memory.store().get_thread("fin-1").await.unwrap().unwrap();
    assert_eq!(thread.title.as_deref(), Some("Coffee Spending"));
}

#[tokio::test]
async fn test_financial_agent_calls_configured_transactions_tool() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/transactions"))
        .and(body_json(json!({"month": "2026-09"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "transactions": [{"vendor": "Corner Cafe", "amount": 4.5}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = WaypointConfig::from_toml_str(&format!(
        r#"
        [[agents.financialAgent.tools]]
        name = "getTransactions"
        description = "Fetch the user's transactions for a month"
        url = "{}/transactions"
        "#,
        server.uri()
    ))
    .unwrap();
    let model = Arc::new(ScriptedModel::new([
        ModelResponse::tool_call("getTransactions", json!({"month": "2026-09"})),
        ModelResponse::text("You spent $4.50 at Corner Cafe."),
        ModelResponse::text("September Spending"),
    ]));
    let app = App::assemble(config, None, model.clone()).unwrap();
    assert!(app.agent("travelAgent").is_ok());

    let result = app
        .agent("financialAgent")
        .unwrap()
        .generate(
            vec![NewMessage::user("What did I spend in September?")],
            GenerateOptions::default().with_memory("kai", "fin-2"),
        )
        .await
        .unwrap();
    assert_eq!(result.text, "You spent $4.50 at Corner Cafe.");

    let requests = model.requests().await;
    let tool_names: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(tool_names, vec!["getTransactions"]);
    let fed_back = requests[1].messages.last().unwrap().content.as_text();
    assert!(fed_back.contains("Corner Cafe"), "{fed_back}");
}

// ===========================================================================
// Health / version
// ===========================================================================
#[tokio::test]
async fn test_health_reports_memory_storage() {
    let (app, _) = scripted_app(vec![]);
    let (status, body) = health_inner(&app).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["storage"], "memory");
    assert_eq!(body["socket"], "/tmp/waypoint.sock");
}

#[tokio::test]
async fn test_version_endpoint() {
    let (app, _) = scripted_app(vec![]);
    let router = router(app);
    let (status, body) = call(&router, "GET", "/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, version_inner());
}
