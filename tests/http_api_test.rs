use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use taskmesh::adapters::http::build_app;
use taskmesh::{Config, Scheduler};
use tower::ServiceExt;

async fn app() -> Router {
    let scheduler = Scheduler::in_memory(Config::default())
        .await
        .expect("failed to build scheduler");
    build_app(Arc::new(scheduler), false)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        // Extractor rejections come back as plain text
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

async fn create_ticket(app: &Router) -> String {
    let (status, body) = send(app, Method::POST, "/tickets", Some(json!({ "title": "api", "priority": "high" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

async fn create_task(app: &Router, ticket_id: &str, description: &str, depends_on: &[&str]) -> (StatusCode, Value) {
    send(
        app,
        Method::POST,
        "/tasks",
        Some(json!({
            "ticket_id": ticket_id,
            "description": description,
            "depends_on": depends_on,
        })),
    )
    .await
}

#[tokio::test]
async fn test_health() {
    let app = app().await;
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_task_lifecycle_over_http() {
    let app = app().await;
    let ticket_id = create_ticket(&app).await;

    let (status, first) = create_task(&app, &ticket_id, "fetch sources", &[]).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["status"], "ready");
    let first_id = first["task_id"].as_str().unwrap().to_string();

    let (_, second) = create_task(&app, &ticket_id, "compile", &[&first_id]).await;
    assert_eq!(second["status"], "blocked");
    let second_id = second["task_id"].as_str().unwrap().to_string();

    let (status, agent) = send(&app, Method::POST, "/agents", Some(json!({ "agent_id": "w1" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(agent["id"], "w1");

    let (status, claim) = send(&app, Method::POST, "/tasks/claim", Some(json!({ "agent_id": "w1" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claim["task_id"], first_id.as_str());
    assert_eq!(claim["attempt_number"], 1);

    let (status, heartbeat) = send(&app, Method::POST, "/agents/w1/heartbeat", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(heartbeat["cancel_requested"], false);

    let (status, report) = send(&app, Method::POST, &format!("/tasks/{first_id}/complete"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["unblocked"], json!([second_id]));

    let (status, claim) = send(&app, Method::POST, "/tasks/claim", Some(json!({ "agent_id": "w1" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claim["task_id"], second_id.as_str());

    let (status, _) = send(&app, Method::POST, "/tasks/claim", Some(json!({ "agent_id": "w1" }))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_complete_accepts_artifact_ref() {
    let app = app().await;
    let ticket_id = create_ticket(&app).await;
    let (_, task) = create_task(&app, &ticket_id, "produce branch", &[]).await;
    let task_id = task["task_id"].as_str().unwrap().to_string();
    send(&app, Method::POST, "/agents", Some(json!({ "agent_id": "w1" }))).await;
    send(&app, Method::POST, "/tasks/claim", Some(json!({ "agent_id": "w1" }))).await;

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/tasks/{task_id}/complete"),
        Some(json!({ "artefact": { "base_ref": "main", "produced_ref": "feature" } })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, report) = send(
        &app,
        Method::POST,
        &format!("/tasks/{task_id}/complete"),
        Some(json!({ "artifact_ref": { "base_ref": "main", "produced_ref": "feature" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["merge_unit"]["base_ref"], "main");
    assert_eq!(report["merge_unit"]["produced_ref"], "feature");
}

#[tokio::test]
async fn test_cancel_of_held_task_reaches_heartbeat() {
    let app = app().await;
    let ticket_id = create_ticket(&app).await;
    let (_, task) = create_task(&app, &ticket_id, "long job", &[]).await;
    let task_id = task["task_id"].as_str().unwrap().to_string();
    send(&app, Method::POST, "/agents", Some(json!({ "agent_id": "w1" }))).await;
    send(&app, Method::POST, "/tasks/claim", Some(json!({ "agent_id": "w1" }))).await;

    let (status, cancel) = send(&app, Method::POST, &format!("/tasks/{task_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancel["outcome"], "requested");

    let (_, heartbeat) = send(&app, Method::POST, "/agents/w1/heartbeat", None).await;
    assert_eq!(heartbeat["cancel_requested"], true);
    assert_eq!(heartbeat["cancel_task_ids"], json!([task_id]));
}

#[tokio::test]
async fn test_cycle_is_conflict() {
    let app = app().await;
    let ticket_id = create_ticket(&app).await;
    let (_, t1) = create_task(&app, &ticket_id, "one", &[]).await;
    let (_, t2) = create_task(&app, &ticket_id, "two", &[]).await;
    let (t1, t2) = (t1["task_id"].as_str().unwrap(), t2["task_id"].as_str().unwrap());

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/tasks/{t2}/dependencies"),
        Some(json!({ "blocker_id": t1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/tasks/{t1}/dependencies"),
        Some(json!({ "blocker_id": t2 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CYCLE_DETECTED");

    let (_, blocked) = send(&app, Method::GET, "/state/blocked", None).await;
    assert_eq!(blocked.as_array().unwrap().len(), 1);
    assert_eq!(blocked[0]["task_id"], t2);
}

#[tokio::test]
async fn test_unknown_agent_and_task_are_not_found() {
    let app = app().await;

    let (status, body) = send(&app, Method::POST, "/tasks/claim", Some(json!({ "agent_id": "ghost" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "UNKNOWN_AGENT");

    let (status, _) = send(&app, Method::POST, "/agents/ghost/heartbeat", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::GET,
        "/tasks/67e55044-10b1-426f-9247-bb680e5fe0c8",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "TASK_NOT_FOUND");
}

#[tokio::test]
async fn test_unknown_dependency_is_bad_request() {
    let app = app().await;
    let ticket_id = create_ticket(&app).await;
    let (status, body) = create_task(&app, &ticket_id, "orphan", &["67e55044-10b1-426f-9247-bb680e5fe0c8"]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "UNKNOWN_DEPENDENCY");
}

#[tokio::test]
async fn test_state_endpoints_respond() {
    let app = app().await;
    for uri in ["/state/queue", "/state/agents", "/state/merges", "/state/circuits"] {
        let (status, _) = send(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
    }
}
