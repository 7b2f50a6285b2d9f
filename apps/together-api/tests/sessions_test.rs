mod common;

use axum::http::StatusCode;
use axum_test::TestServer;

// ---------------------------------------------------------------------------
// POST /api/v1/sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_session_returns_join_url() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server
        .post("/api/v1/sessions")
        .json(&serde_json::json!({
            "name": "Design review",
            "baseLocation": "https://example.com/app",
            "creator": "ann"
        }))
        .await;

    resp.assert_status(StatusCode::CREATED);
    let body: serde_json::Value = resp.json();

    let id = body["id"].as_str().unwrap();
    assert!(id.starts_with("ses_"));
    assert_eq!(body["name"], "Design review");
    assert_eq!(body["baseUrl"], "https://example.com/app");
    assert_eq!(body["creatorIdentifier"], "ann");
    assert_eq!(body["joinUrl"], format!("ws://test.local/ws/{id}/cursors"));
}

#[tokio::test]
async fn create_session_requires_name() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server
        .post("/api/v1/sessions")
        .json(&serde_json::json!({ "name": "  ", "baseLocation": "https://example.com" }))
        .await;

    resp.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(body["error"]["details"][0]["field"], "name");
}

// ---------------------------------------------------------------------------
// GET /api/v1/sessions, GET /api/v1/sessions/{id}
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_sessions_returns_every_created_session() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    for name in ["first", "second"] {
        server
            .post("/api/v1/sessions")
            .json(&serde_json::json!({ "name": name }))
            .await
            .assert_status(StatusCode::CREATED);
    }

    let resp = server.get("/api/v1/sessions").await;
    resp.assert_status_ok();
    let body: Vec<serde_json::Value> = resp.json();
    let mut names: Vec<&str> = body.iter().map(|s| s["name"].as_str().unwrap()).collect();
    names.sort_unstable();
    assert_eq!(names, ["first", "second"]);
}

#[tokio::test]
async fn get_session_by_id() {
    let (app, state) = common::test_app();
    let server = TestServer::new(app).unwrap();
    let id = common::create_session(&state, "lookup").await;

    let resp = server.get(&format!("/api/v1/sessions/{id}")).await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["name"], "lookup");
}

#[tokio::test]
async fn get_unknown_session_returns_404() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server.get("/api/v1/sessions/ses_missing").await;
    resp.assert_status(StatusCode::NOT_FOUND);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/sessions/{id}
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_session_removes_it() {
    let (app, state) = common::test_app();
    let server = TestServer::new(app).unwrap();
    let id = common::create_session(&state, "short-lived").await;

    server
        .delete(&format!("/api/v1/sessions/{id}"))
        .await
        .assert_status(StatusCode::NO_CONTENT);

    server
        .get(&format!("/api/v1/sessions/{id}"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    assert!(!state.registry.contains(&id));
}

#[tokio::test]
async fn delete_unknown_session_returns_404() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    server
        .delete("/api/v1/sessions/ses_missing")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_backend() {
    let (app, _state) = common::test_app();
    let server = TestServer::new(app).unwrap();

    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "local");
    assert_eq!(body["liveSessions"], 0);
}
