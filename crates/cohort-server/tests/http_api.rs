//! End-to-end exercises of the HTTP surface against a temp-dir store.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Duration;
use serde_json::{json, Value};
use tower::ServiceExt;

use cohort_server::auth::SessionAuth;
use cohort_server::{router, AppState};
use cohort_study::store::StudyStore;

fn app(root: &std::path::Path) -> Router {
    let mut users = BTreeMap::new();
    let _ = users.insert("alice".to_string(), "hunter2".to_string());
    let state = AppState {
        store: StudyStore::open(root).unwrap(),
        auth: SessionAuth::new(users, Some(5), Duration::minutes(10)),
        assets_dir: None,
    };
    router(Arc::new(state))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn json_request(method: &str, uri: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("x-session-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn form_request(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn login(app: &Router) -> String {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/admin/login",
            None,
            json!({ "user": "alice", "password": "hunter2" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["key"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn participant_flow_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());
    let key = login(&app).await;

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/admin/studies",
            Some(&key),
            json!({ "id": "stroop" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/admin/studies/stroop/run",
            Some(&key),
            json!({ "accessType": "anyone", "saveIncompleteData": false }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runId"], json!(1));

    let (status, body) = send(
        &app,
        form_request("/study/stroop/server", "command=open_session"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();
    assert_eq!(token, "1");

    let (status, _) = send(
        &app,
        form_request(
            "/study/stroop/server",
            &format!("command=save_data&token={token}&key=results.csv&value=a,b,c&saveFormat=csv"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app,
        form_request(
            "/study/stroop/server",
            &format!("command=close_session&token={token}&isCompleted=true"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Completed session's data landed on disk under the run directory.
    let saved = dir
        .path()
        .join("studies")
        .join("stroop")
        .join("runs")
        .join("1")
        .join("results.csv");
    assert_eq!(std::fs::read_to_string(saved).unwrap(), "a,b,c");
}

#[tokio::test]
async fn admin_routes_reject_missing_and_bogus_keys() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());

    let (status, _) = send(
        &app,
        json_request("POST", "/admin/studies", None, json!({ "id": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        json_request("POST", "/admin/studies", Some("not-a-key"), json!({ "id": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/admin/login",
            None,
            json!({ "user": "alice", "password": "wrong" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn unknown_command_and_invite_only_run_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());
    let key = login(&app).await;

    let (status, _) = send(
        &app,
        json_request("POST", "/admin/studies", Some(&key), json!({ "id": "maze" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/admin/studies/maze/run",
            Some(&key),
            json!({ "accessType": "invite-only" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Anonymous open_session is not allowed on an invite-only run.
    let (status, _) = send(
        &app,
        form_request("/study/maze/server", "command=open_session"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, form_request("/study/maze/server", "command=dance")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("dance"));
}

#[tokio::test]
async fn join_flow_issues_and_reattaches_invite_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());
    let key = login(&app).await;

    let (_, _) = send(
        &app,
        json_request("POST", "/admin/studies", Some(&key), json!({ "id": "rt" })),
    )
    .await;
    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/admin/studies/rt/run",
            Some(&key),
            json!({ "accessType": "invite-only" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/admin/studies/rt/invites",
            Some(&key),
            json!({ "uniqueSession": true }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let code = body["code"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        Request::builder()
            .uri(format!("/join/{code}?key=participant-7"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["study"], json!("rt"));
    assert_eq!(body["reattached"], json!(false));
    let token = body["token"].as_str().unwrap().to_string();

    // The same caller key gets the same live session back.
    let (status, body) = send(
        &app,
        Request::builder()
            .uri(format!("/join/{code}?key=participant-7"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reattached"], json!(true));
    assert_eq!(body["token"].as_str().unwrap(), token);

    let (status, _) = send(
        &app,
        Request::builder()
            .uri("/join/no-such-code?key=p")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
