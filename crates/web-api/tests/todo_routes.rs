mod support;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use support::{test_app, TestApp};

async fn send(
    app: &TestApp,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_is_public() {
    let app = test_app();
    let (status, _) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn todo_routes_require_a_token() {
    let app = test_app();
    let uri = format!("/api/v1/workspaces/{}/todos", app.workspace);
    let (status, body) = send(&app, "GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = send(&app, "GET", &uri, Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn non_members_are_forbidden() {
    let app = test_app();
    let token = app.token(app.outsider);
    let uri = format!("/api/v1/workspaces/{}/todos", app.workspace);

    let (status, body) = send(&app, "POST", &uri, Some(&token), Some(json!({"title": "sneak"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[tokio::test]
async fn member_creates_lists_and_reads_todos() {
    let app = test_app();
    let token = app.token(app.member);
    let uri = format!("/api/v1/workspaces/{}/todos", app.workspace);

    let (status, created) =
        send(&app, "POST", &uri, Some(&token), Some(json!({"title": "write docs"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["title"], "write docs");
    assert_eq!(created["completed"], false);
    assert_eq!(created["workspace_id"], app.workspace.to_string());

    let (status, listed) = send(&app, "GET", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let todo_uri = format!("/api/v1/todos/{}", created["id"].as_str().unwrap());
    let (status, fetched) = send(&app, "GET", &todo_uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], created["id"]);

    // 其他工作区的成员不能读取
    let neighbour = app.token(app.neighbour);
    let (status, _) = send(&app, "GET", &todo_uri, Some(&neighbour), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn invalid_title_is_a_validation_error() {
    let app = test_app();
    let token = app.token(app.member);
    let uri = format!("/api/v1/workspaces/{}/todos", app.workspace);

    let (status, body) = send(&app, "POST", &uri, Some(&token), Some(json!({"title": "   "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(app.outbox.records().is_empty());
}

#[tokio::test]
async fn unknown_todo_is_not_found() {
    let app = test_app();
    let token = app.token(app.member);
    let uri = format!("/api/v1/todos/{}", Uuid::new_v4());

    let (status, body) = send(&app, "GET", &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn mutations_advance_the_workspace_revision() {
    let app = test_app();
    let token = app.token(app.member);
    let revision_uri = format!("/api/v1/workspaces/{}/revision", app.workspace);

    let (_, before) = send(&app, "GET", &revision_uri, Some(&token), None).await;
    let before = before["revision"].as_i64().unwrap();

    let (_, created) = send(
        &app,
        "POST",
        &format!("/api/v1/workspaces/{}/todos", app.workspace),
        Some(&token),
        Some(json!({"title": "ship"})),
    )
    .await;
    let todo_uri = format!("/api/v1/todos/{}", created["id"].as_str().unwrap());

    let (status, completed) =
        send(&app, "POST", &format!("{todo_uri}/complete"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(completed["completed"], true);

    let (status, renamed) = send(
        &app,
        "PATCH",
        &todo_uri,
        Some(&token),
        Some(json!({"title": "ship it"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["title"], "ship it");

    let (status, reopened) =
        send(&app, "POST", &format!("{todo_uri}/reopen"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reopened["completed"], false);

    let (_, after) = send(&app, "GET", &revision_uri, Some(&token), None).await;
    assert!(after["revision"].as_i64().unwrap() > before);
}

#[tokio::test]
async fn deleted_todo_disappears() {
    let app = test_app();
    let token = app.token(app.member);
    let (_, created) = send(
        &app,
        "POST",
        &format!("/api/v1/workspaces/{}/todos", app.workspace),
        Some(&token),
        Some(json!({"title": "temporary"})),
    )
    .await;
    let todo_uri = format!("/api/v1/todos/{}", created["id"].as_str().unwrap());

    let (status, _) = send(&app, "DELETE", &todo_uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "GET", &todo_uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
