use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use application::HubError;
use domain::{Todo, TodoId, UserId, WorkspaceId};

use crate::auth::AuthenticatedUser;
use crate::ws_connection::WebSocketConnection;
use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
struct CreateTodoPayload {
    title: String,
}

#[derive(Debug, Deserialize)]
struct RenameTodoPayload {
    title: String,
}

#[derive(Debug, Serialize)]
struct RevisionResponse {
    workspace_id: WorkspaceId,
    revision: i64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(websocket_upgrade))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/workspaces/{workspace_id}/todos",
            post(create_todo).get(list_todos),
        )
        .route("/workspaces/{workspace_id}/revision", get(workspace_revision))
        .route(
            "/todos/{todo_id}",
            get(get_todo).patch(rename_todo).delete(delete_todo),
        )
        .route("/todos/{todo_id}/complete", post(complete_todo))
        .route("/todos/{todo_id}/reopen", post(reopen_todo))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}

async fn authorized_rooms(state: &AppState, user_id: UserId) -> Result<Vec<String>, ApiError> {
    state
        .permissions
        .authorized_rooms(user_id)
        .await
        .map_err(|err| {
            tracing::error!(user_id = %user_id, error = %err, "查询授权房间失败");
            ApiError::internal()
        })
}

/// 用户必须是工作区成员
async fn ensure_member(
    state: &AppState,
    user_id: UserId,
    workspace_id: WorkspaceId,
) -> Result<(), ApiError> {
    let workspace = workspace_id.to_string();
    if authorized_rooms(state, user_id)
        .await?
        .iter()
        .any(|room| *room == workspace)
    {
        Ok(())
    } else {
        Err(ApiError::forbidden("not a member of this workspace"))
    }
}

/// 读取任务并校验其所属工作区
async fn load_todo(state: &AppState, user_id: UserId, todo_id: Uuid) -> Result<Todo, ApiError> {
    let todo = state.todos.get(TodoId::from(todo_id)).await?;
    ensure_member(state, user_id, todo.workspace_id).await?;
    Ok(todo)
}

async fn create_todo(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(workspace_id): Path<Uuid>,
    Json(payload): Json<CreateTodoPayload>,
) -> Result<(StatusCode, Json<Todo>), ApiError> {
    let workspace_id = WorkspaceId::from(workspace_id);
    ensure_member(&state, user_id, workspace_id).await?;

    let todo = state.todos.create(workspace_id, payload.title).await?;
    Ok((StatusCode::CREATED, Json(todo)))
}

async fn list_todos(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(workspace_id): Path<Uuid>,
) -> Result<Json<Vec<Todo>>, ApiError> {
    let workspace_id = WorkspaceId::from(workspace_id);
    ensure_member(&state, user_id, workspace_id).await?;

    Ok(Json(state.todos.list(workspace_id).await?))
}

async fn workspace_revision(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(workspace_id): Path<Uuid>,
) -> Result<Json<RevisionResponse>, ApiError> {
    let workspace_id = WorkspaceId::from(workspace_id);
    ensure_member(&state, user_id, workspace_id).await?;

    let revision = state.todos.revision(workspace_id).await?;
    Ok(Json(RevisionResponse {
        workspace_id,
        revision,
    }))
}

async fn get_todo(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(todo_id): Path<Uuid>,
) -> Result<Json<Todo>, ApiError> {
    Ok(Json(load_todo(&state, user_id, todo_id).await?))
}

async fn rename_todo(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(todo_id): Path<Uuid>,
    Json(payload): Json<RenameTodoPayload>,
) -> Result<Json<Todo>, ApiError> {
    let todo = load_todo(&state, user_id, todo_id).await?;
    Ok(Json(state.todos.rename(todo.id, payload.title).await?))
}

async fn complete_todo(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(todo_id): Path<Uuid>,
) -> Result<Json<Todo>, ApiError> {
    let todo = load_todo(&state, user_id, todo_id).await?;
    Ok(Json(state.todos.complete(todo.id).await?))
}

async fn reopen_todo(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(todo_id): Path<Uuid>,
) -> Result<Json<Todo>, ApiError> {
    let todo = load_todo(&state, user_id, todo_id).await?;
    Ok(Json(state.todos.reopen(todo.id).await?))
}

async fn delete_todo(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(todo_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let todo = load_todo(&state, user_id, todo_id).await?;
    state.todos.delete(todo.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 认证和房间解析都在升级前完成，失败时直接返回 HTTP 错误
async fn websocket_upgrade(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let rooms = authorized_rooms(&state, user_id).await?;
    let handle = state.hub.register(user_id, rooms).map_err(|err| match err {
        HubError::NoRooms => ApiError::forbidden("no authorized rooms"),
        HubError::ShuttingDown => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SHUTTING_DOWN",
            "server is shutting down",
        ),
        HubError::Permission(_) => ApiError::internal(),
    })?;

    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let connection = WebSocketConnection::new(socket, handle, hub.config().clone());
        if let Err(err) = hub.track(connection.run()).await {
            tracing::error!(error = %err, "WebSocket 连接任务异常退出");
        }
    }))
}
