use axum::{
    routing::{post, get},
    Router,
    extract::{State, Path, Json, Query},
    response::IntoResponse,
    http::StatusCode,
};
use std::sync::Arc;
use serde::{Deserialize, Serialize};

use crate::schedule::types::{NewTask, ScheduleError, TaskArgs, TaskId, TaskStatus};
use crate::schedule::scheduler::TaskManager;
use tracing::error;

pub fn schedule_router(task_manager: Arc<TaskManager>) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/stats", get(get_task_stats))
        .route("/tasks/:task_id", get(get_task).delete(delete_task))
        .route("/tasks/:task_id/active", post(set_task_active))
        .with_state(task_manager)
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

// 输入错误返回 400，其余按服务端错误处理
fn failure<T: Serialize>(action: &str, e: anyhow::Error) -> Reply<T> {
    if e.downcast_ref::<ScheduleError>().is_some() {
        return (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e.to_string())));
    }
    error!("Failed to {}: {}", action, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error(e.to_string())),
    )
}

fn not_found<T: Serialize>() -> Reply<T> {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error("Task not found".to_string())),
    )
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    name: String,
    run_at: String,
    interval: Option<String>,
    #[serde(default)]
    args: TaskArgs,
}

#[derive(Debug, Serialize)]
struct CreatedTask {
    id: TaskId,
}

// Create task endpoint
async fn create_task(
    State(task_manager): State<Arc<TaskManager>>,
    Json(req): Json<CreateTaskRequest>,
) -> impl IntoResponse {
    let task = match NewTask::parse(req.name, &req.run_at, req.interval.as_deref(), req.args) {
        Ok(task) => task,
        Err(e) => return failure::<CreatedTask>("parse task", e.into()),
    };

    match task_manager.add_task(task).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(ApiResponse::success(CreatedTask { id }))
        ),
        Err(e) => failure("create task", e),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<TaskStatus>,
}

// List tasks endpoint, optionally filtered by status
async fn list_tasks(
    State(task_manager): State<Arc<TaskManager>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let tasks = match query.status {
        Some(status) => task_manager.tasks_by_status(status).await,
        None => task_manager.list_tasks().await,
    };
    match tasks {
        Ok(tasks) => (StatusCode::OK, Json(ApiResponse::success(tasks))),
        Err(e) => failure("list tasks", e),
    }
}

// Get task endpoint
async fn get_task(
    State(task_manager): State<Arc<TaskManager>>,
    Path(task_id): Path<TaskId>,
) -> impl IntoResponse {
    match task_manager.get_task(task_id).await {
        Ok(Some(task)) => (
            StatusCode::OK,
            Json(ApiResponse::success(task))
        ),
        Ok(None) => not_found(),
        Err(e) => failure("get task", e),
    }
}

// Delete task endpoint
async fn delete_task(
    State(task_manager): State<Arc<TaskManager>>,
    Path(task_id): Path<TaskId>,
) -> impl IntoResponse {
    match task_manager.delete_task(task_id).await {
        Ok(true) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Ok(false) => not_found(),
        Err(e) => failure("delete task", e),
    }
}

#[derive(Debug, Deserialize)]
struct SetActiveRequest {
    active: bool,
}

// Pause / resume endpoint
async fn set_task_active(
    State(task_manager): State<Arc<TaskManager>>,
    Path(task_id): Path<TaskId>,
    Json(req): Json<SetActiveRequest>,
) -> impl IntoResponse {
    match task_manager.activate_task(task_id, req.active).await {
        Ok(true) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(format!(
                "Task {} is missing or already finished",
                task_id
            ))),
        ),
        Err(e) => failure("change task activation", e),
    }
}

// Get task stats endpoint
async fn get_task_stats(State(task_manager): State<Arc<TaskManager>>) -> impl IntoResponse {
    match task_manager.task_stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(ApiResponse::success(stats)),
        ),
        Err(e) => failure("get task stats", e),
    }
}
