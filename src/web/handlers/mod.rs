use axum::Router;
use std::sync::Arc;
use crate::AppContext;

pub mod schedule;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .nest("/schedule", schedule::schedule_router(ctx.task_manager.clone()))
}
