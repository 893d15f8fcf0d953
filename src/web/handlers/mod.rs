use axum::Router;
use std::sync::Arc;
use crate::AppContext;

pub mod jobs;

pub fn router(ctx: Arc<AppContext>) -> Router {
    jobs::jobs_router(ctx)
}
