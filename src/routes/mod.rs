pub mod health;
pub mod jobs;
pub mod submit;

use axum::Router;

use crate::state::AppState;

/// Submission and job routes. Paths are absolute; nothing is nested.
pub fn api_routes() -> Router<AppState> {
    Router::new().merge(submit::router()).merge(jobs::router())
}
