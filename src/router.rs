//! Application router shared by the `serve` command and the HTTP tests.

use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, StatusCode};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::routes;
use crate::state::AppState;

/// Builds the full [`Router`] with its middleware stack, applied bottom-up:
///
/// 1. Set request ID on incoming requests
/// 2. Request/response tracing
/// 3. Propagate request ID to the response
/// 4. Request timeout
/// 5. Panic recovery
/// 6. Body size limit for uploads
pub fn build_app_router(state: AppState) -> Router {
    let server = &state.config.server;
    let request_id_header = HeaderName::from_static("x-request-id");
    let body_limit = server.max_upload_mb.saturating_mul(1024 * 1024);
    let timeout = Duration::from_secs(server.request_timeout_secs);

    Router::new()
        .merge(routes::health::router())
        .merge(routes::api_routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(state)
}
