//! Job lookup endpoints: status polling, preview, download and housekeeping.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use file2ai_core::error::JobError;
use file2ai_core::job::{JobId, JobSnapshot, StatusReport};
use file2ai_core::package::Preview;
use tracing::{debug, error, info};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

async fn lookup(state: &AppState, id: JobId) -> AppResult<JobSnapshot> {
    state
        .registry
        .snapshot(id)
        .await
        .ok_or(AppError::Job(JobError::NotFound(id)))
}

/// GET /status/{job_id}
async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<StatusReport>> {
    let report = state.registry.status(job_id).await?;
    debug!(%job_id, status = %report.status, progress = report.progress, "Status polled");
    Ok(Json(report))
}

/// GET /api/jobs
async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSnapshot>> {
    Json(state.registry.list().await)
}

/// GET /api/jobs/{job_id}
async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<JobSnapshot>> {
    Ok(Json(lookup(&state, job_id).await?))
}

/// DELETE /api/jobs/{job_id}
async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<StatusCode> {
    state.registry.remove(job_id).await?;
    info!(%job_id, "Job removed");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /preview/{job_id}
async fn preview(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Json<Preview>> {
    state
        .registry
        .preview(job_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no preview available for job {job_id}")))
}

/// GET /download/{job_id}
async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> AppResult<Response> {
    let Some(handle) = state.registry.download(job_id).await? else {
        return Err(AppError::NotFound(format!(
            "no output available for job {job_id}"
        )));
    };

    let bytes = match tokio::fs::read(&handle.path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!(
                "output of job {job_id} is no longer available"
            )))
        }
        Err(e) => {
            error!(%job_id, error = %e, path = %handle.path.display(), "Failed to read job output");
            return Err(AppError::Internal(e.to_string()));
        }
    };
    info!(%job_id, file = %handle.file_name, bytes = bytes.len(), "Serving download");

    let disposition = format!(
        "attachment; filename=\"{}\"",
        handle.file_name.replace(['"', '\\'], "_")
    );
    Ok((
        [
            (header::CONTENT_TYPE, handle.content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from(bytes),
    )
        .into_response())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status/{job_id}", get(status))
        .route("/preview/{job_id}", get(preview))
        .route("/download/{job_id}", get(download))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{job_id}", get(get_job).delete(delete_job))
}
