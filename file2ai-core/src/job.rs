//! Job state machine and the shared handle the worker writes through.
//!
//! ```text
//! Idle -> Processing -> Completed | CompletedWithErrors | Failed
//! ```
//!
//! Terminal states are sticky. Progress only grows and is held below 100
//! until the terminal transition sets it to exactly 100. Errors are
//! append-only.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{Artifact, TargetFormat};
use crate::error::JobError;
use crate::export::ExportStats;
use crate::package::{DownloadHandle, Preview};

pub type JobId = Uuid;

/// Highest progress a job reports before it is terminal.
pub const IN_FLIGHT_PROGRESS_CAP: f64 = 99.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Idle, JobStatus::Processing)
                | (
                    JobStatus::Processing,
                    JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
                )
        )
    }

    /// Terminal status for a finished dispatch loop.
    pub fn from_counts(succeeded: usize, failed: usize) -> JobStatus {
        match (succeeded, failed) {
            (0, _) => JobStatus::Failed,
            (_, 0) => JobStatus::Completed,
            _ => JobStatus::CompletedWithErrors,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Idle => "idle",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Convert,
    Export,
}

/// Point-in-time copy of a job, safe to hand to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub format: TargetFormat,
    pub status: JobStatus,
    pub progress: f64,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Vec<Artifact>,
    pub download: Option<DownloadHandle>,
    pub preview: Option<Preview>,
    pub stats: Option<ExportStats>,
}

/// The polling view of a job: where it is and what went wrong so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: JobStatus,
    pub progress: f64,
    pub errors: Vec<String>,
}

impl From<JobSnapshot> for StatusReport {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            status: snapshot.status,
            progress: snapshot.progress,
            errors: snapshot.errors,
        }
    }
}

/// What the worker hands over when the dispatch loop is done.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub succeeded: usize,
    pub failed: usize,
    pub artifacts: Vec<Artifact>,
    pub download: Option<DownloadHandle>,
    pub preview: Option<Preview>,
    pub stats: Option<ExportStats>,
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    progress: f64,
    errors: Vec<String>,
    finished_at: Option<DateTime<Utc>>,
    result: Vec<Artifact>,
    download: Option<DownloadHandle>,
    preview: Option<Preview>,
    stats: Option<ExportStats>,
}

/// Cloneable handle to one job's state.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    kind: JobKind,
    format: TargetFormat,
    created_at: DateTime<Utc>,
    state: Arc<RwLock<JobState>>,
}

impl JobHandle {
    pub fn new(kind: JobKind, format: TargetFormat) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            format,
            created_at: Utc::now(),
            state: Arc::new(RwLock::new(JobState {
                status: JobStatus::Idle,
                progress: 0.0,
                errors: Vec::new(),
                finished_at: None,
                result: Vec::new(),
                download: None,
                preview: None,
                stats: None,
            })),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub async fn status(&self) -> JobStatus {
        self.state.read().await.status
    }

    pub async fn snapshot(&self) -> JobSnapshot {
        let state = self.state.read().await;
        JobSnapshot {
            id: self.id,
            kind: self.kind,
            format: self.format,
            status: state.status,
            progress: state.progress,
            errors: state.errors.clone(),
            created_at: self.created_at,
            finished_at: state.finished_at,
            result: state.result.clone(),
            download: state.download.clone(),
            preview: state.preview.clone(),
            stats: state.stats.clone(),
        }
    }

    /// `Idle -> Processing`.
    pub async fn begin(&self) -> Result<(), JobError> {
        let mut state = self.state.write().await;
        transition(&mut state, JobStatus::Processing)?;
        info!(job_id = %self.id, "Job processing");
        Ok(())
    }

    /// Records `completed` of `total` tasks done. Returns the published progress.
    pub async fn advance(&self, completed: usize, total: usize) -> Result<f64, JobError> {
        let mut state = self.state.write().await;
        if state.status != JobStatus::Processing {
            return Err(JobError::InvalidTransition {
                from: state.status,
                to: JobStatus::Processing,
            });
        }
        let raw = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64 * 100.0
        };
        state.progress = state.progress.max(raw.min(IN_FLIGHT_PROGRESS_CAP));
        debug!(job_id = %self.id, completed, total, progress = state.progress, "Job progress");
        Ok(state.progress)
    }

    /// Appends a per-file error. Only valid while processing.
    pub async fn record_error(&self, message: impl Into<String>) -> Result<(), JobError> {
        let mut state = self.state.write().await;
        if state.status != JobStatus::Processing {
            return Err(JobError::InvalidTransition {
                from: state.status,
                to: JobStatus::Processing,
            });
        }
        let message = message.into();
        warn!(job_id = %self.id, error = %message, "File failed");
        state.errors.push(message);
        Ok(())
    }

    /// Moves to the terminal status implied by the counts.
    pub async fn finish(&self, completion: Completion) -> Result<JobStatus, JobError> {
        let status = JobStatus::from_counts(completion.succeeded, completion.failed);
        let mut state = self.state.write().await;
        transition(&mut state, status)?;
        if status == JobStatus::Failed && state.errors.is_empty() {
            state.errors.push("no files were converted".to_string());
        }
        state.result = completion.artifacts;
        state.download = completion.download;
        state.preview = completion.preview;
        state.stats = completion.stats;
        info!(
            job_id = %self.id,
            %status,
            succeeded = completion.succeeded,
            failed = completion.failed,
            "Job finished"
        );
        Ok(status)
    }

    /// Aborts the job with a whole-job error.
    pub async fn fail(&self, message: impl Into<String>) -> Result<(), JobError> {
        let mut state = self.state.write().await;
        transition(&mut state, JobStatus::Failed)?;
        let message = message.into();
        warn!(job_id = %self.id, error = %message, "Job failed");
        state.errors.push(message);
        Ok(())
    }
}

fn transition(state: &mut JobState, next: JobStatus) -> Result<(), JobError> {
    if !state.status.can_transition_to(next) {
        return Err(JobError::InvalidTransition {
            from: state.status,
            to: next,
        });
    }
    state.status = next;
    if next.is_terminal() {
        state.progress = 100.0;
        state.finished_at = Some(Utc::now());
    }
    Ok(())
}
