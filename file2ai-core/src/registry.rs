//! Job registry: validates submissions, starts one worker task per job and
//! answers status, preview and download lookups.
//!
//! The registry is an explicit value owned by whoever serves requests (the
//! HTTP state or a CLI run). The id-to-job map sits behind its own lock;
//! each job's mutable state sits behind the lock inside its [`JobHandle`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::CoreConfig;
use crate::contract::{Converter, RepoFetcher};
use crate::error::{JobError, SubmitError};
use crate::job::{JobHandle, JobId, JobSnapshot, StatusReport};
use crate::package::{DownloadHandle, Preview};
use crate::pipeline::{Pipeline, INTERNAL_ERROR_MESSAGE};
use crate::repo_export;
use crate::source::SourceRequest;

pub use crate::pipeline::JobRequest;

struct JobEntry {
    handle: JobHandle,
    worker: Shared<BoxFuture<'static, ()>>,
}

pub struct JobRegistry {
    config: CoreConfig,
    pipeline: Pipeline,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobRegistry {
    pub fn new(
        config: CoreConfig,
        converter: Arc<dyn Converter>,
        fetcher: Arc<dyn RepoFetcher>,
    ) -> Self {
        Self {
            pipeline: Pipeline::new(config.clone(), converter, fetcher),
            config,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Validates `request`, registers a job and starts its worker.
    ///
    /// Returns as soon as the worker is spawned.
    pub async fn submit(&self, mut request: JobRequest) -> Result<JobId, SubmitError> {
        self.validate(&mut request)?;

        let handle = JobHandle::new(request.kind, request.format);
        let id = handle.id();
        let pipeline = self.pipeline.clone();
        let worker_handle = handle.clone();

        let task = tokio::spawn(
            async move {
                let run = AssertUnwindSafe(pipeline.run(worker_handle.clone(), request));
                if run.catch_unwind().await.is_err() {
                    error!("Job worker panicked");
                    if let Err(e) = worker_handle.fail(INTERNAL_ERROR_MESSAGE).await {
                        warn!(error = %e, "Could not mark panicked job as failed");
                    }
                }
            }
            .instrument(info_span!("job", job_id = %id)),
        );
        let worker = task.map(|_| ()).boxed().shared();

        self.jobs
            .write()
            .await
            .insert(id, JobEntry { handle, worker });
        info!(job_id = %id, "Job submitted");
        Ok(id)
    }

    fn validate(&self, request: &mut JobRequest) -> Result<(), SubmitError> {
        request.filter.compile()?;
        if request.filter.max_size_bytes.is_none() {
            request.filter.max_size_bytes = self
                .config
                .default_max_file_size_kb
                .map(|kb| kb.saturating_mul(1024));
        }

        match &request.source {
            SourceRequest::Upload(files) if files.is_empty() => {
                return Err(SubmitError::EmptyUpload)
            }
            SourceRequest::Upload(_) => {}
            SourceRequest::LocalDir { root, .. } => {
                if !root.is_dir() {
                    return Err(SubmitError::MissingDirectory(root.clone()));
                }
            }
            SourceRequest::Repository(spec) => {
                repo_export::resolve_spec(spec)?;
            }
        }

        if let Some(name) = &request.output_file {
            let trimmed = name.trim();
            if trimmed.is_empty()
                || trimmed == "."
                || trimmed == ".."
                || trimmed.contains(['/', '\\'])
            {
                return Err(SubmitError::InvalidOutputName(name.clone()));
            }
            request.output_file = Some(trimmed.to_string());
        }
        Ok(())
    }

    pub async fn snapshot(&self, id: JobId) -> Option<JobSnapshot> {
        let handle = self.jobs.read().await.get(&id)?.handle.clone();
        Some(handle.snapshot().await)
    }

    pub async fn status(&self, id: JobId) -> Result<StatusReport, JobError> {
        let snapshot = self.snapshot(id).await.ok_or(JobError::NotFound(id))?;
        Ok(snapshot.into())
    }

    /// Preview of a finished job. `None` when the job produced no text.
    pub async fn preview(&self, id: JobId) -> Result<Option<Preview>, JobError> {
        Ok(self.finished(id).await?.preview)
    }

    /// Download handle of a finished job. `None` when nothing was packaged.
    pub async fn download(&self, id: JobId) -> Result<Option<DownloadHandle>, JobError> {
        Ok(self.finished(id).await?.download)
    }

    async fn finished(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        let snapshot = self.snapshot(id).await.ok_or(JobError::NotFound(id))?;
        if !snapshot.status.is_terminal() {
            return Err(JobError::StillRunning(id));
        }
        Ok(snapshot)
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let handles: Vec<JobHandle> = self
            .jobs
            .read()
            .await
            .values()
            .map(|entry| entry.handle.clone())
            .collect();
        let mut snapshots = join_all(handles.iter().map(|h| h.snapshot())).await;
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Waits for the job's worker to finish and returns the final snapshot.
    pub async fn wait(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        let (handle, worker) = {
            let jobs = self.jobs.read().await;
            let entry = jobs.get(&id).ok_or(JobError::NotFound(id))?;
            (entry.handle.clone(), entry.worker.clone())
        };
        worker.await;
        Ok(handle.snapshot().await)
    }

    /// Waits for every registered worker.
    pub async fn wait_all(&self) {
        let workers: Vec<_> = self
            .jobs
            .read()
            .await
            .values()
            .map(|entry| entry.worker.clone())
            .collect();
        join_all(workers).await;
    }

    /// Drops a finished job and deletes its downloadable output.
    pub async fn remove(&self, id: JobId) -> Result<JobSnapshot, JobError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get(&id).ok_or(JobError::NotFound(id))?;
        let snapshot = entry.handle.snapshot().await;
        if !snapshot.status.is_terminal() {
            return Err(JobError::StillRunning(id));
        }
        jobs.remove(&id);
        drop(jobs);

        if let Some(download) = &snapshot.download {
            match tokio::fs::remove_file(&download.path).await {
                Ok(()) => info!(job_id = %id, path = %download.path.display(), "Removed job output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(job_id = %id, error = %e, "Failed to remove job output"),
            }
        }
        Ok(snapshot)
    }
}
