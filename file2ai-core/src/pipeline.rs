//! The per-job worker: resolve sources, dispatch every file, package the
//! result and settle the job's terminal state.
//!
//! # Steps
//! 1. `Idle -> Processing`.
//! 2. Resolve the source (upload, local directory or repository checkout)
//!    and apply the filter. A failure here fails the whole job.
//! 3. Dispatch files in resolver order. Per-file failures are recorded and
//!    the loop continues; progress is published after every file.
//! 4. Remove the working tree (unless retained), package the artifacts or
//!    the consolidated export, and finish the job.
//!
//! Internal failures (packaging, join errors) surface to users as a generic
//! message; details go to the log only.

use std::fmt::Display;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::CoreConfig;
use crate::contract::{Converter, RepoFetcher};
use crate::dispatch::{ConversionOptions, Dispatcher, TargetFormat};
use crate::error::SourceError;
use crate::export::ExportDocument;
use crate::glob::FilterSpec;
use crate::job::{Completion, JobHandle, JobKind};
use crate::package::{Finalized, OutputPackager};
use crate::source::{self, ResolvedSource, SourceFile, SourceRequest};

/// Message shown for failures whose detail stays in the logs.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error while processing the job";

/// A submitted unit of work.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub kind: JobKind,
    pub source: SourceRequest,
    pub filter: FilterSpec,
    pub format: TargetFormat,
    pub options: ConversionOptions,
    /// Name for the consolidated export file.
    pub output_file: Option<String>,
}

/// A whole-job failure, already phrased for users.
#[derive(Debug)]
struct JobFailure(String);

impl JobFailure {
    fn internal(context: &'static str, detail: impl Display) -> Self {
        error!(context, error = %detail, "Internal job error");
        JobFailure(INTERNAL_ERROR_MESSAGE.to_string())
    }
}

impl From<SourceError> for JobFailure {
    fn from(e: SourceError) -> Self {
        JobFailure(e.to_string())
    }
}

#[derive(Clone)]
pub struct Pipeline {
    config: CoreConfig,
    converter: Arc<dyn Converter>,
    fetcher: Arc<dyn RepoFetcher>,
    packager: OutputPackager,
}

impl Pipeline {
    pub fn new(
        config: CoreConfig,
        converter: Arc<dyn Converter>,
        fetcher: Arc<dyn RepoFetcher>,
    ) -> Self {
        let packager = OutputPackager::new(&config.results_dir, config.preview_chars);
        Self {
            config,
            converter,
            fetcher,
            packager,
        }
    }

    /// Runs `request` to completion, recording everything on `job`.
    pub async fn run(&self, job: JobHandle, request: JobRequest) {
        if let Err(e) = job.begin().await {
            error!(job_id = %job.id(), error = %e, "Job could not start");
            return;
        }

        let outcome = self.execute(&job, request).await;
        let settled = match outcome {
            Ok(completion) => job.finish(completion).await.map(|_| ()),
            Err(JobFailure(message)) => job.fail(message).await,
        };
        if let Err(e) = settled {
            error!(job_id = %job.id(), error = %e, "Job could not settle");
        }

        let staging = self.config.staging_dir(job.id());
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staging.display(), error = %e, "Failed to remove staging dir"),
        }
    }

    async fn execute(
        &self,
        job: &JobHandle,
        mut request: JobRequest,
    ) -> Result<Completion, JobFailure> {
        let source_request = std::mem::replace(&mut request.source, SourceRequest::Upload(Vec::new()));
        let filter = request
            .filter
            .compile()
            .map_err(|e| JobFailure(e.to_string()))?;
        let ResolvedSource {
            name,
            files,
            filtered_out,
            ignored,
            working_tree,
        } = source::resolve(
            source_request,
            &filter,
            self.fetcher.as_ref(),
            self.config.fetch_timeout(),
        )
        .await?;

        let outcome = if files.is_empty() {
            Err(JobFailure("no files matched the filter".to_string()))
        } else {
            self.dispatch_all(job, &name, &files, (filtered_out, ignored), &request)
                .await
        };

        if let Some(tree) = working_tree {
            match tree.cleanup() {
                Ok(Some(kept)) => info!(path = %kept.display(), "Working tree retained"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to remove working tree"),
            }
        }
        outcome
    }

    async fn dispatch_all(
        &self,
        job: &JobHandle,
        name: &str,
        files: &[SourceFile],
        dropped: (usize, usize),
        request: &JobRequest,
    ) -> Result<Completion, JobFailure> {
        let dispatcher = Dispatcher::new(self.converter.clone(), self.config.staging_dir(job.id()));
        let consolidated = request.kind == JobKind::Export
            && matches!(request.format, TargetFormat::Text | TargetFormat::Json);
        info!(
            job_id = %job.id(),
            files = files.len(),
            format = %request.format,
            consolidated,
            "Dispatching files"
        );

        if consolidated {
            self.export_all(job, name, files, dropped, request, &dispatcher)
                .await
        } else {
            self.convert_all(job, name, files, request, &dispatcher).await
        }
    }

    async fn convert_all(
        &self,
        job: &JobHandle,
        name: &str,
        files: &[SourceFile],
        request: &JobRequest,
        dispatcher: &Dispatcher,
    ) -> Result<Completion, JobFailure> {
        let total = files.len();
        let mut artifacts = Vec::new();
        let mut failed = 0;

        for (done, file) in files.iter().enumerate() {
            match dispatcher.convert(file, request.format, &request.options).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    failed += 1;
                    job.record_error(e.to_string())
                        .await
                        .map_err(|e| JobFailure::internal("record_error", e))?;
                }
            }
            job.advance(done + 1, total)
                .await
                .map_err(|e| JobFailure::internal("advance", e))?;
        }

        let succeeded = artifacts.len();
        if succeeded == 0 {
            return Ok(Completion {
                failed,
                ..Default::default()
            });
        }

        let packager = self.packager.clone();
        let bundle_stem = format!("{name}_{}", request.format);
        let finalized = tokio::task::spawn_blocking(move || {
            packager.finalize_artifacts(&bundle_stem, artifacts)
        })
        .await
        .map_err(|e| JobFailure::internal("finalize", e))?
        .map_err(|e| JobFailure::internal("finalize", e))?;

        Ok(completion(succeeded, failed, finalized, None))
    }

    async fn export_all(
        &self,
        job: &JobHandle,
        name: &str,
        files: &[SourceFile],
        (filtered_out, ignored): (usize, usize),
        request: &JobRequest,
        dispatcher: &Dispatcher,
    ) -> Result<Completion, JobFailure> {
        let total = files.len();
        let mut document = ExportDocument::new(name);
        document.stats.skipped_files = filtered_out;
        document.stats.ignored_files = ignored;

        for (done, file) in files.iter().enumerate() {
            match dispatcher.extract_text(file, &request.options).await {
                Ok(Some(text)) => {
                    document.push(file.relative_path.clone(), text, file.commit_info.clone())
                }
                Ok(None) => document.stats.binary_files += 1,
                Err(e) => {
                    document.stats.error_files += 1;
                    job.record_error(e.to_string())
                        .await
                        .map_err(|e| JobFailure::internal("record_error", e))?;
                }
            }
            job.advance(done + 1, total)
                .await
                .map_err(|e| JobFailure::internal("advance", e))?;
        }

        let succeeded = document.entries.len();
        let failed = document.stats.error_files;
        let stats = document.stats.clone();
        info!(
            job_id = %job.id(),
            processed = stats.processed_files,
            binary = stats.binary_files,
            errors = stats.error_files,
            tokens = stats.total_tokens,
            "Export collected"
        );
        if succeeded == 0 {
            if stats.binary_files > 0 && failed == 0 {
                return Err(JobFailure(format!(
                    "no text files to export ({} binary files skipped)",
                    stats.binary_files
                )));
            }
            return Ok(Completion {
                failed,
                stats: Some(stats),
                ..Default::default()
            });
        }

        let packager = self.packager.clone();
        let format = request.format;
        let output_file = request.output_file.clone();
        let finalized = tokio::task::spawn_blocking(move || {
            packager.write_export(&document, format, output_file.as_deref())
        })
        .await
        .map_err(|e| JobFailure::internal("write_export", e))?
        .map_err(|e| JobFailure::internal("write_export", e))?;

        Ok(completion(succeeded, failed, finalized, Some(stats)))
    }
}

fn completion(
    succeeded: usize,
    failed: usize,
    finalized: Finalized,
    stats: Option<crate::export::ExportStats>,
) -> Completion {
    Completion {
        succeeded,
        failed,
        artifacts: finalized.artifacts,
        download: Some(finalized.download),
        preview: finalized.preview,
        stats,
    }
}
