//! Error taxonomy shared by the pipeline stages.
//!
//! - [`SubmitError`]: request rejected before a job exists.
//! - [`ValidationError`] / [`ConversionError`]: one file failed; the job goes on.
//! - [`RepoExportError`] / [`SourceError`]: the whole job fails.
//! - [`PackageError`]: internal, surfaced to users as a generic message.
//! - [`JobError`]: lifecycle misuse or unknown job ids.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

pub use crate::glob::GlobError;
use crate::dispatch::{SourceKind, TargetFormat};
use crate::job::JobStatus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: String,
        min: String,
        max: String,
    },
    #[error("invalid page range `{input}`: {reason}")]
    PageRange { input: String, reason: String },
}

/// Failure converting a single file. The message always starts with the path.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("{file}: {source}")]
    Validation {
        file: String,
        #[source]
        source: ValidationError,
    },
    #[error("{file}: unsupported conversion from {kind} to {target}")]
    Unsupported {
        file: String,
        kind: SourceKind,
        target: TargetFormat,
    },
    #[error("{file}: conversion failed: {message}")]
    Converter { file: String, message: String },
    #[error("{file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConversionError {
    pub fn file(&self) -> &str {
        match self {
            ConversionError::Validation { file, .. }
            | ConversionError::Unsupported { file, .. }
            | ConversionError::Converter { file, .. }
            | ConversionError::Io { file, .. } => file,
        }
    }
}

/// Repository export failures. Messages are redacted before construction, so
/// rendering one never leaks a token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoExportError {
    #[error("invalid repository url `{0}`")]
    InvalidUrl(String),
    #[error("invalid branch name `{0}`")]
    InvalidBranch(String),
    #[error("git executable not available: {0}")]
    GitUnavailable(String),
    #[error("branch `{branch}` not found in {url}")]
    BranchNotFound { url: String, branch: String },
    #[error("authentication failed for {url}")]
    AuthenticationFailed { url: String },
    #[error("clone of {url} failed: {message}")]
    CloneFailed { url: String, message: String },
    #[error("clone of {url} timed out after {seconds}s")]
    Timeout { url: String, seconds: u64 },
    #[error("could not prepare working tree: {0}")]
    WorkingTree(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Repository(#[from] RepoExportError),
    #[error("directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("subdirectory `{0}` does not exist")]
    MissingSubdir(String),
    #[error("invalid subdirectory `{0}`")]
    InvalidSubdir(String),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("failed to encode export: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("nothing to package")]
    Empty,
}

impl PackageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PackageError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Pattern(#[from] GlobError),
    #[error(transparent)]
    Repository(#[from] RepoExportError),
    #[error("no files were submitted")]
    EmptyUpload,
    #[error("directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("invalid output file name `{0}`")]
    InvalidOutputName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("job {0} is still running")]
    StillRunning(Uuid),
}
