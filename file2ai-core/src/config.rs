use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Runtime settings for the job pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Shared directory receiving artifacts, bundles and consolidated exports.
    pub results_dir: PathBuf,
    /// Upper bound for a repository clone.
    pub fetch_timeout_secs: u64,
    /// Length of the text excerpt returned by the preview endpoint.
    pub preview_chars: usize,
    /// Size ceiling applied when a request does not set its own.
    pub default_max_file_size_kb: Option<u64>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("exports"),
            fetch_timeout_secs: 120,
            preview_chars: 2000,
            default_max_file_size_kb: None,
        }
    }
}

impl CoreConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Per-job scratch directory; removed once the job is packaged.
    pub fn staging_dir(&self, job_id: Uuid) -> PathBuf {
        self.results_dir.join(".staging").join(job_id.to_string())
    }

    pub fn trace_loaded(&self) {
        info!(
            results_dir = %self.results_dir.display(),
            fetch_timeout_secs = self.fetch_timeout_secs,
            preview_chars = self.preview_chars,
            "Loaded core config"
        );
        debug!(?self, "Core config loaded (full debug)");
    }
}
