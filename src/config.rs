use file2ai_core::config::CoreConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Top-level settings: the HTTP server plus the job pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub core: CoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for a single HTTP request. Jobs run on past it.
    pub request_timeout_secs: u64,
    /// Largest accepted request body, in MiB.
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            request_timeout_secs: 60,
            max_upload_mb: 100,
        }
    }
}

impl AppConfig {
    pub fn trace_loaded(&self) {
        info!(
            host = %self.server.host,
            port = self.server.port,
            request_timeout_secs = self.server.request_timeout_secs,
            max_upload_mb = self.server.max_upload_mb,
            "Loaded server config"
        );
        self.core.trace_loaded();
        debug!(?self, "Config loaded (full debug)");
    }
}
