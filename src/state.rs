use std::sync::Arc;

use file2ai_core::convert::BuiltinConverter;
use file2ai_core::registry::JobRegistry;
use file2ai_core::repo_export::GitCliFetcher;

use crate::config::AppConfig;

/// Shared state handed to every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// State backed by the built-in converter and the `git` CLI.
    pub fn new(config: AppConfig) -> Self {
        let registry = JobRegistry::new(
            config.core.clone(),
            Arc::new(BuiltinConverter),
            Arc::new(GitCliFetcher),
        );
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: AppConfig, registry: JobRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
        }
    }
}
