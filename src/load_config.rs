use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use tracing::{error, info};

use crate::config::AppConfig;

/// Loads the optional YAML config file, then applies `FILE2AI_*` environment
/// overrides. Without a file every setting starts from its default.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => {
            info!("No config file given, using defaults");
            AppConfig::default()
        }
    };
    apply_env_overrides(&mut config)?;
    config.trace_loaded();
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<AppConfig> {
    info!(config_path = ?path, "Loading configuration from file");

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path, e));
        }
    };

    match serde_yaml::from_str::<AppConfig>(&content) {
        Ok(config) => {
            info!(config_path = ?path, "Parsed config YAML successfully");
            Ok(config)
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path, "Failed to parse config YAML");
            Err(anyhow::anyhow!("Failed to parse config YAML: {e}"))
        }
    }
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Some(host) = env_var("FILE2AI_HOST") {
        config.server.host = host;
    }
    if let Some(port) = parsed_env("FILE2AI_PORT")? {
        config.server.port = port;
    }
    if let Some(secs) = parsed_env("FILE2AI_REQUEST_TIMEOUT_SECS")? {
        config.server.request_timeout_secs = secs;
    }
    if let Some(dir) = env_var("FILE2AI_RESULTS_DIR") {
        config.core.results_dir = dir.into();
    }
    if let Some(secs) = parsed_env("FILE2AI_FETCH_TIMEOUT_SECS")? {
        config.core.fetch_timeout_secs = secs;
    }
    if let Some(chars) = parsed_env("FILE2AI_PREVIEW_CHARS")? {
        config.core.preview_chars = chars;
    }
    if let Some(kb) = parsed_env("FILE2AI_MAX_FILE_SIZE_KB")? {
        config.core.default_max_file_size_kb = Some(kb);
    }
    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = env_var(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            info!(var = name, "Applied environment override");
            Ok(Some(value))
        }
        Err(e) => {
            error!(error = %e, var = name, value = %raw, "Invalid environment override");
            Err(anyhow::anyhow!("{name} must be a valid number, got {raw:?}: {e}"))
        }
    }
}
