use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use file2ai_core::convert::BuiltinConverter;
use file2ai_core::dispatch::{ConversionOptions, TargetFormat};
use file2ai_core::glob::{FilterSpec, PatternMode};
use file2ai_core::job::{JobKind, JobSnapshot, JobStatus};
use file2ai_core::registry::{JobRegistry, JobRequest};
use file2ai_core::repo_export::{GitCliFetcher, RepoExportSpec, Secret};
use file2ai_core::source::{SourceRequest, UploadedFile};
use tracing::{error, info};

use crate::config::AppConfig;
use crate::load_config::load_config;
use crate::router::build_app_router;
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// CLI for file2ai: turn files, folders and Git repositories into AI-ready exports.
#[derive(Parser)]
#[clap(
    name = "file2ai",
    version,
    about = "Convert files, local directories and Git repositories into text, JSON, PDF and bundled exports"
)]
pub struct Cli {
    /// Optional YAML config file; FILE2AI_* environment variables override it
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export a repository or local directory into one consolidated file
    Export(ExportArgs),
    /// Convert one or more documents to another format
    Convert(ConvertArgs),
    /// Start the HTTP API
    #[clap(alias = "web")]
    Serve {
        #[clap(long)]
        host: Option<String>,
        #[clap(long)]
        port: Option<u16>,
    },
}

#[derive(Args)]
pub struct PatternArgs {
    /// Whether the patterns select files to keep or to drop
    #[clap(long, default_value = "exclude")]
    pub pattern_mode: PatternMode,
    /// Semicolon-separated globs, e.g. '*.md;build/*'
    #[clap(long, default_value = "")]
    pub pattern_input: String,
    /// Skip files larger than this many KiB
    #[clap(long)]
    pub max_file_size_kb: Option<u64>,
}

impl PatternArgs {
    fn into_filter(self) -> FilterSpec {
        FilterSpec::parse(
            self.pattern_mode,
            &self.pattern_input,
            self.max_file_size_kb.map(|kb| kb.saturating_mul(1024)),
        )
    }
}

#[derive(Args)]
pub struct ExportArgs {
    /// Repository URL, optionally with /tree/<branch>/<subdir>
    #[clap(
        long,
        alias = "repo-url-sub",
        conflicts_with = "local_dir",
        required_unless_present = "local_dir"
    )]
    pub repo_url: Option<String>,
    /// Local directory to export
    #[clap(long)]
    pub local_dir: Option<PathBuf>,
    /// Branch to check out
    #[clap(long)]
    pub branch: Option<String>,
    /// Subdirectory to export instead of the root
    #[clap(long)]
    pub subdir: Option<String>,
    /// Access token for private repositories
    #[clap(long)]
    pub token: Option<String>,
    /// Output file name inside the results directory
    #[clap(long)]
    pub output_file: Option<String>,
    /// Keep the cloned working tree after the export
    #[clap(long)]
    pub skip_remove: bool,
    #[clap(long, default_value = "text")]
    pub format: TargetFormat,
    #[clap(flatten)]
    pub patterns: PatternArgs,
    /// Override the configured results directory
    #[clap(long)]
    pub results_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct ConvertArgs {
    /// Input files
    #[clap(long = "input", required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,
    #[clap(long, default_value = "text")]
    pub format: TargetFormat,
    /// Copy the result here once the job finishes
    #[clap(long)]
    pub output: Option<PathBuf>,
    /// Brightness factor, 0.0 to 2.0
    #[clap(long, default_value_t = 1.5)]
    pub brightness: f32,
    /// Contrast factor, 0.0 to 2.0
    #[clap(long, default_value_t = 1.2)]
    pub contrast: f32,
    /// Page selection such as '1-3,7'
    #[clap(long)]
    pub pages: Option<String>,
    /// Output resolution in DPI
    #[clap(long, default_value_t = 300)]
    pub resolution: u32,
    /// Image quality, 1 to 100
    #[clap(long, default_value_t = 95)]
    pub quality: u32,
    #[clap(flatten)]
    pub patterns: PatternArgs,
    /// Override the configured results directory
    #[clap(long)]
    pub results_dir: Option<PathBuf>,
}

/// Async CLI entrypoint shared by main() and the integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Commands::Export(args) => {
            if let Some(dir) = &args.results_dir {
                config.core.results_dir = dir.clone();
            }
            let request = export_request(args)?;
            run_job(&config, request, None).await
        }
        Commands::Convert(args) => {
            if let Some(dir) = &args.results_dir {
                config.core.results_dir = dir.clone();
            }
            let output = args.output.clone();
            let request = convert_request(args).await?;
            run_job(&config, request, output.as_deref()).await
        }
    }
}

fn export_request(args: ExportArgs) -> Result<JobRequest> {
    let source = match (args.repo_url, args.local_dir) {
        (Some(url), _) => SourceRequest::Repository(RepoExportSpec {
            url,
            branch: args.branch,
            token: args.token.filter(|t| !t.is_empty()).map(Secret::new),
            subdir: args.subdir,
            skip_remove: args.skip_remove,
        }),
        (None, Some(root)) => SourceRequest::LocalDir {
            root,
            subdir: args.subdir,
        },
        (None, None) => anyhow::bail!("either --repo-url or --local-dir is required"),
    };
    Ok(JobRequest {
        kind: JobKind::Export,
        source,
        filter: args.patterns.into_filter(),
        format: args.format,
        options: ConversionOptions::default(),
        output_file: args.output_file,
    })
}

async fn convert_request(args: ConvertArgs) -> Result<JobRequest> {
    let mut uploads = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read input {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        uploads.push(UploadedFile { name, bytes });
    }
    Ok(JobRequest {
        kind: JobKind::Convert,
        source: SourceRequest::Upload(uploads),
        filter: args.patterns.into_filter(),
        format: args.format,
        options: ConversionOptions {
            brightness: args.brightness,
            contrast: args.contrast,
            resolution: args.resolution,
            quality: args.quality,
            page_range: args.pages,
        },
        output_file: None,
    })
}

/// Submits one job to a private registry and reports progress until it ends.
async fn run_job(config: &AppConfig, request: JobRequest, copy_to: Option<&Path>) -> Result<()> {
    let registry = JobRegistry::new(
        config.core.clone(),
        Arc::new(BuiltinConverter),
        Arc::new(GitCliFetcher),
    );
    let job_id = registry.submit(request).await?;
    println!("Job {job_id} started");

    let mut reported = -1.0;
    let snapshot = loop {
        let Some(snapshot) = registry.snapshot(job_id).await else {
            anyhow::bail!("job {job_id} disappeared from the registry");
        };
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        if snapshot.progress > reported {
            reported = snapshot.progress;
            println!("  {:>5.1}% {}", snapshot.progress, snapshot.status);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    report(&snapshot);

    if let (Some(dest), Some(download)) = (copy_to, &snapshot.download) {
        tokio::fs::copy(&download.path, dest)
            .await
            .with_context(|| format!("Failed to copy result to {}", dest.display()))?;
        println!("Copied result to {}", dest.display());
    }

    if snapshot.status == JobStatus::Failed {
        error!(%job_id, errors = ?snapshot.errors, "Job failed");
        anyhow::bail!(
            "job failed: {}",
            snapshot.errors.last().map(String::as_str).unwrap_or("unknown error")
        );
    }
    info!(%job_id, status = %snapshot.status, "Job finished");
    Ok(())
}

fn report(snapshot: &JobSnapshot) {
    println!("Job {} {}", snapshot.id, snapshot.status);
    for message in &snapshot.errors {
        eprintln!("[ERROR] {message}");
    }
    if let Some(stats) = &snapshot.stats {
        println!("{stats:#?}");
    }
    if let Some(download) = &snapshot.download {
        println!(
            "Output: {} ({} bytes)",
            download.path.display(),
            download.byte_length
        );
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config);
    let app = build_app_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "Starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Graceful shutdown complete");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
