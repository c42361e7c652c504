//! Repository export: URL parsing, branch resolution, authenticated shallow
//! clone and working-tree lifetime.
//!
//! # Flow
//! 1. [`resolve_spec`] normalizes the URL ([`parse_repo_url`]), picks the
//!    branch and subdirectory (explicit values win over the URL) and keeps
//!    the token wrapped in a [`Secret`].
//! 2. [`materialize`] creates a temporary directory and asks a
//!    [`RepoFetcher`] to clone into it, bounded by a timeout.
//! 3. The caller walks the [`WorkingTree`] and calls [`WorkingTree::cleanup`],
//!    which deletes the checkout unless retention was requested.
//!
//! Subdirectory scoping happens after the clone, during enumeration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::contract::RepoFetcher;
use crate::error::RepoExportError;

/// Path suffixes hosting sites add to repository pages.
const VIRTUAL_SUFFIXES: &[&str] = &["pulls", "issues", "actions", "wiki", "settings", "security"];

/// A credential that never renders in clear text.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// What the caller asked to export.
#[derive(Debug, Clone, Default)]
pub struct RepoExportSpec {
    pub url: String,
    pub branch: Option<String>,
    pub token: Option<Secret>,
    pub subdir: Option<String>,
    /// Keep the checkout on disk after the export.
    pub skip_remove: bool,
}

/// Result of parsing a hosting URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRepoUrl {
    pub clone_url: String,
    pub branch: Option<String>,
    pub subdir: Option<String>,
}

/// A fully resolved export, ready to be fetched.
#[derive(Debug, Clone)]
pub struct ResolvedExport {
    pub name: String,
    pub clone_url: String,
    pub branch: Option<String>,
    pub subdir: Option<String>,
    pub token: Option<Secret>,
    pub skip_remove: bool,
}

impl ResolvedExport {
    /// The clone URL with the token injected, for handing to git only.
    pub fn authenticated_url(&self) -> String {
        match &self.token {
            Some(token) => build_auth_url(&self.clone_url, token),
            None => self.clone_url.clone(),
        }
    }

    pub fn redact(&self, text: &str) -> String {
        redact(text, self.token.as_ref())
    }
}

/// Normalizes a repository URL.
///
/// Bare `host/owner/repo` forms get `https://`. A trailing `.git`, query,
/// fragment and hosting-page suffixes such as `/pulls` are dropped.
/// `/tree/<branch>[/<subdir>]` is split off into branch and subdirectory.
/// `file://`, `ssh://`, `git://`, scp-style `git@host:path` and absolute
/// local paths are passed through untouched.
pub fn parse_repo_url(url: &str) -> Result<ParsedRepoUrl, RepoExportError> {
    let trimmed = url.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(RepoExportError::InvalidUrl(trimmed.to_string()));
    }

    let passthrough = ["file://", "ssh://", "git://"]
        .iter()
        .any(|scheme| trimmed.starts_with(scheme))
        || trimmed.starts_with('/')
        || (trimmed.contains('@') && !trimmed.contains("://"));
    if passthrough {
        return Ok(ParsedRepoUrl {
            clone_url: trimmed.to_string(),
            branch: None,
            subdir: None,
        });
    }

    let (scheme, rest) = match trimmed.split_once("://") {
        Some((scheme @ ("http" | "https"), rest)) => (scheme, rest),
        Some(_) => return Err(RepoExportError::InvalidUrl(trimmed.to_string())),
        None => ("https", trimmed),
    };
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let mut parts = rest.split('/').filter(|p| !p.is_empty());
    let host = parts
        .next()
        .ok_or_else(|| RepoExportError::InvalidUrl(trimmed.to_string()))?;
    let mut path: Vec<&str> = parts.collect();

    let mut branch = None;
    let mut subdir = None;
    if let Some(tree) = path.iter().skip(1).position(|p| *p == "tree").map(|i| i + 1) {
        branch = path.get(tree + 1).map(|b| b.to_string());
        let rest = path.get(tree + 2..).unwrap_or_default();
        if !rest.is_empty() {
            subdir = Some(rest.join("/"));
        }
        path.truncate(tree);
        // GitLab spells it `/-/tree/...`.
        if path.last() == Some(&"-") {
            path.pop();
        }
    } else if let Some(cut) = path
        .iter()
        .skip(2)
        .position(|p| VIRTUAL_SUFFIXES.contains(p))
        .map(|i| i + 2)
    {
        path.truncate(cut);
    }

    let mut path: Vec<String> = path.into_iter().map(str::to_string).collect();
    if let Some(last) = path.last_mut() {
        if let Some(stripped) = last.strip_suffix(".git") {
            *last = stripped.to_string();
        }
    }
    path.retain(|p| !p.is_empty());
    if path.is_empty() {
        return Err(RepoExportError::InvalidUrl(trimmed.to_string()));
    }

    Ok(ParsedRepoUrl {
        clone_url: format!("{scheme}://{host}/{}", path.join("/")),
        branch,
        subdir,
    })
}

/// Cleans up a branch name typed by a user or cut from a URL.
///
/// Query and fragment parts, whitespace and a trailing `HEAD` are removed.
/// An empty result means "use the remote default branch".
pub fn sanitize_branch(raw: &str) -> Result<Option<String>, RepoExportError> {
    let without_query = raw.split(['?', '#']).next().unwrap_or_default();
    let compact: String = without_query.chars().filter(|c| !c.is_whitespace()).collect();
    let branch = compact.strip_suffix("HEAD").unwrap_or(&compact);
    let branch = branch.trim_end_matches('/');
    if branch.is_empty() {
        return Ok(None);
    }

    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-');
    if branch.starts_with('-') || branch.contains("..") || !branch.chars().all(allowed) {
        return Err(RepoExportError::InvalidBranch(branch.to_string()));
    }
    Ok(Some(branch.to_string()))
}

/// Applies precedence rules: explicit branch and subdir beat URL-derived ones.
pub fn resolve_spec(spec: &RepoExportSpec) -> Result<ResolvedExport, RepoExportError> {
    let parsed = parse_repo_url(&spec.url)?;

    let explicit_branch = match spec.branch.as_deref() {
        Some(raw) => sanitize_branch(raw)?,
        None => None,
    };
    let url_branch = match parsed.branch.as_deref() {
        Some(raw) => sanitize_branch(raw)?,
        None => None,
    };
    let subdir = spec
        .subdir
        .as_deref()
        .map(|s| s.trim().trim_matches('/'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or(parsed.subdir);

    Ok(ResolvedExport {
        name: repo_name(&parsed.clone_url),
        clone_url: parsed.clone_url,
        branch: explicit_branch.or(url_branch),
        subdir,
        token: spec.token.clone(),
        skip_remove: spec.skip_remove,
    })
}

/// Last path component of a clone URL, without `.git`.
pub fn repo_name(clone_url: &str) -> String {
    clone_url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .map(|n| n.trim_end_matches(".git"))
        .filter(|n| !n.is_empty())
        .unwrap_or("repository")
        .to_string()
}

/// Injects `token` as HTTPS credentials. Plain `http` is upgraded.
pub fn build_auth_url(clone_url: &str, token: &Secret) -> String {
    let rest = clone_url
        .strip_prefix("https://")
        .or_else(|| clone_url.strip_prefix("http://"));
    match rest {
        Some(rest) => format!("https://{}@{rest}", token.expose()),
        None => {
            warn!("Token ignored for non-HTTP repository URL");
            clone_url.to_string()
        }
    }
}

/// Replaces every occurrence of the token in `text`.
pub fn redact(text: &str, token: Option<&Secret>) -> String {
    match token {
        Some(token) if !token.expose().is_empty() => text.replace(token.expose(), "***"),
        _ => text.to_string(),
    }
}

/// A checkout owned by one export.
#[derive(Debug)]
pub struct WorkingTree {
    dir: TempDir,
    path: PathBuf,
    retain: bool,
}

impl WorkingTree {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_retained(&self) -> bool {
        self.retain
    }

    /// Deletes the checkout, or keeps it and returns its path when retained.
    pub fn cleanup(self) -> std::io::Result<Option<PathBuf>> {
        if self.retain {
            let kept = self.dir.keep();
            info!(path = %self.path.display(), "Keeping working tree (skip_remove)");
            debug!(root = %kept.display(), "Retained temporary directory");
            return Ok(Some(self.path));
        }
        debug!(path = %self.path.display(), "Removing working tree");
        self.dir.close()?;
        Ok(None)
    }
}

/// Fetches `export` into a fresh temporary directory, giving up after `timeout`.
///
/// On any failure the temporary directory is removed before returning.
pub async fn materialize(
    export: &ResolvedExport,
    fetcher: &dyn RepoFetcher,
    timeout: Duration,
) -> Result<WorkingTree, RepoExportError> {
    let dir = tempfile::Builder::new()
        .prefix("file2ai-export-")
        .tempdir()
        .map_err(|e| RepoExportError::WorkingTree(e.to_string()))?;
    let path = dir.path().join(&export.name);
    std::fs::create_dir_all(&path).map_err(|e| RepoExportError::WorkingTree(e.to_string()))?;

    info!(
        url = %export.clone_url,
        branch = export.branch.as_deref().unwrap_or("<default>"),
        authenticated = export.token.is_some(),
        "Fetching repository"
    );
    match tokio::time::timeout(timeout, fetcher.fetch(export, &path)).await {
        Ok(Ok(())) => Ok(WorkingTree {
            dir,
            path,
            retain: export.skip_remove,
        }),
        Ok(Err(e)) => {
            error!(error = %e, url = %export.clone_url, "Repository fetch failed");
            Err(e)
        }
        Err(_) => {
            error!(url = %export.clone_url, seconds = timeout.as_secs(), "Repository fetch timed out");
            Err(RepoExportError::Timeout {
                url: export.clone_url.clone(),
                seconds: timeout.as_secs(),
            })
        }
    }
}

/// Shallow clones with the `git` command line client.
#[derive(Debug, Clone, Default)]
pub struct GitCliFetcher;

#[async_trait]
impl RepoFetcher for GitCliFetcher {
    async fn fetch(&self, export: &ResolvedExport, destination: &Path) -> Result<(), RepoExportError> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.arg("clone").arg("--depth").arg("1");
        if let Some(branch) = &export.branch {
            cmd.arg("--branch").arg(branch).arg("--single-branch");
        }
        cmd.arg(export.authenticated_url())
            .arg(destination)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RepoExportError::GitUnavailable(e.to_string())
            } else {
                RepoExportError::CloneFailed {
                    url: export.clone_url.clone(),
                    message: export.redact(&e.to_string()),
                }
            }
        })?;

        if output.status.success() {
            debug!(url = %export.clone_url, path = %destination.display(), "git clone succeeded");
            return Ok(());
        }

        let stderr = export.redact(String::from_utf8_lossy(&output.stderr).trim());
        Err(classify_clone_failure(export, stderr))
    }
}

fn classify_clone_failure(export: &ResolvedExport, stderr: String) -> RepoExportError {
    let lower = stderr.to_ascii_lowercase();
    if let Some(branch) = &export.branch {
        if lower.contains("remote branch") && lower.contains("not found") {
            return RepoExportError::BranchNotFound {
                url: export.clone_url.clone(),
                branch: branch.clone(),
            };
        }
    }
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("403")
    {
        return RepoExportError::AuthenticationFailed {
            url: export.clone_url.clone(),
        };
    }
    RepoExportError::CloneFailed {
        url: export.clone_url.clone(),
        message: stderr,
    }
}
