//! Source resolution: turn a request into an ordered list of [`SourceFile`]s.
//!
//! Uploads keep submission order. Local directories and repository checkouts
//! are walked depth-first with entries sorted per directory, skipping hidden
//! entries and `.git`. Walks also drop whatever [`IgnoreRules`] ignores;
//! uploads never are. The [`FileFilter`] runs after enumeration.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::contract::RepoFetcher;
use crate::error::SourceError;
use crate::glob::{FileFilter, FilterSpec, PatternMode};
use crate::repo_export::{self, RepoExportSpec, WorkingTree};

/// Last commit touching a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub author: String,
    /// `YYYY-MM-DD`.
    pub date: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum SourceOrigin {
    Disk(PathBuf),
    Memory(Arc<[u8]>),
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub relative_path: String,
    pub size_bytes: u64,
    pub origin: SourceOrigin,
    pub commit_info: Option<CommitInfo>,
}

impl SourceFile {
    pub fn from_bytes(relative_path: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            relative_path: relative_path.into(),
            size_bytes: bytes.len() as u64,
            origin: SourceOrigin::Memory(bytes),
            commit_info: None,
        }
    }

    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        match &self.origin {
            SourceOrigin::Disk(path) => tokio::fs::read(path).await,
            SourceOrigin::Memory(bytes) => Ok(bytes.to_vec()),
        }
    }
}

/// One file from a direct upload.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum SourceRequest {
    Upload(Vec<UploadedFile>),
    LocalDir {
        root: PathBuf,
        subdir: Option<String>,
    },
    Repository(RepoExportSpec),
}

/// Files ready for dispatch, plus the checkout they came from, if any.
#[derive(Debug)]
pub struct ResolvedSource {
    /// Display name: repository or directory name, or the first upload.
    pub name: String,
    pub files: Vec<SourceFile>,
    /// Files dropped by patterns or the size ceiling.
    pub filtered_out: usize,
    /// Files dropped by `.gitignore` or the default ignore set.
    pub ignored: usize,
    pub working_tree: Option<WorkingTree>,
}

pub async fn resolve(
    request: SourceRequest,
    filter: &FileFilter,
    fetcher: &dyn RepoFetcher,
    fetch_timeout: Duration,
) -> Result<ResolvedSource, SourceError> {
    match request {
        SourceRequest::Upload(uploads) => {
            let name = uploads
                .first()
                .map(|u| stem_of(&normalize_upload_name(&u.name)))
                .unwrap_or_else(|| "upload".to_string());
            let files = uploads
                .into_iter()
                .map(|u| SourceFile::from_bytes(normalize_upload_name(&u.name), u.bytes))
                .collect();
            Ok(apply_filter(name, files, 0, filter, None))
        }
        SourceRequest::LocalDir { root, subdir } => {
            if !root.is_dir() {
                return Err(SourceError::MissingDirectory(root));
            }
            let name = root
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "export".to_string());
            let (files, ignored) = enumerate(&root, subdir.as_deref()).await?;
            Ok(apply_filter(name, files, ignored, filter, None))
        }
        SourceRequest::Repository(spec) => {
            let export = repo_export::resolve_spec(&spec)?;
            let tree = repo_export::materialize(&export, fetcher, fetch_timeout).await?;
            match enumerate(tree.path(), export.subdir.as_deref()).await {
                Ok((files, ignored)) => {
                    Ok(apply_filter(export.name, files, ignored, filter, Some(tree)))
                }
                Err(e) => {
                    if let Err(cleanup) = tree.cleanup() {
                        warn!(error = %cleanup, "Failed to remove working tree");
                    }
                    Err(e)
                }
            }
        }
    }
}

fn apply_filter(
    name: String,
    files: Vec<SourceFile>,
    ignored: usize,
    filter: &FileFilter,
    working_tree: Option<WorkingTree>,
) -> ResolvedSource {
    let total = files.len();
    let files: Vec<SourceFile> = files
        .into_iter()
        .filter(|f| filter.allows(&f.relative_path, f.size_bytes))
        .collect();
    let filtered_out = total - files.len();
    info!(
        source = %name,
        candidates = total,
        kept = files.len(),
        filtered_out,
        ignored,
        "Resolved source files"
    );
    ResolvedSource {
        name,
        files,
        filtered_out,
        ignored,
        working_tree,
    }
}

/// Walks `root` (or `root/subdir`), drops ignored files and attaches commit
/// metadata when `root` is a Git checkout. Returns the kept files and the
/// number of ignored ones.
async fn enumerate(
    root: &Path,
    subdir: Option<&str>,
) -> Result<(Vec<SourceFile>, usize), SourceError> {
    let scope = match subdir.map(str::trim).filter(|s| !s.is_empty()) {
        Some(subdir) => {
            let relative = safe_relative(subdir)
                .ok_or_else(|| SourceError::InvalidSubdir(subdir.to_string()))?;
            if !root.join(&relative).is_dir() {
                return Err(SourceError::MissingSubdir(subdir.to_string()));
            }
            Some(relative)
        }
        None => None,
    };
    let scan_root = match &scope {
        Some(relative) => root.join(relative),
        None => root.to_path_buf(),
    };
    // Paths under `scan_root` are reported relative to it; ignore rules and
    // git history speak in paths relative to `root`.
    let prefix = scope
        .as_deref()
        .map(|relative| format!("{}/", slash_path(relative)))
        .unwrap_or_default();

    let walk_root = scan_root.clone();
    let entries = tokio::task::spawn_blocking(move || walk_dir(&walk_root))
        .await
        .map_err(|e| SourceError::Io {
            path: scan_root.clone(),
            source: std::io::Error::other(e),
        })??;

    let rules = IgnoreRules::load(root).await;
    let total = entries.len();
    let mut files: Vec<SourceFile> = entries
        .into_iter()
        .filter(|(relative_path, _, _)| {
            let ignored = rules.is_ignored(&format!("{prefix}{relative_path}"));
            if ignored {
                debug!(path = %relative_path, "Ignored");
            }
            !ignored
        })
        .map(|(relative_path, path, size_bytes)| SourceFile {
            relative_path,
            size_bytes,
            origin: SourceOrigin::Disk(path),
            commit_info: None,
        })
        .collect();
    let ignored = total - files.len();

    if root.join(".git").exists() {
        let mut history = commit_history(root, scope.as_deref()).await;
        for file in &mut files {
            file.commit_info = history.remove(&format!("{prefix}{}", file.relative_path));
        }
    }
    Ok((files, ignored))
}

/// Patterns every directory or checkout walk drops, on top of `.gitignore`.
pub const DEFAULT_IGNORES: &[&str] = &[
    "__pycache__/",
    "node_modules/",
    "venv/",
    "*.pyc",
    "*.pyo",
    "*.pyd",
    "*.so",
    "*.dll",
    "*.dylib",
    "*.exe",
    "*.bin",
];

/// The default ignore set plus the root `.gitignore`.
///
/// Lines follow the filter pattern rules: a leading `/` anchors at the root,
/// a trailing `/` is dropped and a pattern names a path or any parent
/// directory. A `!` line keeps matching paths even when another rule drops
/// them.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    ignore: FileFilter,
    keep: FileFilter,
}

impl IgnoreRules {
    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut ignore: Vec<String> = DEFAULT_IGNORES.iter().map(|p| p.to_string()).collect();
        let mut keep = Vec::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.strip_prefix('!') {
                Some(kept) => keep.push(kept.to_string()),
                None => ignore.push(line.to_string()),
            }
        }
        Self {
            ignore: compile_rules(ignore),
            keep: compile_rules(keep),
        }
    }

    /// Reads `<root>/.gitignore`; a missing or unreadable file leaves the defaults.
    pub async fn load(root: &Path) -> Self {
        let path = root.join(".gitignore");
        let lines: Vec<String> = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents.lines().map(str::to_string).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read .gitignore");
                Vec::new()
            }
        };
        let rules = Self::from_lines(&lines);
        debug!(root = %root.display(), gitignore_lines = lines.len(), "Loaded ignore rules");
        rules
    }

    /// `path` is `/` separated and relative to the export root.
    pub fn is_ignored(&self, path: &str) -> bool {
        self.ignore.matches(path) && !self.keep.matches(path)
    }
}

/// Compiles each pattern on its own first so one bad line cannot disable the rest.
fn compile_rules(patterns: Vec<String>) -> FileFilter {
    let usable: Vec<String> = patterns
        .into_iter()
        .filter(|pattern| {
            match FilterSpec::new(PatternMode::Exclude, vec![pattern.clone()], None).compile() {
                Ok(_) => true,
                Err(e) => {
                    warn!(%pattern, error = %e, "Skipping unusable ignore pattern");
                    false
                }
            }
        })
        .collect();
    FilterSpec::new(PatternMode::Exclude, usable, None)
        .compile()
        .unwrap_or_else(|_| FileFilter::allow_all())
}

/// Depth-first walk in lexical order. Returns `(relative_path, path, size)`.
pub fn walk_dir(root: &Path) -> Result<Vec<(String, PathBuf, u64)>, SourceError> {
    fn visit(
        dir: &Path,
        root: &Path,
        out: &mut Vec<(String, PathBuf, u64)>,
    ) -> Result<(), SourceError> {
        let io_err = |source| SourceError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = std::fs::read_dir(dir)
            .map_err(io_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if name.starts_with('.') {
                debug!(path = %entry.path().display(), "Skipping hidden entry");
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type().map_err(io_err)?;
            if file_type.is_dir() {
                visit(&path, root, out)?;
            } else if file_type.is_file() {
                let size = entry.metadata().map_err(io_err)?.len();
                let relative = path
                    .strip_prefix(root)
                    .map(slash_path)
                    .unwrap_or_else(|_| name.to_string());
                out.push((relative, path, size));
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    visit(root, root, &mut out)?;
    Ok(out)
}

/// Normalizes a client supplied upload name into a relative `/` path.
pub fn normalize_upload_name(name: &str) -> String {
    let unified = name.replace('\\', "/");
    let cleaned: Vec<&str> = unified
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.join("/")
    }
}

fn safe_relative(subdir: &str) -> Option<PathBuf> {
    let path = Path::new(subdir.trim_matches('/'));
    path.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| path.to_path_buf())
}

fn stem_of(relative_path: &str) -> String {
    Path::new(relative_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

/// Joins path components with `/` regardless of platform.
fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

const RECORD_MARKER: char = '\u{1e}';

/// Last commit per file, from one `git log --name-only` pass over `scope`.
///
/// Keys are paths relative to `repo_root`. Best effort: an empty map when git
/// is missing or the log fails.
async fn commit_history(repo_root: &Path, scope: Option<&Path>) -> HashMap<String, CommitInfo> {
    let mut command = tokio::process::Command::new("git");
    command
        .arg("-C")
        .arg(repo_root)
        .args([
            "-c",
            "core.quotePath=false",
            "log",
            "--name-only",
            "--date=short",
            "--format=%x1e%an%x1f%ad%x1f%s",
            "--",
        ]);
    match scope {
        Some(scope) => command.arg(slash_path(scope)),
        None => command.arg("."),
    };
    let output = match command.output().await {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git log failed; no commit info"
            );
            return HashMap::new();
        }
        Err(e) => {
            debug!(error = %e, "git unavailable; no commit info");
            return HashMap::new();
        }
    };
    let history = parse_name_only_log(&String::from_utf8_lossy(&output.stdout));
    debug!(files = history.len(), "Read commit history");
    history
}

/// Parses `git log --name-only` output, newest commit first. The first
/// commit that names a path wins.
fn parse_name_only_log(log: &str) -> HashMap<String, CommitInfo> {
    let mut history = HashMap::new();
    let mut current: Option<CommitInfo> = None;
    for line in log.lines() {
        if let Some(header) = line.strip_prefix(RECORD_MARKER) {
            let mut fields = header.splitn(3, '\u{1f}');
            current = match (fields.next(), fields.next(), fields.next()) {
                (Some(author), Some(date), Some(message)) if !author.is_empty() => {
                    Some(CommitInfo {
                        author: author.to_string(),
                        date: date.to_string(),
                        message: message.to_string(),
                    })
                }
                _ => None,
            };
            continue;
        }
        if line.is_empty() {
            continue;
        }
        if let Some(commit) = &current {
            history
                .entry(line.to_string())
                .or_insert_with(|| commit.clone());
        }
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_names_are_made_relative() {
        assert_eq!(normalize_upload_name("C:\\docs\\a.txt"), "C:/docs/a.txt");
        assert_eq!(normalize_upload_name("/etc/../passwd"), "etc/passwd");
        assert_eq!(normalize_upload_name("./a//b.md"), "a/b.md");
        assert_eq!(normalize_upload_name(".."), "upload");
    }

    #[test]
    fn newest_commit_naming_a_path_wins() {
        let log = "\u{1e}Ada\u{1f}2024-05-02\u{1f}tweak readme\n\nREADME.md\n\
                   \u{1e}Bob\u{1f}2024-05-01\u{1f}initial import\n\nREADME.md\nsrc/lib.rs\n";
        let history = parse_name_only_log(log);

        assert_eq!(history.len(), 2);
        assert_eq!(history["README.md"].message, "tweak readme");
        assert_eq!(history["README.md"].author, "Ada");
        assert_eq!(history["src/lib.rs"].message, "initial import");
        assert_eq!(history["src/lib.rs"].date, "2024-05-01");
    }

    #[test]
    fn default_and_gitignore_rules_combine() {
        let rules = IgnoreRules::from_lines(&["# build output", "build/", "*.log", "!keep.log"]);

        assert!(rules.is_ignored("build/out.txt"));
        assert!(rules.is_ignored("node_modules/dep/index.js"));
        assert!(rules.is_ignored("pkg/__pycache__/m.pyc"));
        assert!(rules.is_ignored("logs/run.log"));
        assert!(!rules.is_ignored("logs/keep.log"));
        assert!(!rules.is_ignored("src/keep.rs"));
        assert!(!rules.is_ignored("buildscript.rs"));
    }

    #[test]
    fn subdir_must_stay_inside_root() {
        assert!(safe_relative("docs/api").is_some());
        assert!(safe_relative("/docs/").is_some());
        assert!(safe_relative("../outside").is_none());
        assert!(safe_relative("docs/../../x").is_none());
    }
}
