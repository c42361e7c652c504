//! Output packaging: move finished artifacts into the shared results
//! directory, bundle multi-file results, write consolidated exports and
//! build previews.
//!
//! The results directory is shared by all jobs. Names are claimed with an
//! exclusive create while holding a process-wide lock, so two jobs
//! finalizing at once never receive the same `name(N).ext`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::dispatch::{sha256_hex, Artifact, TargetFormat};
use crate::error::PackageError;
use crate::export::ExportDocument;

static CLAIM_LOCK: Mutex<()> = Mutex::new(());

/// How to fetch the result of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHandle {
    pub file_name: String,
    /// Location in the results directory; never sent to clients.
    #[serde(skip)]
    pub path: PathBuf,
    pub content_type: String,
    pub byte_length: u64,
    /// True when several artifacts were zipped together.
    pub bundled: bool,
}

/// Bounded text excerpt of a finished text job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    pub file: String,
    pub preview: String,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct Finalized {
    pub download: DownloadHandle,
    pub preview: Option<Preview>,
    /// Artifacts with their final storage paths.
    pub artifacts: Vec<Artifact>,
}

/// Splits `name(3).txt` into `("name", ".txt")`, dropping any `(N)` suffix.
pub fn split_file_name(file_name: &str) -> (String, String) {
    let (stem, ext) = match file_name.rfind('.') {
        Some(dot) if dot > 0 => (&file_name[..dot], &file_name[dot..]),
        _ => (file_name, ""),
    };
    let base = match stem.strip_suffix(')').and_then(|s| s.rsplit_once('(')) {
        Some((base, n)) if !base.is_empty() && !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => {
            base
        }
        _ => stem,
    };
    (base.to_string(), ext.to_string())
}

/// Candidate names in the order they are tried: `base.ext`, `base(1).ext`, ...
pub fn candidate_names(file_name: &str) -> impl Iterator<Item = String> {
    let (base, ext) = split_file_name(file_name);
    std::iter::once(format!("{base}{ext}"))
        .chain((1u64..).map(move |n| format!("{base}({n}){ext}")))
}

/// First candidate not present in `dir`. Does not reserve it.
pub fn sequential_path(dir: &Path, file_name: &str) -> PathBuf {
    candidate_names(file_name)
        .map(|name| dir.join(name))
        .find(|path| !path.exists())
        .unwrap_or_else(|| dir.join(file_name))
}

/// Reserves the first free candidate in `dir` by creating it, returning the
/// open file.
pub fn claim_unique_path(dir: &Path, file_name: &str) -> io::Result<(PathBuf, File)> {
    std::fs::create_dir_all(dir)?;
    let _guard = CLAIM_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for name in candidate_names(file_name) {
        let path = dir.join(&name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                debug!(path = %path.display(), "Claimed output name");
                return Ok((path, file));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::other("no free file name"))
}

pub fn content_type_for(file_name: &str) -> &'static str {
    match Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("txt") | Some("image") => "text/plain; charset=utf-8",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("pptx") => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

/// Writes finished job output into the results directory.
#[derive(Debug, Clone)]
pub struct OutputPackager {
    results_dir: PathBuf,
    preview_chars: usize,
}

impl OutputPackager {
    pub fn new(results_dir: impl Into<PathBuf>, preview_chars: usize) -> Self {
        Self {
            results_dir: results_dir.into(),
            preview_chars,
        }
    }

    /// Exposes one artifact directly, or zips several into `<bundle_stem>.zip`.
    pub fn finalize_artifacts(
        &self,
        bundle_stem: &str,
        mut artifacts: Vec<Artifact>,
    ) -> Result<Finalized, PackageError> {
        if artifacts.is_empty() {
            return Err(PackageError::Empty);
        }
        let preview = self.preview_from_artifacts(&artifacts);
        if artifacts.len() > 1 || !artifacts[0].companions.is_empty() {
            return self.bundle(bundle_stem, artifacts, preview);
        }

        let single = &mut artifacts[0];
        let (path, _) = claim_unique_path(&self.results_dir, &single.logical_name)
            .map_err(|e| PackageError::io(&self.results_dir, e))?;
        move_file(&single.storage_path, &path)?;
        single.storage_path = path.clone();
        let download = handle_for(&path, false)?;
        info!(file = %download.file_name, "Artifact ready");
        Ok(Finalized {
            download,
            preview,
            artifacts,
        })
    }

    fn bundle(
        &self,
        bundle_stem: &str,
        mut artifacts: Vec<Artifact>,
        preview: Option<Preview>,
    ) -> Result<Finalized, PackageError> {
        let (path, file) = claim_unique_path(&self.results_dir, &format!("{bundle_stem}.zip"))
            .map_err(|e| PackageError::io(&self.results_dir, e))?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for artifact in &artifacts {
            zip.start_file(artifact.logical_name.as_str(), options)?;
            copy_into(&artifact.storage_path, &mut zip)?;
            for companion in &artifact.companions {
                let name = companion
                    .file_name()
                    .map(|n| format!("images/{}", n.to_string_lossy()))
                    .unwrap_or_else(|| "images/page".to_string());
                zip.start_file(name, options)?;
                copy_into(companion, &mut zip)?;
            }
        }
        zip.finish()?;

        for artifact in &mut artifacts {
            artifact.storage_path = path.clone();
            artifact.companions.clear();
        }
        let download = handle_for(&path, true)?;
        info!(file = %download.file_name, entries = artifacts.len(), "Bundle ready");
        Ok(Finalized {
            download,
            preview,
            artifacts,
        })
    }

    /// Writes a consolidated export as `output_file` or its default name.
    pub fn write_export(
        &self,
        document: &ExportDocument,
        format: TargetFormat,
        output_file: Option<&str>,
    ) -> Result<Finalized, PackageError> {
        let rendered = document.render(format)?;
        let requested = output_file
            .map(str::to_string)
            .unwrap_or_else(|| document.default_file_name(format));
        let (path, mut file) = claim_unique_path(&self.results_dir, &requested)
            .map_err(|e| PackageError::io(&self.results_dir, e))?;
        file.write_all(rendered.as_bytes())
            .map_err(|e| PackageError::io(&path, e))?;

        let download = handle_for(&path, false)?;
        let artifact = Artifact {
            logical_name: download.file_name.clone(),
            source_path: document.name.clone(),
            byte_length: rendered.len() as u64,
            storage_path: path,
            sha256: sha256_hex(rendered.as_bytes()),
            companions: Vec::new(),
        };
        info!(file = %download.file_name, files = document.entries.len(), "Export written");
        Ok(Finalized {
            preview: Some(self.preview(&download.file_name, &rendered)),
            download,
            artifacts: vec![artifact],
        })
    }

    fn preview_from_artifacts(&self, artifacts: &[Artifact]) -> Option<Preview> {
        let artifact = artifacts.iter().find(|a| a.is_text())?;
        let mut head = Vec::new();
        File::open(&artifact.storage_path)
            .and_then(|f| f.take(self.preview_chars as u64 * 4 + 4).read_to_end(&mut head))
            .ok()?;
        let content = String::from_utf8_lossy(&head);
        Some(self.preview(&artifact.logical_name, &content))
    }

    pub fn preview(&self, file: &str, content: &str) -> Preview {
        let truncated = content.chars().nth(self.preview_chars).is_some();
        Preview {
            file: file.to_string(),
            preview: content.chars().take(self.preview_chars).collect(),
            truncated,
        }
    }
}

fn move_file(from: &Path, to: &Path) -> Result<(), PackageError> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to).map_err(|e| PackageError::io(to, e))?;
    std::fs::remove_file(from).map_err(|e| PackageError::io(from, e))
}

fn copy_into(path: &Path, zip: &mut ZipWriter<File>) -> Result<(), PackageError> {
    let mut source = File::open(path).map_err(|e| PackageError::io(path, e))?;
    io::copy(&mut source, zip).map_err(|e| PackageError::io(path, e))?;
    Ok(())
}

fn handle_for(path: &Path, bundled: bool) -> Result<DownloadHandle, PackageError> {
    let byte_length = std::fs::metadata(path)
        .map_err(|e| PackageError::io(path, e))?
        .len();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(DownloadHandle {
        content_type: content_type_for(&file_name).to_string(),
        file_name,
        path: path.to_path_buf(),
        byte_length,
        bundled,
    })
}
