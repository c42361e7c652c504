//! Conversion dispatch: classify a file, look up the capability for the
//! requested target, validate options, call the converter and stage the
//! resulting artifact.
//!
//! Classification ([`classify`]) and the dispatch table ([`capability`]) are
//! pure functions. Unsupported pairs are rejected before any converter runs.

use std::fmt;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::contract::{Converter, ConverterOutput, ConverterRequest};
use crate::error::{ConversionError, ValidationError};
use crate::package::claim_unique_path;
use crate::source::SourceFile;

/// How many leading bytes [`classify`] looks at.
pub const SNIFF_LEN: usize = 8192;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "py", "json", "yml", "yaml", "toml", "ini", "cfg", "conf",
    "sh", "bash", "zsh", "bat", "ps1", "js", "mjs", "ts", "tsx", "jsx", "css", "scss", "xml",
    "csv", "tsv", "sql", "java", "kt", "scala", "c", "h", "cpp", "hpp", "cc", "cs", "rb", "php",
    "go", "rs", "swift", "lua", "pl", "r", "log", "env", "lock", "gradle", "dockerfile", "svg",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "bin", "exe", "dll", "so", "dylib", "zip", "tar", "gz", "tgz", "bz2", "xz", "7z", "rar",
    "class", "jar", "o", "a", "wasm", "woff", "woff2", "ttf", "otf", "mp3", "mp4", "mov", "avi",
    "ico",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Text,
    Html,
    Mhtml,
    Pdf,
    Doc,
    Docx,
    Xls,
    Xlsx,
    Ppt,
    Pptx,
    Image,
    Binary,
    Unknown,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Text => "text",
            SourceKind::Html => "html",
            SourceKind::Mhtml => "mhtml",
            SourceKind::Pdf => "pdf",
            SourceKind::Doc => "doc",
            SourceKind::Docx => "docx",
            SourceKind::Xls => "xls",
            SourceKind::Xlsx => "xlsx",
            SourceKind::Ppt => "ppt",
            SourceKind::Pptx => "pptx",
            SourceKind::Image => "image",
            SourceKind::Binary => "binary",
            SourceKind::Unknown => "unknown",
        }
    }

    /// Kinds read as text by consolidated exports. Documents, images and
    /// archives are counted as binary there.
    pub fn is_textual(&self) -> bool {
        matches!(self, SourceKind::Text | SourceKind::Html | SourceKind::Mhtml)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a file from its name and its first bytes.
pub fn classify(path: &str, head: &[u8]) -> SourceKind {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    if let Some(ext) = extension.as_deref() {
        let by_extension = match ext {
            "html" | "htm" => Some(SourceKind::Html),
            "mhtml" | "mht" => Some(SourceKind::Mhtml),
            "pdf" => Some(SourceKind::Pdf),
            "doc" => Some(SourceKind::Doc),
            "docx" => Some(SourceKind::Docx),
            "xls" => Some(SourceKind::Xls),
            "xlsx" => Some(SourceKind::Xlsx),
            "ppt" => Some(SourceKind::Ppt),
            "pptx" => Some(SourceKind::Pptx),
            e if IMAGE_EXTENSIONS.contains(&e) => Some(SourceKind::Image),
            e if TEXT_EXTENSIONS.contains(&e) => Some(SourceKind::Text),
            e if BINARY_EXTENSIONS.contains(&e) => Some(SourceKind::Binary),
            _ => None,
        };
        if let Some(kind) = by_extension {
            return kind;
        }
    }

    sniff(head)
}

fn sniff(head: &[u8]) -> SourceKind {
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";
    const OLE: &[u8] = b"\xd0\xcf\x11\xe0\xa1\xb1\x1a\xe1";

    if head.starts_with(b"%PDF") {
        return SourceKind::Pdf;
    }
    if head.starts_with(PNG)
        || head.starts_with(b"\xff\xd8\xff")
        || head.starts_with(b"GIF87a")
        || head.starts_with(b"GIF89a")
    {
        return SourceKind::Image;
    }
    if head.starts_with(b"PK\x03\x04") {
        return if contains(head, b"word/") {
            SourceKind::Docx
        } else if contains(head, b"xl/") {
            SourceKind::Xlsx
        } else if contains(head, b"ppt/") {
            SourceKind::Pptx
        } else {
            SourceKind::Binary
        };
    }
    if head.starts_with(OLE) {
        return SourceKind::Binary;
    }
    if head.iter().take(1024).any(|b| *b == 0) {
        return SourceKind::Binary;
    }

    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        // A multi-byte character cut off by the sniff window is still text.
        Err(e) if e.error_len().is_none() => {
            std::str::from_utf8(&head[..e.valid_up_to()]).unwrap_or_default()
        }
        Err(_) => return SourceKind::Unknown,
    };
    let start = text.trim_start().to_ascii_lowercase();
    if start.starts_with("<!doctype html") || start.starts_with("<html") {
        SourceKind::Html
    } else {
        SourceKind::Text
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Text,
    Json,
    Pdf,
    Docx,
    Xlsx,
    Pptx,
    Image,
}

impl TargetFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetFormat::Text => "text",
            TargetFormat::Json => "json",
            TargetFormat::Pdf => "pdf",
            TargetFormat::Docx => "docx",
            TargetFormat::Xlsx => "xlsx",
            TargetFormat::Pptx => "pptx",
            TargetFormat::Image => "image",
        }
    }

    /// Extension used for artifacts of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Text => "txt",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(TargetFormat::Text),
            "json" => Ok(TargetFormat::Json),
            "pdf" => Ok(TargetFormat::Pdf),
            "docx" => Ok(TargetFormat::Docx),
            "xlsx" => Ok(TargetFormat::Xlsx),
            "pptx" => Ok(TargetFormat::Pptx),
            "image" | "images" => Ok(TargetFormat::Image),
            other => Err(format!(
                "unsupported format `{other}`, expected one of text, json, pdf, docx, xlsx, pptx, image"
            )),
        }
    }
}

/// What the converter is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ExtractText,
    RenderPdf,
    RenderImages,
    /// Same format in and out; handled without a converter.
    PassThrough,
}

/// The dispatch table.
pub fn capability(kind: SourceKind, target: TargetFormat) -> Option<Capability> {
    use Capability::*;
    use SourceKind as K;
    use TargetFormat as T;

    match (kind, target) {
        (K::Text, T::Text | T::Json) => Some(ExtractText),
        (K::Text, T::Pdf) => Some(RenderPdf),
        (K::Html | K::Mhtml, T::Text) => Some(ExtractText),
        (K::Html | K::Mhtml, T::Pdf) => Some(RenderPdf),
        (K::Html | K::Mhtml, T::Image) => Some(RenderImages),
        (K::Pdf, T::Text) => Some(ExtractText),
        (K::Pdf, T::Image) => Some(RenderImages),
        (K::Doc | K::Docx, T::Text) => Some(ExtractText),
        (K::Xls | K::Xlsx, T::Text) => Some(ExtractText),
        (K::Xls | K::Xlsx, T::Image) => Some(RenderImages),
        (K::Ppt | K::Pptx, T::Text) => Some(ExtractText),
        (K::Ppt | K::Pptx, T::Image) => Some(RenderImages),
        (K::Docx, T::Docx) | (K::Xlsx, T::Xlsx) | (K::Pptx, T::Pptx) => Some(PassThrough),
        _ => None,
    }
}

/// Per-call conversion options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    /// 0.0 to 2.0.
    pub brightness: f32,
    /// 0.0 to 2.0.
    pub contrast: f32,
    /// DPI, 1 to 1200.
    pub resolution: u32,
    /// Image quality, 1 to 100.
    pub quality: u32,
    /// Page selection such as `1-3,7`; `None` means every page.
    #[serde(alias = "pages")]
    pub page_range: Option<String>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            brightness: 1.5,
            contrast: 1.2,
            resolution: 300,
            quality: 95,
            page_range: None,
        }
    }
}

impl ConversionOptions {
    /// Range-checks every option and parses the page selection.
    pub fn validate(&self) -> Result<Option<PageRange>, ValidationError> {
        check_factor("brightness", self.brightness)?;
        check_factor("contrast", self.contrast)?;
        check_range("resolution", self.resolution, 1, 1200)?;
        check_range("quality", self.quality, 1, 100)?;
        match self.page_range.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(input) => parse_page_range(input).map(Some),
        }
    }
}

fn check_factor(field: &'static str, value: f32) -> Result<(), ValidationError> {
    if value.is_finite() && (0.0..=2.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: value.to_string(),
            min: "0.0".into(),
            max: "2.0".into(),
        })
    }
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), ValidationError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        })
    }
}

/// A parsed page selection; pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRange(Vec<RangeInclusive<u32>>);

impl PageRange {
    pub fn contains(&self, page: u32) -> bool {
        self.0.iter().any(|r| r.contains(&page))
    }

    /// Selected pages of a document with `total` pages, ascending and deduplicated.
    pub fn pages(&self, total: u32) -> Vec<u32> {
        (1..=total).filter(|p| self.contains(*p)).collect()
    }
}

/// Parses `N`, `A-B` and comma separated lists of both. Reversed ranges are
/// swapped; page 0 is rejected.
pub fn parse_page_range(input: &str) -> Result<PageRange, ValidationError> {
    let invalid = |reason: &str| ValidationError::PageRange {
        input: input.to_string(),
        reason: reason.to_string(),
    };
    let parse_page = |s: &str| -> Result<u32, ValidationError> {
        match s.trim().parse::<u32>() {
            Ok(0) => Err(invalid("pages start at 1")),
            Ok(n) => Ok(n),
            Err(_) => Err(invalid("expected a page number")),
        }
    };

    let mut ranges = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(invalid("empty entry"));
        }
        let range = match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_page(start)?, parse_page(end)?);
                start.min(end)..=start.max(end)
            }
            None => {
                let page = parse_page(part)?;
                page..=page
            }
        };
        ranges.push(range);
    }
    Ok(PageRange(ranges))
}

/// A converted file staged for packaging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name the artifact is offered under.
    pub logical_name: String,
    /// Relative path of the file it was converted from.
    pub source_path: String,
    pub byte_length: u64,
    /// Current location on disk. For bundled results this is the archive.
    #[serde(skip)]
    pub storage_path: PathBuf,
    /// Hex SHA-256 of the artifact contents.
    pub sha256: String,
    /// Page images belonging to an image index artifact.
    #[serde(skip)]
    pub companions: Vec<PathBuf>,
}

impl Artifact {
    pub fn is_text(&self) -> bool {
        matches!(
            Path::new(&self.logical_name)
                .extension()
                .and_then(|e| e.to_str()),
            Some("txt") | Some("json")
        )
    }
}

/// Runs single-file conversions for one job, writing into its staging directory.
#[derive(Clone)]
pub struct Dispatcher {
    converter: Arc<dyn Converter>,
    staging_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(converter: Arc<dyn Converter>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            converter,
            staging_dir: staging_dir.into(),
        }
    }

    /// Converts `file` into `target`, staging the result.
    pub async fn convert(
        &self,
        file: &SourceFile,
        target: TargetFormat,
        options: &ConversionOptions,
    ) -> Result<Artifact, ConversionError> {
        let name = file.relative_path.clone();
        options
            .validate()
            .map_err(|source| ConversionError::Validation {
                file: name.clone(),
                source,
            })?;

        let bytes = file.read().await.map_err(|source| ConversionError::Io {
            file: name.clone(),
            source,
        })?;
        let kind = classify(&name, &bytes[..bytes.len().min(SNIFF_LEN)]);
        let Some(capability) = capability(kind, target) else {
            debug!(file = %name, %kind, %target, "No converter capability for pair");
            return Err(ConversionError::Unsupported {
                file: name,
                kind,
                target,
            });
        };

        let stem = file_stem(&name);
        if capability == Capability::PassThrough {
            return self.stage(&name, &format!("{stem}.{}", target.extension()), &bytes);
        }

        let request = ConverterRequest {
            file_name: name.clone(),
            kind,
            capability,
            bytes,
            options: options.clone(),
        };
        let output = self
            .converter
            .convert(request)
            .await
            .map_err(|e| ConversionError::Converter {
                file: name.clone(),
                message: e.to_string(),
            })?;

        match output {
            ConverterOutput::Text(text) if target == TargetFormat::Json => {
                let document = serde_json::json!({ "file": name, "content": text });
                let encoded = serde_json::to_vec_pretty(&document).map_err(|e| {
                    ConversionError::Converter {
                        file: name.clone(),
                        message: e.to_string(),
                    }
                })?;
                self.stage(&name, &format!("{stem}.json"), &encoded)
            }
            ConverterOutput::Text(text) => {
                self.stage(&name, &format!("{stem}.txt"), text.as_bytes())
            }
            ConverterOutput::Document { extension, bytes } => {
                self.stage(&name, &format!("{stem}.{extension}"), &bytes)
            }
            ConverterOutput::Pages(pages) => self.stage_pages(&name, &stem, pages),
        }
    }

    /// Reads `file` as text for a consolidated export.
    ///
    /// Returns `Ok(None)` for anything that is not text or markup, including
    /// PDF and Office documents. Exports skip those rather than fail on them.
    pub async fn extract_text(
        &self,
        file: &SourceFile,
        options: &ConversionOptions,
    ) -> Result<Option<String>, ConversionError> {
        let name = file.relative_path.clone();
        let bytes = file.read().await.map_err(|source| ConversionError::Io {
            file: name.clone(),
            source,
        })?;
        let kind = classify(&name, &bytes[..bytes.len().min(SNIFF_LEN)]);
        if !kind.is_textual() {
            debug!(file = %name, %kind, "Skipping non-text file");
            return Ok(None);
        }
        if kind == SourceKind::Text {
            return Ok(Some(decode_text(&bytes)));
        }

        let request = ConverterRequest {
            file_name: name.clone(),
            kind,
            capability: Capability::ExtractText,
            bytes,
            options: options.clone(),
        };
        match self.converter.convert(request).await {
            Ok(ConverterOutput::Text(text)) => Ok(Some(text)),
            Ok(_) => Err(ConversionError::Converter {
                file: name,
                message: "converter did not return text".into(),
            }),
            Err(e) => Err(ConversionError::Converter {
                file: name,
                message: e.to_string(),
            }),
        }
    }

    fn stage(&self, source: &str, file_name: &str, bytes: &[u8]) -> Result<Artifact, ConversionError> {
        let io_err = |e: std::io::Error| ConversionError::Io {
            file: source.to_string(),
            source: e,
        };
        let (path, mut handle) = claim_unique_path(&self.staging_dir, file_name).map_err(io_err)?;
        handle.write_all(bytes).map_err(io_err)?;
        let logical_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.to_string());
        Ok(Artifact {
            logical_name,
            source_path: source.to_string(),
            byte_length: bytes.len() as u64,
            storage_path: path,
            sha256: sha256_hex(bytes),
            companions: Vec::new(),
        })
    }

    /// Writes page images under `images/` plus a `<stem>.image` index listing them.
    fn stage_pages(
        &self,
        source: &str,
        stem: &str,
        pages: Vec<crate::contract::PageImage>,
    ) -> Result<Artifact, ConversionError> {
        if pages.is_empty() {
            warn!(file = %source, "Converter rendered no pages");
            return Err(ConversionError::Converter {
                file: source.to_string(),
                message: "no pages were rendered".into(),
            });
        }
        let io_err = |e: std::io::Error| ConversionError::Io {
            file: source.to_string(),
            source: e,
        };
        let images_dir = self.staging_dir.join("images");
        std::fs::create_dir_all(&images_dir).map_err(io_err)?;

        let mut companions = Vec::with_capacity(pages.len());
        let mut index = String::new();
        for (n, page) in pages.iter().enumerate() {
            let page_name = format!("{stem}_page_{}.{}", n + 1, page.extension);
            let (path, mut handle) = claim_unique_path(&images_dir, &page_name).map_err(io_err)?;
            handle.write_all(&page.bytes).map_err(io_err)?;
            if let Some(written) = path.file_name() {
                index.push_str("images/");
                index.push_str(&written.to_string_lossy());
                index.push('\n');
            }
            companions.push(path);
        }

        let mut artifact = self.stage(source, &format!("{stem}.image"), index.as_bytes())?;
        artifact.companions = companions;
        Ok(artifact)
    }
}

fn file_stem(relative_path: &str) -> String {
    Path::new(relative_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "file".to_string())
}

/// UTF-8 first, Latin-1 as the fallback every byte sequence decodes under.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.strip_prefix('\u{feff}').unwrap_or(text).to_string(),
        Err(_) => bytes.iter().map(|b| *b as char).collect(),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
