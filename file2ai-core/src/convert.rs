//! Built-in [`Converter`]: what can be done with the crates already in the
//! stack.
//!
//! - Text and HTML: decoding, tag stripping, PDF rendering.
//! - DOCX, XLSX, PPTX: text extraction from the Office Open XML parts.
//! - Everything else (PDF text, legacy binary Office, page images) is
//!   reported as a per-file failure; plug a richer converter in through the
//!   trait for those.

use std::io::Read;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::code_to_pdf::text_to_pdf;
use crate::contract::{Converter, ConverterOutput, ConverterRequest};
use crate::dispatch::{decode_text, Capability, SourceKind};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));
static SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").expect("script regex")
});
static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line regex"));
static SHARED_STRING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<si>(.*?)</si>").expect("shared string regex"));
static ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<row\b[^>]*>(.*?)</row>").expect("row regex"));
static CELL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<c\b([^>]*?)(?:/>|>(.*?)</c>)"#).expect("cell regex")
});
static VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<v>(.*?)</v>").expect("value regex"));
static SLIDE_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<a:t>(.*?)</a:t>|</a:p>").expect("slide text regex"));

/// Converter backed by printpdf, zip and regex.
#[derive(Debug, Clone, Default)]
pub struct BuiltinConverter;

#[async_trait]
impl Converter for BuiltinConverter {
    async fn convert(&self, request: ConverterRequest) -> Result<ConverterOutput, BoxError> {
        tokio::task::spawn_blocking(move || convert_blocking(request)).await?
    }
}

fn convert_blocking(request: ConverterRequest) -> Result<ConverterOutput, BoxError> {
    debug!(
        file = %request.file_name,
        kind = %request.kind,
        capability = ?request.capability,
        "Built-in conversion"
    );
    match request.capability {
        Capability::ExtractText => extract_text(request.kind, &request.bytes).map(ConverterOutput::Text),
        Capability::RenderPdf => {
            let text = extract_text(request.kind, &request.bytes)?;
            Ok(ConverterOutput::Document {
                extension: "pdf".into(),
                bytes: text_to_pdf(&request.file_name, &text),
            })
        }
        Capability::RenderImages => {
            Err("page image rendering needs an external converter".into())
        }
        Capability::PassThrough => Ok(ConverterOutput::Document {
            extension: request.kind.as_str().into(),
            bytes: request.bytes,
        }),
    }
}

fn extract_text(kind: SourceKind, bytes: &[u8]) -> Result<String, BoxError> {
    match kind {
        SourceKind::Text => Ok(decode_text(bytes)),
        SourceKind::Html | SourceKind::Mhtml => Ok(html_to_text(&decode_text(bytes))),
        SourceKind::Docx => docx_text(bytes),
        SourceKind::Xlsx => xlsx_text(bytes),
        SourceKind::Pptx => pptx_text(bytes),
        other => Err(format!("text extraction from {other} needs an external converter").into()),
    }
}

/// Crude HTML to text: drop scripts and styles, turn block ends into
/// newlines, strip the remaining tags.
pub fn html_to_text(html: &str) -> String {
    let mut text = SCRIPT.replace_all(html, "").into_owned();
    for tag in ["</p>", "<br>", "<br/>", "<br />", "</div>", "</li>", "</tr>", "</h1>", "</h2>", "</h3>"] {
        text = text.replace(tag, "\n");
    }
    let text = TAG.replace_all(&text, "");
    let text = unescape_xml(&text);
    BLANK_RUNS.replace_all(text.trim(), "\n\n").into_owned()
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

fn open_archive<'a>(
    bytes: &'a [u8],
    what: &str,
) -> Result<zip::ZipArchive<std::io::Cursor<&'a [u8]>>, BoxError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| format!("not a valid {what} archive: {e}").into())
}

fn read_part(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<String, BoxError> {
    let mut part = archive
        .by_name(name)
        .map_err(|e| format!("missing part {name}: {e}"))?;
    let mut xml = String::new();
    part.read_to_string(&mut xml)?;
    Ok(xml)
}

/// Part names matching `prefix<N>.xml`, ordered by `N`.
fn numbered_parts(archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>, prefix: &str) -> Vec<String> {
    let mut parts: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let n = name.strip_prefix(prefix)?.strip_suffix(".xml")?.parse().ok()?;
            Some((n, name.to_string()))
        })
        .collect();
    parts.sort();
    parts.into_iter().map(|(_, name)| name).collect()
}

fn docx_text(bytes: &[u8]) -> Result<String, BoxError> {
    let mut archive = open_archive(bytes, "docx")?;
    let xml = read_part(&mut archive, "word/document.xml")?;
    let xml = xml
        .replace("</w:p>", "\n")
        .replace("<w:tab/>", "\t")
        .replace("<w:br/>", "\n");
    Ok(unescape_xml(TAG.replace_all(&xml, "").trim_end()))
}

fn xlsx_text(bytes: &[u8]) -> Result<String, BoxError> {
    let mut archive = open_archive(bytes, "xlsx")?;
    let shared: Vec<String> = match read_part(&mut archive, "xl/sharedStrings.xml") {
        Ok(xml) => SHARED_STRING
            .captures_iter(&xml)
            .map(|c| unescape_xml(&TAG.replace_all(&c[1], "")))
            .collect(),
        Err(_) => Vec::new(),
    };

    let mut out = String::new();
    for (index, sheet) in numbered_parts(&archive, "xl/worksheets/sheet").iter().enumerate() {
        let xml = read_part(&mut archive, sheet)?;
        out.push_str(&format!("Sheet {}\n", index + 1));
        for row in ROW.captures_iter(&xml) {
            let cells: Vec<String> = CELL
                .captures_iter(&row[1])
                .map(|cell| {
                    let attrs = cell.get(1).map_or("", |m| m.as_str());
                    let body = cell.get(2).map_or("", |m| m.as_str());
                    let raw = VALUE
                        .captures(body)
                        .map(|v| v[1].to_string())
                        .unwrap_or_else(|| TAG.replace_all(body, "").into_owned());
                    if attrs.contains(r#"t="s""#) {
                        raw.trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default()
                    } else {
                        unescape_xml(&raw)
                    }
                })
                .collect();
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
        out.push('\n');
    }
    Ok(out.trim_end().to_string())
}

fn pptx_text(bytes: &[u8]) -> Result<String, BoxError> {
    let mut archive = open_archive(bytes, "pptx")?;
    let mut out = String::new();
    for (index, slide) in numbered_parts(&archive, "ppt/slides/slide").iter().enumerate() {
        let xml = read_part(&mut archive, slide)?;
        out.push_str(&format!("Slide {}\n", index + 1));
        for m in SLIDE_TEXT.captures_iter(&xml) {
            match m.get(1) {
                Some(text) => out.push_str(&unescape_xml(text.as_str())),
                None => out.push('\n'),
            }
        }
        out.push('\n');
    }
    Ok(out.trim_end().to_string())
}
