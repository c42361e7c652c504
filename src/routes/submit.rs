//! Job submission endpoints.
//!
//! - `POST /api/submit`: JSON tagged by `command` (`convert` or `export`).
//! - `POST /api/convert`: multipart upload of one or more files.
//! - `POST /api/export`: JSON repository or local directory export.
//!
//! All three answer `202 Accepted` with `{"job_id": ...}` as soon as the job
//! is registered; conversion happens in the background.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::{routing::post, Json, Router};
use file2ai_core::dispatch::{ConversionOptions, TargetFormat};
use file2ai_core::glob::{FilterSpec, PatternMode};
use file2ai_core::job::{JobId, JobKind};
use file2ai_core::registry::JobRequest;
use file2ai_core::repo_export::{RepoExportSpec, Secret};
use file2ai_core::source::{SourceRequest, UploadedFile};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

/// Pattern filter fields shared by every submission shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterFields {
    pub pattern_mode: PatternMode,
    /// `;`, `,` or newline separated globs.
    pub pattern_input: String,
    pub max_file_size_kb: Option<u64>,
}

impl FilterFields {
    pub fn into_spec(self) -> FilterSpec {
        FilterSpec::parse(
            self.pattern_mode,
            &self.pattern_input,
            self.max_file_size_kb.map(|kb| kb.saturating_mul(1024)),
        )
    }
}

/// A file sent inline as text.
#[derive(Debug, Clone, Deserialize)]
pub struct InlineFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ConvertBody {
    pub files: Vec<InlineFile>,
    #[serde(default = "default_format")]
    pub format: TargetFormat,
    #[serde(flatten)]
    pub filter: FilterFields,
    #[serde(flatten)]
    pub options: ConversionOptions,
}

#[derive(Debug, Deserialize)]
pub struct ExportBody {
    pub repo_url: Option<String>,
    pub local_dir: Option<PathBuf>,
    pub branch: Option<String>,
    pub token: Option<String>,
    pub subdir: Option<String>,
    #[serde(default)]
    pub skip_remove: bool,
    #[serde(default = "default_format")]
    pub format: TargetFormat,
    pub output_file: Option<String>,
    #[serde(flatten)]
    pub filter: FilterFields,
    #[serde(flatten)]
    pub options: ConversionOptions,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum SubmitBody {
    Convert(ConvertBody),
    Export(ExportBody),
}

fn default_format() -> TargetFormat {
    TargetFormat::Text
}

impl ConvertBody {
    pub fn into_request(self) -> JobRequest {
        let uploads = self
            .files
            .into_iter()
            .map(|f| UploadedFile {
                name: f.name,
                bytes: f.content.into_bytes(),
            })
            .collect();
        JobRequest {
            kind: JobKind::Convert,
            source: SourceRequest::Upload(uploads),
            filter: self.filter.into_spec(),
            format: self.format,
            options: self.options,
            output_file: None,
        }
    }
}

impl ExportBody {
    pub fn into_request(self) -> AppResult<JobRequest> {
        let source = match (self.repo_url, self.local_dir) {
            (Some(url), None) => SourceRequest::Repository(RepoExportSpec {
                url,
                branch: self.branch,
                token: self.token.filter(|t| !t.is_empty()).map(Secret::new),
                subdir: self.subdir,
                skip_remove: self.skip_remove,
            }),
            (None, Some(root)) => SourceRequest::LocalDir {
                root,
                subdir: self.subdir,
            },
            (Some(_), Some(_)) => {
                return Err(AppError::BadRequest(
                    "give either repo_url or local_dir, not both".into(),
                ))
            }
            (None, None) => {
                return Err(AppError::BadRequest(
                    "repo_url or local_dir is required".into(),
                ))
            }
        };
        Ok(JobRequest {
            kind: JobKind::Export,
            source,
            filter: self.filter.into_spec(),
            format: self.format,
            options: self.options,
            output_file: self.output_file,
        })
    }
}

async fn accept(
    state: &AppState,
    request: JobRequest,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    let kind = request.kind;
    let format = request.format;
    let job_id = state.registry.submit(request).await?;
    info!(%job_id, ?kind, %format, "Accepted job");
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// POST /api/submit
async fn submit(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    let request = match body {
        SubmitBody::Convert(body) => body.into_request(),
        SubmitBody::Export(body) => body.into_request()?,
    };
    accept(&state, request).await
}

/// POST /api/export
async fn submit_export(
    State(state): State<AppState>,
    Json(body): Json<ExportBody>,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    accept(&state, body.into_request()?).await
}

/// POST /api/convert
///
/// File parts may use any field name (`file` and `files` are both common).
/// Text parts carry the options: `format`, `pattern_mode`, `pattern_input`,
/// `max_file_size_kb`, `brightness`, `contrast`, `resolution`, `quality` and
/// `pages` (or `page_range`).
async fn submit_convert(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    let mut uploads = Vec::new();
    let mut fields = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                debug!(field = %name, file = %file_name, bytes = bytes.len(), "Received upload");
                uploads.push(UploadedFile {
                    name: file_name,
                    bytes: bytes.to_vec(),
                });
            }
            None => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                fields.insert(name, value);
            }
        }
    }

    let request = convert_form(uploads, &fields)?;
    accept(&state, request).await
}

fn convert_form(
    uploads: Vec<UploadedFile>,
    fields: &HashMap<String, String>,
) -> AppResult<JobRequest> {
    let defaults = ConversionOptions::default();
    let options = ConversionOptions {
        brightness: form_value(fields, "brightness")?.unwrap_or(defaults.brightness),
        contrast: form_value(fields, "contrast")?.unwrap_or(defaults.contrast),
        resolution: form_value(fields, "resolution")?.unwrap_or(defaults.resolution),
        quality: form_value(fields, "quality")?.unwrap_or(defaults.quality),
        page_range: fields
            .get("pages")
            .or_else(|| fields.get("page_range"))
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty()),
    };
    let filter = FilterFields {
        pattern_mode: form_value(fields, "pattern_mode")?.unwrap_or_default(),
        pattern_input: fields.get("pattern_input").cloned().unwrap_or_default(),
        max_file_size_kb: form_value(fields, "max_file_size_kb")?,
    };

    Ok(JobRequest {
        kind: JobKind::Convert,
        source: SourceRequest::Upload(uploads),
        filter: filter.into_spec(),
        format: form_value(fields, "format")?.unwrap_or_else(default_format),
        options,
        output_file: None,
    })
}

fn form_value<T>(fields: &HashMap<String, String>, name: &str) -> AppResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match fields.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| AppError::BadRequest(format!("invalid {name} `{raw}`: {e}"))),
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/submit", post(submit))
        .route("/api/convert", post(submit_convert))
        .route("/api/export", post(submit_export))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_body_is_tagged_by_command() {
        let body: SubmitBody = serde_json::from_value(serde_json::json!({
            "command": "export",
            "repo_url": "https://github.com/o/r/tree/dev",
            "token": "",
            "format": "json",
            "pattern_mode": "include",
            "pattern_input": "*.rs",
            "max_file_size_kb": 2
        }))
        .unwrap();
        let SubmitBody::Export(body) = body else {
            panic!("expected export");
        };
        let request = body.into_request().unwrap();
        assert_eq!(request.format, TargetFormat::Json);
        assert_eq!(request.filter.mode, PatternMode::Include);
        assert_eq!(request.filter.max_size_bytes, Some(2048));
        match request.source {
            SourceRequest::Repository(spec) => assert!(spec.token.is_none()),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn export_needs_exactly_one_source() {
        let body: ExportBody = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(body.into_request().is_err());

        let body: ExportBody = serde_json::from_value(serde_json::json!({
            "repo_url": "https://github.com/o/r",
            "local_dir": "/tmp"
        }))
        .unwrap();
        assert!(body.into_request().is_err());
    }

    #[test]
    fn form_fields_fill_options() {
        let fields: HashMap<String, String> = [
            ("format", "pdf"),
            ("pages", "1-3"),
            ("brightness", "1.0"),
            ("pattern_input", "*.md"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let request = convert_form(Vec::new(), &fields).unwrap();
        assert_eq!(request.format, TargetFormat::Pdf);
        assert_eq!(request.options.page_range.as_deref(), Some("1-3"));
        assert_eq!(request.options.brightness, 1.0);
        assert_eq!(request.options.resolution, 300);
        assert_eq!(request.filter.patterns, vec!["*.md".to_string()]);
    }

    #[test]
    fn bad_form_numbers_are_rejected() {
        let fields: HashMap<String, String> =
            [("resolution".to_string(), "high".to_string())].into_iter().collect();
        assert!(matches!(
            convert_form(Vec::new(), &fields),
            Err(AppError::BadRequest(_))
        ));
    }
}
