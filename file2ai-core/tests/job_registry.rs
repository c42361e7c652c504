use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use file2ai_core::config::CoreConfig;
use file2ai_core::contract::{
    Converter, ConverterOutput, ConverterRequest, MockConverter, MockRepoFetcher,
};
use file2ai_core::convert::BuiltinConverter;
use file2ai_core::dispatch::{ConversionOptions, TargetFormat};
use file2ai_core::error::{JobError, RepoExportError, SubmitError};
use file2ai_core::glob::{FilterSpec, PatternMode};
use file2ai_core::job::{JobKind, JobStatus};
use file2ai_core::pipeline::INTERNAL_ERROR_MESSAGE;
use file2ai_core::registry::{JobRegistry, JobRequest};
use file2ai_core::repo_export::{GitCliFetcher, RepoExportSpec, Secret};
use file2ai_core::source::{SourceRequest, UploadedFile};
use tempfile::{tempdir, TempDir};

fn config(results: &Path) -> CoreConfig {
    CoreConfig {
        results_dir: results.to_path_buf(),
        ..Default::default()
    }
}

fn registry(results: &Path, converter: impl Converter + 'static) -> JobRegistry {
    let mut fetcher = MockRepoFetcher::new();
    fetcher.expect_fetch().never();
    JobRegistry::new(config(results), Arc::new(converter), Arc::new(fetcher))
}

fn upload(names: &[&str]) -> SourceRequest {
    SourceRequest::Upload(
        names
            .iter()
            .map(|name| UploadedFile {
                name: name.to_string(),
                bytes: format!("contents of {name}").into_bytes(),
            })
            .collect(),
    )
}

fn convert_request(source: SourceRequest, format: TargetFormat) -> JobRequest {
    JobRequest {
        kind: JobKind::Convert,
        source,
        filter: FilterSpec::default(),
        format,
        options: ConversionOptions::default(),
        output_file: None,
    }
}

fn export_request(root: &Path, format: TargetFormat) -> JobRequest {
    JobRequest {
        kind: JobKind::Export,
        source: SourceRequest::LocalDir {
            root: root.to_path_buf(),
            subdir: None,
        },
        filter: FilterSpec::default(),
        format,
        options: ConversionOptions::default(),
        output_file: None,
    }
}

fn minimal_docx(text: &str) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("[Content_Types].xml", options).unwrap();
        zip.write_all(br#"<?xml version="1.0"?><Types/>"#).unwrap();
        zip.start_file("word/document.xml", options).unwrap();
        write!(
            zip,
            r#"<?xml version="1.0"?><w:document><w:body><w:p><w:r><w:t>{text}</w:t></w:r></w:p></w:body></w:document>"#
        )
        .unwrap();
        zip.finish().unwrap();
    }
    buffer.into_inner()
}

fn project(files: &[(&str, &str)]) -> TempDir {
    let dir = tempdir().unwrap();
    for (relative, contents) in files {
        let path = dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
    dir
}

#[tokio::test]
async fn corrupt_docx_fails_alone() {
    let results = tempdir().unwrap();
    let registry = registry(results.path(), BuiltinConverter);

    let request = convert_request(
        SourceRequest::Upload(vec![
            UploadedFile {
                name: "good.docx".into(),
                bytes: minimal_docx("Quarterly numbers"),
            },
            UploadedFile {
                name: "bad.docx".into(),
                bytes: b"this is not a zip archive".to_vec(),
            },
        ]),
        TargetFormat::Text,
    );
    let id = registry.submit(request).await.unwrap();
    let snapshot = registry.wait(id).await.unwrap();

    assert_eq!(snapshot.status, JobStatus::CompletedWithErrors);
    assert_eq!(snapshot.progress, 100.0);
    assert_eq!(snapshot.result.len(), 1);
    assert_eq!(snapshot.errors.len(), 1);
    assert!(snapshot.errors[0].contains("bad.docx"), "{:?}", snapshot.errors);

    let download = snapshot.download.expect("download");
    assert_eq!(download.file_name, "good.txt");
    assert_eq!(
        std::fs::read_to_string(&download.path).unwrap(),
        "Quarterly numbers"
    );
    assert_eq!(snapshot.preview.unwrap().preview, "Quarterly numbers");
}

#[tokio::test]
async fn k_failures_of_n_leave_n_minus_k_artifacts() {
    let results = tempdir().unwrap();
    let mut converter = MockConverter::new();
    converter.expect_convert().times(5).returning(|request| {
        if request.file_name.starts_with("bad") {
            Err(format!("cannot read {}", request.file_name).into())
        } else {
            Ok(ConverterOutput::Text(request.file_name))
        }
    });
    let registry = registry(results.path(), converter);

    let id = registry
        .submit(convert_request(
            upload(&["a.txt", "bad1.txt", "b.txt", "bad2.txt", "c.txt"]),
            TargetFormat::Text,
        ))
        .await
        .unwrap();
    let snapshot = registry.wait(id).await.unwrap();

    assert_eq!(snapshot.status, JobStatus::CompletedWithErrors);
    assert_eq!(snapshot.errors.len(), 2);
    assert_eq!(snapshot.result.len(), 3);
    assert!(snapshot.errors[0].starts_with("bad1.txt"));
    assert!(snapshot.errors[1].starts_with("bad2.txt"));

    let download = snapshot.download.unwrap();
    assert!(download.bundled);
    assert_eq!(download.file_name, "a_text.zip");
}

#[tokio::test]
async fn all_failures_mean_failed() {
    let results = tempdir().unwrap();
    let mut converter = MockConverter::new();
    converter
        .expect_convert()
        .returning(|_| Err("broken".into()));
    let registry = registry(results.path(), converter);

    let id = registry
        .submit(convert_request(upload(&["a.txt", "b.txt"]), TargetFormat::Text))
        .await
        .unwrap();
    let snapshot = registry.wait(id).await.unwrap();

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.errors.len(), 2);
    assert!(snapshot.download.is_none());
}

struct SlowConverter;

#[async_trait]
impl Converter for SlowConverter {
    async fn convert(
        &self,
        request: ConverterRequest,
    ) -> Result<ConverterOutput, Box<dyn std::error::Error + Send + Sync>> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(ConverterOutput::Text(request.file_name))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_only_moves_forward() {
    let results = tempdir().unwrap();
    let registry = registry(results.path(), SlowConverter);
    let id = registry
        .submit(convert_request(
            upload(&["1.txt", "2.txt", "3.txt", "4.txt", "5.txt"]),
            TargetFormat::Text,
        ))
        .await
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let snapshot = registry.snapshot(id).await.unwrap();
        seen.push((snapshot.status, snapshot.progress));
        if snapshot.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for pair in seen.windows(2) {
        assert!(pair[0].1 <= pair[1].1, "progress went backwards: {seen:?}");
    }
    for (status, progress) in &seen {
        assert_eq!(*progress == 100.0, status.is_terminal(), "{seen:?}");
    }
    assert_eq!(seen.last().unwrap().0, JobStatus::Completed);
}

#[tokio::test]
async fn repository_failures_fail_the_job_without_leaking_tokens() {
    let results = tempdir().unwrap();
    let mut fetcher = MockRepoFetcher::new();
    fetcher.expect_fetch().returning(|export, _| {
        Err(RepoExportError::AuthenticationFailed {
            url: export.clone_url.clone(),
        })
    });
    let registry = JobRegistry::new(
        config(results.path()),
        Arc::new(BuiltinConverter),
        Arc::new(fetcher),
    );

    let id = registry
        .submit(JobRequest {
            kind: JobKind::Export,
            source: SourceRequest::Repository(RepoExportSpec {
                url: "https://github.com/o/private".into(),
                token: Some(Secret::new("ghp_topsecret")),
                ..Default::default()
            }),
            filter: FilterSpec::default(),
            format: TargetFormat::Text,
            options: ConversionOptions::default(),
            output_file: None,
        })
        .await
        .unwrap();
    let snapshot = registry.wait(id).await.unwrap();

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(
        snapshot.errors,
        vec!["authentication failed for https://github.com/o/private".to_string()]
    );
    let rendered = serde_json::to_string(&snapshot).unwrap();
    assert!(!rendered.contains("ghp_topsecret"));
}

#[tokio::test]
async fn filtering_everything_out_fails_the_job() {
    let results = tempdir().unwrap();
    let source = project(&[("a.md", "# a"), ("b.md", "# b")]);
    let registry = registry(results.path(), BuiltinConverter);

    let mut request = export_request(source.path(), TargetFormat::Text);
    request.filter = FilterSpec::parse(PatternMode::Exclude, "*.md", None);
    let id = registry.submit(request).await.unwrap();
    let snapshot = registry.wait(id).await.unwrap();

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.errors, vec!["no files matched the filter".to_string()]);
}

#[tokio::test]
async fn local_export_writes_one_consolidated_file() {
    let results = tempdir().unwrap();
    let source = project(&[
        ("README.md", "# Demo\n"),
        ("src/main.py", "print('hi')\n"),
        ("assets/logo.png", "\u{89}PNG"),
        ("notes.md", "skip me"),
    ]);
    let registry = registry(results.path(), BuiltinConverter);

    let mut request = export_request(source.path(), TargetFormat::Text);
    request.filter = FilterSpec::parse(PatternMode::Exclude, "notes.md", None);
    let id = registry.submit(request).await.unwrap();
    let snapshot = registry.wait(id).await.unwrap();

    assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.errors);
    let stats = snapshot.stats.expect("stats");
    assert_eq!(stats.processed_files, 2);
    assert_eq!(stats.binary_files, 1);
    assert_eq!(stats.skipped_files, 1);

    let download = snapshot.download.expect("download");
    assert!(download.file_name.ends_with("_export.txt"));
    let text = std::fs::read_to_string(&download.path).unwrap();
    assert!(text.contains("File: README.md"));
    assert!(text.contains("File: src/main.py"));
    assert!(!text.contains("skip me"));
    assert!(snapshot.preview.unwrap().preview.starts_with("Generated by file2ai"));
}

#[tokio::test]
async fn exports_count_documents_as_binary_instead_of_failing() {
    let results = tempdir().unwrap();
    let source = project(&[
        ("README.md", "# Manual\n"),
        ("docs/manual.pdf", "%PDF-1.4\n%\u{e2}\u{e3}\n1 0 obj\n"),
    ]);
    let registry = registry(results.path(), BuiltinConverter);

    let id = registry
        .submit(export_request(source.path(), TargetFormat::Text))
        .await
        .unwrap();
    let snapshot = registry.wait(id).await.unwrap();

    assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.errors);
    assert!(snapshot.errors.is_empty());
    let stats = snapshot.stats.expect("stats");
    assert_eq!(stats.processed_files, 1);
    assert_eq!(stats.binary_files, 1);
    assert_eq!(stats.error_files, 0);
}

#[tokio::test]
async fn repeated_exports_do_not_overwrite_each_other() {
    let results = tempdir().unwrap();
    let source = project(&[("a.txt", "alpha")]);
    let registry = registry(results.path(), BuiltinConverter);

    let mut names = Vec::new();
    for _ in 0..2 {
        let mut request = export_request(source.path(), TargetFormat::Text);
        request.output_file = Some("export.txt".into());
        let id = registry.submit(request).await.unwrap();
        names.push(registry.wait(id).await.unwrap().download.unwrap().file_name);
    }
    assert_eq!(names, vec!["export.txt", "export(1).txt"]);
}

#[tokio::test]
async fn binary_only_exports_fail_with_a_reason() {
    let results = tempdir().unwrap();
    let source = project(&[("a.png", "x"), ("b.zip", "y")]);
    let registry = registry(results.path(), BuiltinConverter);

    let id = registry
        .submit(export_request(source.path(), TargetFormat::Json))
        .await
        .unwrap();
    let snapshot = registry.wait(id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert!(snapshot.errors[0].contains("2 binary files skipped"));
}

#[tokio::test]
async fn invalid_submissions_are_rejected_up_front() {
    let results = tempdir().unwrap();
    let registry = registry(results.path(), BuiltinConverter);

    let empty = registry
        .submit(convert_request(SourceRequest::Upload(Vec::new()), TargetFormat::Pdf))
        .await;
    assert!(matches!(empty, Err(SubmitError::EmptyUpload)));

    let mut bad_pattern = convert_request(upload(&["a.txt"]), TargetFormat::Text);
    bad_pattern.filter = FilterSpec::parse(PatternMode::Include, "src/{a,b", None);
    assert!(matches!(
        registry.submit(bad_pattern).await,
        Err(SubmitError::Pattern(_))
    ));

    let missing = registry
        .submit(export_request(Path::new("/definitely/not/here"), TargetFormat::Text))
        .await;
    assert!(matches!(missing, Err(SubmitError::MissingDirectory(_))));

    let source = project(&[("a.txt", "a")]);
    let mut escaping = export_request(source.path(), TargetFormat::Text);
    escaping.output_file = Some("../evil.txt".into());
    assert!(matches!(
        registry.submit(escaping).await,
        Err(SubmitError::InvalidOutputName(_))
    ));

    let bad_url = JobRequest {
        source: SourceRequest::Repository(RepoExportSpec {
            url: "ftp://example.com/o/r".into(),
            ..Default::default()
        }),
        ..export_request(source.path(), TargetFormat::Text)
    };
    assert!(matches!(
        registry.submit(bad_url).await,
        Err(SubmitError::Repository(RepoExportError::InvalidUrl(_)))
    ));

    assert!(registry.list().await.is_empty());
}

struct PanickingConverter;

#[async_trait]
impl Converter for PanickingConverter {
    async fn convert(
        &self,
        _: ConverterRequest,
    ) -> Result<ConverterOutput, Box<dyn std::error::Error + Send + Sync>> {
        panic!("decoder bug with /internal/path")
    }
}

#[tokio::test]
async fn panicking_converters_fail_the_job_generically() {
    let results = tempdir().unwrap();
    let registry = registry(results.path(), PanickingConverter);

    let id = registry
        .submit(convert_request(upload(&["a.txt"]), TargetFormat::Text))
        .await
        .unwrap();
    let snapshot = registry.wait(id).await.unwrap();

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.errors, vec![INTERNAL_ERROR_MESSAGE.to_string()]);
}

/// Holds every conversion until the test opens the gate.
struct GatedConverter(Arc<tokio::sync::Notify>);

#[async_trait]
impl Converter for GatedConverter {
    async fn convert(
        &self,
        _: ConverterRequest,
    ) -> Result<ConverterOutput, Box<dyn std::error::Error + Send + Sync>> {
        self.0.notified().await;
        Ok(ConverterOutput::Text("Quarterly numbers".into()))
    }
}

#[tokio::test]
async fn status_preview_and_download_lookups_follow_the_job() {
    let results = tempdir().unwrap();
    let gate = Arc::new(tokio::sync::Notify::new());
    let registry = registry(results.path(), GatedConverter(gate.clone()));
    let id = registry
        .submit(convert_request(upload(&["memo.docx"]), TargetFormat::Text))
        .await
        .unwrap();

    let running = registry.status(id).await.unwrap();
    assert!(!running.status.is_terminal());
    assert!(running.progress < 100.0);
    assert_eq!(registry.preview(id).await.unwrap_err(), JobError::StillRunning(id));
    assert_eq!(registry.download(id).await.unwrap_err(), JobError::StillRunning(id));

    gate.notify_one();
    registry.wait(id).await.unwrap();

    let done = registry.status(id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed, "{:?}", done.errors);
    assert_eq!(done.progress, 100.0);
    let preview = registry.preview(id).await.unwrap().expect("preview");
    assert_eq!(preview.preview, "Quarterly numbers");
    let download = registry.download(id).await.unwrap().expect("download");
    assert_eq!(download.file_name, "memo.txt");
    assert_eq!(std::fs::read_to_string(download.path).unwrap(), "Quarterly numbers");

    let unknown = uuid::Uuid::new_v4();
    assert_eq!(registry.status(unknown).await.unwrap_err(), JobError::NotFound(unknown));
    assert_eq!(registry.preview(unknown).await.unwrap_err(), JobError::NotFound(unknown));
}

#[tokio::test]
async fn finished_jobs_can_be_removed_with_their_output() {
    let results = tempdir().unwrap();
    let source = project(&[("a.txt", "alpha")]);
    let registry = registry(results.path(), BuiltinConverter);

    let id = registry
        .submit(export_request(source.path(), TargetFormat::Text))
        .await
        .unwrap();
    let path: PathBuf = registry.wait(id).await.unwrap().download.unwrap().path;
    assert!(path.exists());

    registry.remove(id).await.unwrap();
    assert!(!path.exists());
    assert!(registry.snapshot(id).await.is_none());
    assert_eq!(registry.remove(id).await.unwrap_err(), JobError::NotFound(id));
}

#[tokio::test]
async fn list_returns_jobs_oldest_first() {
    let results = tempdir().unwrap();
    let source = project(&[("a.txt", "alpha")]);
    let registry = registry(results.path(), BuiltinConverter);

    let first = registry
        .submit(export_request(source.path(), TargetFormat::Text))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = registry
        .submit(export_request(source.path(), TargetFormat::Json))
        .await
        .unwrap();
    registry.wait_all().await;

    let ids: Vec<_> = registry.list().await.into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![first, second]);
}

fn git(dir: &Path, args: &[&str]) -> bool {
    std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "user.name=Test Author", "-c", "user.email=test@example.com"])
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn exports_a_local_git_repository_with_commit_metadata() {
    let repo = project(&[("README.md", "# Repo\n"), ("src/lib.rs", "pub fn f() {}\n")]);
    if !git(repo.path(), &["init", "-q"]) {
        eprintln!("git not available, skipping");
        return;
    }
    assert!(git(repo.path(), &["add", "."]));
    assert!(git(repo.path(), &["commit", "-q", "-m", "initial import"]));

    let results = tempdir().unwrap();
    let registry = JobRegistry::new(
        config(results.path()),
        Arc::new(BuiltinConverter),
        Arc::new(GitCliFetcher),
    );
    let url = format!("file://{}", repo.path().display());
    let id = registry
        .submit(JobRequest {
            kind: JobKind::Export,
            source: SourceRequest::Repository(RepoExportSpec {
                url,
                ..Default::default()
            }),
            filter: FilterSpec::default(),
            format: TargetFormat::Text,
            options: ConversionOptions::default(),
            output_file: None,
        })
        .await
        .unwrap();
    let snapshot = registry.wait(id).await.unwrap();

    assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.errors);
    let text = std::fs::read_to_string(snapshot.download.unwrap().path).unwrap();
    assert!(text.contains("File: src/lib.rs"));
    assert!(text.contains("Last Commit: initial import by Test Author"));
}

#[tokio::test]
async fn commit_metadata_comes_from_the_latest_commit_per_file() {
    let repo = project(&[("README.md", "# Repo\n"), ("src/lib.rs", "pub fn f() {}\n")]);
    if !git(repo.path(), &["init", "-q"]) {
        eprintln!("git not available, skipping");
        return;
    }
    assert!(git(repo.path(), &["add", "."]));
    assert!(git(repo.path(), &["commit", "-q", "-m", "initial import"]));
    std::fs::write(repo.path().join("README.md"), "# Repo\n\nUsage notes.\n").unwrap();
    assert!(git(repo.path(), &["commit", "-q", "-am", "document usage"]));

    let results = tempdir().unwrap();
    let registry = registry(results.path(), BuiltinConverter);
    let id = registry
        .submit(export_request(repo.path(), TargetFormat::Json))
        .await
        .unwrap();
    let snapshot = registry.wait(id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.errors);

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(snapshot.download.unwrap().path).unwrap()).unwrap();
    let message_of = |path: &str| {
        json["files"]
            .as_array()
            .unwrap()
            .iter()
            .find(|f| f["path"] == path)
            .map(|f| f["last_commit"]["message"].as_str().unwrap().to_string())
            .unwrap()
    };
    assert_eq!(message_of("README.md"), "document usage");
    assert_eq!(message_of("src/lib.rs"), "initial import");
}
