//! Submission, polling, preview and download over HTTP.

mod common;

use std::time::Duration;

use axum::http::{header, StatusCode};
use common::*;
use file2ai_core::contract::{ConverterOutput, MockConverter};
use serde_json::json;
use tempfile::tempdir;

#[tokio::test]
async fn json_convert_job_can_be_polled_previewed_and_downloaded() {
    let results = tempdir().unwrap();
    let (app, state) = build_test_app(results.path());

    let response = post_json(
        &app,
        "/api/submit",
        json!({
            "command": "convert",
            "files": [{"name": "notes.txt", "content": "hello world"}],
            "format": "text"
        }),
    )
    .await;
    let job_id = accepted_job(response).await;
    state.registry.wait(job_id).await.unwrap();

    let status = body_json(get(&app, &format!("/status/{job_id}")).await).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["progress"], 100.0);
    assert_eq!(status["errors"], json!([]));

    let preview = get(&app, &format!("/preview/{job_id}")).await;
    assert_eq!(preview.status(), StatusCode::OK);
    let preview = body_json(preview).await;
    assert_eq!(preview["preview"], "hello world");
    assert_eq!(preview["truncated"], false);

    let download = get(&app, &format!("/download/{job_id}")).await;
    assert_eq!(download.status(), StatusCode::OK);
    let disposition = download
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("notes.txt"), "{disposition}");
    assert_eq!(&body_bytes(download).await[..], b"hello world");
}

#[tokio::test]
async fn multipart_upload_is_converted() {
    let results = tempdir().unwrap();
    let (app, state) = build_test_app(results.path());

    let body = multipart_body(&[
        ("file", Some("readme.md"), "# Title\n\nBody text"),
        ("format", None, "text"),
        ("pattern_input", None, ""),
    ]);
    let job_id = accepted_job(post_multipart(&app, "/api/convert", body).await).await;
    let snapshot = state.registry.wait(job_id).await.unwrap();

    assert_eq!(snapshot.status.to_string(), "completed");
    let download = snapshot.download.expect("download");
    assert_eq!(download.file_name, "readme.txt");
}

#[tokio::test]
async fn multipart_rejects_bad_numbers() {
    let results = tempdir().unwrap();
    let (app, _) = build_test_app(results.path());

    let body = multipart_body(&[
        ("file", Some("a.txt"), "a"),
        ("resolution", None, "high"),
    ]);
    let response = post_multipart(&app, "/api/convert", body).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn local_export_produces_consolidated_json() {
    let results = tempdir().unwrap();
    let project = tempdir().unwrap();
    std::fs::create_dir_all(project.path().join("src")).unwrap();
    std::fs::write(project.path().join("src/main.rs"), "fn main() {}\n").unwrap();
    std::fs::write(project.path().join("notes.md"), "# notes\n").unwrap();
    let (app, state) = build_test_app(results.path());

    let response = post_json(
        &app,
        "/api/export",
        json!({
            "local_dir": project.path(),
            "format": "json",
            "pattern_mode": "exclude",
            "pattern_input": "*.md",
            "output_file": "project.json"
        }),
    )
    .await;
    let job_id = accepted_job(response).await;
    state.registry.wait(job_id).await.unwrap();

    let download = get(&app, &format!("/download/{job_id}")).await;
    assert_eq!(download.status(), StatusCode::OK);
    let export: serde_json::Value = serde_json::from_slice(&body_bytes(download).await).unwrap();
    let text = export.to_string();
    assert!(text.contains("src/main.rs"), "{text}");
    assert!(!text.contains("notes.md"), "{text}");
    assert!(results.path().join("project.json").exists());
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let results = tempdir().unwrap();
    let (app, _) = build_test_app(results.path());

    let empty = post_json(&app, "/api/submit", json!({"command": "convert", "files": []})).await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(empty).await["code"], "VALIDATION_ERROR");

    let bad_pattern = post_json(
        &app,
        "/api/submit",
        json!({
            "command": "convert",
            "files": [{"name": "a.txt", "content": "a"}],
            "pattern_input": "src/{a,b"
        }),
    )
    .await;
    assert_eq!(bad_pattern.status(), StatusCode::BAD_REQUEST);

    let no_source = post_json(&app, "/api/export", json!({"format": "text"})).await;
    assert_eq!(no_source.status(), StatusCode::BAD_REQUEST);

    let missing_dir = post_json(
        &app,
        "/api/export",
        json!({"local_dir": "/definitely/not/a/dir"}),
    )
    .await;
    assert_eq!(missing_dir.status(), StatusCode::BAD_REQUEST);

    let bad_url = post_json(
        &app,
        "/api/submit",
        json!({"command": "export", "repo_url": "not a url"}),
    )
    .await;
    assert_eq!(bad_url.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_jobs_are_not_found() {
    let results = tempdir().unwrap();
    let (app, _) = build_test_app(results.path());
    let id = uuid::Uuid::new_v4();

    for path in ["status", "preview", "download", "api/jobs"] {
        let response = get(&app, &format!("/{path}/{id}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        assert_eq!(body_json(response).await["code"], "NOT_FOUND");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn results_are_conflicts_until_the_job_finishes() {
    let results = tempdir().unwrap();
    let mut converter = MockConverter::new();
    converter.expect_convert().returning(|request| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(ConverterOutput::Text(request.file_name))
    });
    let (app, state) = build_test_app_with(results.path(), converter);

    let response = post_json(
        &app,
        "/api/submit",
        json!({"command": "convert", "files": [{"name": "slow.txt", "content": "zzz"}]}),
    )
    .await;
    let job_id = accepted_job(response).await;

    let preview = get(&app, &format!("/preview/{job_id}")).await;
    assert_eq!(preview.status(), StatusCode::CONFLICT);
    let download = get(&app, &format!("/download/{job_id}")).await;
    assert_eq!(download.status(), StatusCode::CONFLICT);
    let removal = delete(&app, &format!("/api/jobs/{job_id}")).await;
    assert_eq!(removal.status(), StatusCode::CONFLICT);

    state.registry.wait(job_id).await.unwrap();
    let download = get(&app, &format!("/download/{job_id}")).await;
    assert_eq!(download.status(), StatusCode::OK);
}

#[tokio::test]
async fn finished_jobs_are_listed_and_removed() {
    let results = tempdir().unwrap();
    let (app, state) = build_test_app(results.path());

    let job_id = accepted_job(
        post_json(
            &app,
            "/api/submit",
            json!({"command": "convert", "files": [{"name": "a.txt", "content": "a"}]}),
        )
        .await,
    )
    .await;
    let snapshot = state.registry.wait(job_id).await.unwrap();
    let output = snapshot.download.unwrap().path;
    assert!(output.exists());

    let listed = body_json(get(&app, "/api/jobs").await).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], job_id.to_string());
    assert!(listed[0]["download"].get("path").is_none());

    let removal = delete(&app, &format!("/api/jobs/{job_id}")).await;
    assert_eq!(removal.status(), StatusCode::NO_CONTENT);
    assert!(!output.exists());
    assert_eq!(
        get(&app, &format!("/status/{job_id}")).await.status(),
        StatusCode::NOT_FOUND
    );
}
