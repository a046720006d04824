//! API integration tests against the real router.
//!
//! Run with: `cargo test -p filegate-api --test api_test`
//! Needs no external tools: every capability exercised here is in-process.

mod helpers;

use axum_test::multipart::{MultipartForm, Part};
use bytes::Bytes;
use helpers::{fixtures, setup_test_app, setup_test_app_with};

fn file_part(data: Vec<u8>, name: &str, mime: &str) -> Part {
    Part::bytes(Bytes::from(data)).file_name(name).mime_type(mime)
}

#[tokio::test]
async fn test_index_lists_capabilities_by_group() {
    let app = setup_test_app().await;
    let response = app.client().get("/").await;

    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");

    let images = body["capabilities"]["image"].as_array().unwrap();
    let compress = images
        .iter()
        .find(|c| c["key"] == "img-compress")
        .expect("img-compress is listed");
    assert_eq!(compress["route"], "/img-compress");
    assert_eq!(compress["options"]["quality"], 85);
    assert!(compress["extensions"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!("zip")));

    let pdf = body["capabilities"]["pdf"].as_array().unwrap();
    let protect = pdf.iter().find(|c| c["key"] == "protect-pdf").unwrap();
    assert!(protect["options"]["password"].is_null());
}

#[tokio::test]
async fn test_health_is_healthy_with_writable_staging() {
    let app = setup_test_app().await;
    let response = app.client().get("/health").await;

    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(app.staged_dirs(), 0);
}

#[tokio::test]
async fn test_health_fails_when_staging_root_is_gone() {
    let app = setup_test_app().await;
    std::fs::remove_dir_all(app.staging_root()).unwrap();
    std::fs::write(app.staging_root(), b"not a directory").unwrap();

    let response = app.client().get("/health").await;
    assert_eq!(response.status_code(), 503);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_status_reports_tools_and_capabilities() {
    let app = setup_test_app_with(&[("FFMPEG_PATH", "/definitely/not/here/ffmpeg")]).await;
    let response = app.client().get("/status").await;

    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["service"], "filegate");
    assert_eq!(body["environment"], "development");
    assert_eq!(body["capabilities"], app.state.registry.len());
    assert_eq!(body["tools"]["ffmpeg"]["program"], "/definitely/not/here/ffmpeg");
    assert_eq!(body["tools"]["ffmpeg"]["found"], false);
    assert_eq!(body["tools"].as_object().unwrap().len(), 7);
    assert_eq!(app.staged_dirs(), 0);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = setup_test_app().await;
    let response = app.client().get("/api/openapi.json").await;

    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert!(body["paths"]["/{capability}"]["post"].is_object());
    assert!(body["paths"]["/health"]["get"].is_object());
    assert!(body["components"]["schemas"]["ErrorResponse"].is_object());
}

#[tokio::test]
async fn test_unknown_capability_returns_not_found_envelope() {
    let app = setup_test_app().await;
    let form = MultipartForm::new().add_part("file", file_part(b"x".to_vec(), "a.txt", "text/plain"));
    let response = app.client().post("/does-not-exist").multipart(form).await;

    assert_eq!(response.status_code(), 404);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "not_found");
    assert_eq!(body["recoverable"], false);
    assert_eq!(app.staged_dirs(), 0);
}

#[tokio::test]
async fn test_unsupported_extension_is_rejected_before_staging() {
    let app = setup_test_app().await;
    let form = MultipartForm::new().add_part(
        "file",
        file_part(b"MZ".to_vec(), "setup.exe", "application/octet-stream"),
    );
    let response = app.client().post("/img-compress").multipart(form).await;

    assert_eq!(response.status_code(), 422);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "unsupported_type");
    assert!(body["message"].as_str().unwrap().contains(".exe"));
    assert_eq!(app.staged_dirs(), 0);
}

#[tokio::test]
async fn test_missing_file_is_rejected() {
    let app = setup_test_app().await;
    let form = MultipartForm::new().add_text("note", "no file here");
    let response = app.client().post("/pdf-to-word").multipart(form).await;

    assert_eq!(response.status_code(), 422);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "unsupported_type");
    assert_eq!(app.staged_dirs(), 0);
}

#[tokio::test]
async fn test_non_multipart_body_counts_as_no_upload() {
    let app = setup_test_app().await;

    let response = app.client().post("/img-png").text("plain body").await;
    assert_eq!(response.status_code(), 422);

    let response = app.client().post("/test-inspect").await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["files"], serde_json::json!([]));
    assert_eq!(body["options"]["mode"], "fast");
}

#[tokio::test]
async fn test_options_are_merged_with_defaults() {
    let app = setup_test_app().await;
    let form = MultipartForm::new()
        .add_part("file", file_part(b"a,b".to_vec(), "../../secret data.csv", "text/csv"))
        .add_text("mode", "thorough")
        .add_text("ignored", "value");
    let response = app.client().post("/test-inspect").multipart(form).await;

    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["capability"], "test-inspect");
    assert_eq!(body["files"], serde_json::json!(["secret_data.csv"]));
    assert_eq!(body["options"], serde_json::json!({"mode": "thorough"}));
    assert_eq!(app.staged_dirs(), 0);
}

#[tokio::test]
async fn test_option_values_reach_the_handler_unchanged() {
    let app = setup_test_app().await;
    let form = MultipartForm::new()
        .add_part("file", file_part(b"a".to_vec(), "a.txt", "text/plain"))
        .add_text("mode", " pw ");
    let response = app.client().post("/test-inspect").multipart(form).await;

    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["options"], serde_json::json!({"mode": " pw "}));
}

#[tokio::test]
async fn test_img_compress_returns_smaller_attachment() {
    let app = setup_test_app().await;
    let original = fixtures::jpeg(1000, 1000, 95);
    let form = MultipartForm::new()
        .add_part("file", file_part(original.clone(), "photo.jpg", "image/jpeg"))
        .add_text("quality", "50");
    let response = app.client().post("/img-compress").multipart(form).await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.header("content-type"), "image/jpeg");
    assert_eq!(
        response.header("content-disposition"),
        "attachment; filename=\"photo_compressed.jpg\""
    );
    let compressed = response.as_bytes();
    assert!(compressed.len() < original.len());
    let decoded = image::load_from_memory(compressed).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (1000, 1000));
    assert_eq!(app.staged_dirs(), 0);
}

#[tokio::test]
async fn test_zip_batch_returns_archive_of_outputs() {
    let app = setup_test_app().await;
    let archive = fixtures::zip_of(&[
        ("one.png", fixtures::png(32, 32)),
        ("nested/two.png", fixtures::png(16, 16)),
        ("readme.md", b"skip me".to_vec()),
    ]);
    let form = MultipartForm::new().add_part("file", file_part(archive, "photos.zip", "application/zip"));
    let response = app.client().post("/img-jpg").multipart(form).await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.header("content-type"), "application/zip");
    assert_eq!(
        response.header("content-disposition"),
        "attachment; filename=\"photos_jpgs.zip\""
    );
    assert_eq!(
        fixtures::zip_names(response.as_bytes()),
        vec!["one.jpg".to_string(), "two.jpg".to_string()]
    );
    assert_eq!(app.staged_dirs(), 0);
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let app = setup_test_app_with(&[("MAX_UPLOAD_SIZE_BYTES", "1024")]).await;
    let form = MultipartForm::new().add_part("file", file_part(vec![0u8; 4096], "big.txt", "text/plain"));
    let response = app.client().post("/test-inspect").multipart(form).await;

    assert_eq!(response.status_code(), 413);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "payload_too_large");
    assert_eq!(app.staged_dirs(), 0);
}

#[tokio::test]
async fn test_handler_timeout_returns_gateway_timeout() {
    let app = setup_test_app().await;
    let form = MultipartForm::new().add_part("file", file_part(b"x".to_vec(), "a.txt", "text/plain"));
    let response = app.client().post("/test-stall").multipart(form).await;

    assert_eq!(response.status_code(), 504);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "timeout");
    assert_eq!(body["recoverable"], true);
    assert_eq!(app.staged_dirs(), 0);
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let app = setup_test_app().await;
    let form = MultipartForm::new().add_part("file", file_part(b"x".to_vec(), "a.txt", "text/plain"));
    let response = app.client().post("/test-panic").multipart(form).await;

    assert_eq!(response.status_code(), 500);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "handler_crashed");
    assert!(body["details"].as_str().unwrap().contains("handler bug"));
    assert_eq!(app.staged_dirs(), 0);

    // The server keeps serving after a crash.
    assert_eq!(app.client().get("/health").await.status_code(), 200);
}

#[tokio::test]
async fn test_production_hides_failure_details() {
    let app = setup_test_app_with(&[
        ("ENVIRONMENT", "production"),
        ("CORS_ORIGINS", "https://app.example.com"),
    ])
    .await;
    let form = MultipartForm::new().add_part("file", file_part(b"x".to_vec(), "a.txt", "text/plain"));
    let response = app.client().post("/test-panic").multipart(form).await;

    assert_eq!(response.status_code(), 500);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "handler_crashed");
    assert!(body.get("details").is_none());
}

#[tokio::test]
async fn test_concurrent_requests_leave_no_staged_files() {
    let app = setup_test_app().await;
    let requests = (0..20).map(|i| {
        let form = MultipartForm::new().add_part(
            "file",
            file_part(i.to_string().into_bytes(), &format!("req{}.txt", i), "text/plain"),
        );
        let client = app.client();
        async move {
            let response = client.post("/test-inspect").multipart(form).await;
            let body: serde_json::Value = response.json();
            (i, body)
        }
    });

    for (i, body) in futures::future::join_all(requests).await {
        assert_eq!(body["files"], serde_json::json!([format!("req{}.txt", i)]));
    }
    assert_eq!(app.staged_dirs(), 0);
}
