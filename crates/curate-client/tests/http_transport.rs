// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

//! The reqwest transport against a local mock server.

use curate_client::{
    AssetDescriptor, Client, ClientConfig, Credentials, Error, FailureKind, JobStatus,
    RetryPolicy, UploadOptions, UploadResult, UrlUploadMode,
};
use mockito::Matcher;
use serde_json::json;
use std::time::Duration;

#[ctor::ctor]
fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn client(api_base: &str) -> Client {
    let config = ClientConfig::default()
        .with_api_base(api_base)
        .with_credentials(Credentials::new("key", "team"))
        .with_retry(
            RetryPolicy::new(3)
                .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
                .with_jitter(false),
        );
    Client::from_config(config).unwrap()
}

#[tokio::test]
async fn test_auth_headers() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/curate/batch/jobs/job-1/")
        .match_header("x-api-key", "key")
        .match_header("x-tenant-id", "team")
        .match_header("authorization", "Basic dGVhbTprZXk=")
        .match_header("user-agent", Matcher::Regex("^SPB/v0".to_string()))
        .match_header("idempotency-key", Matcher::Missing)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id": "job-1", "job_type": "IMAGE_IMPORT", "status": "IN_PROGRESS"}"#)
        .create_async()
        .await;

    let job = client(&server.url())
        .job(&"job-1".parse().unwrap())
        .await
        .unwrap();

    assert_eq!(job.status(), JobStatus::Running);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_error_body_shapes() {
    let mut server = mockito::Server::new_async().await;
    let _create = server
        .mock("POST", "/curate/dataset-core/datasets/")
        .match_header("idempotency-key", Matcher::Regex(".+".to_string()))
        .match_body(Matcher::PartialJson(json!({"name": "taken"})))
        .with_status(409)
        .with_body(r#"{"code": "DATASET_EXISTS", "message": "Dataset name already in use"}"#)
        .expect(1)
        .create_async()
        .await;

    let err = client(&server.url())
        .create_dataset("taken", "")
        .await
        .unwrap_err();
    match err {
        Error::Api {
            status,
            code,
            message,
        } => {
            assert_eq!(status, 409);
            assert_eq!(code.as_deref(), Some("DATASET_EXISTS"));
            assert_eq!(message, "Dataset name already in use");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_server_errors_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/curate/batch/jobs/job-2/")
        .with_status(502)
        .with_body("<html>Bad Gateway</html>")
        .expect(3)
        .create_async()
        .await;

    let err = client(&server.url())
        .job(&"job-2".parse().unwrap())
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(matches!(err, Error::Api { status: 502, ref message, .. } if message.contains("Bad Gateway")));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_client_errors_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/curate/batch/jobs/job-3/")
        .with_status(401)
        .with_body(r#"{"detail": "Invalid access key", "type": "UNAUTHORIZED"}"#)
        .expect(1)
        .create_async()
        .await;

    let err = client(&server.url())
        .job(&"job-3".parse().unwrap())
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(401));
    assert!(!err.is_retryable());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_jobs_pagination() {
    let mut server = mockito::Server::new_async().await;
    let full_page = (0..100)
        .map(|i| json!({"id": format!("job-{:03}", i), "status": "COMPLETE"}))
        .collect::<Vec<_>>();
    let first = server
        .mock("GET", "/curate/batch/jobs/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("limit".into(), "100".into()),
            Matcher::UrlEncoded("from_date".into(), "2025-01-02T00:00:00Z".into()),
        ]))
        .with_status(200)
        .with_body(
            json!({
                "results": full_page,
                "next_cursor": "c2",
            })
            .to_string(),
        )
        .create_async()
        .await;
    let second = server
        .mock("GET", "/curate/batch/jobs/")
        .match_query(Matcher::UrlEncoded("cursor".into(), "c2".into()))
        .with_status(200)
        .with_body(json!({"results": [{"id": "c", "status": "PENDING"}]}).to_string())
        .create_async()
        .await;

    let from_date = "2025-01-02T00:00:00Z".parse().unwrap();
    let jobs = client(&server.url()).jobs(Some(from_date)).await.unwrap();

    assert_eq!(jobs.len(), 101);
    assert_eq!(jobs[0].id().value(), "job-000");
    assert_eq!(jobs[100].id().value(), "c");
    assert_eq!(jobs[100].status(), JobStatus::Pending);
    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn test_jobs_short_page_ends_listing() {
    let mut server = mockito::Server::new_async().await;
    let page = server
        .mock("GET", "/curate/batch/jobs/")
        .match_query(Matcher::UrlEncoded("limit".into(), "100".into()))
        .with_status(200)
        .with_body(
            json!({
                "results": [{"id": "a", "status": "COMPLETE"}, {"id": "b", "status": "FAILED"}],
                "next_cursor": "c2",
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let jobs = client(&server.url()).jobs(None).await.unwrap();

    assert_eq!(
        jobs.iter().map(|j| j.id().value()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    page.assert_async().await;
}

#[tokio::test]
async fn test_upload_to_presigned_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    std::fs::write(&path, b"\x89PNG\r\n\x1a\nframe-bytes").unwrap();

    let mut server = mockito::Server::new_async().await;
    let presign = server
        .mock("POST", "/curate/batch/assets/bulk/")
        .match_body(Matcher::Json(json!({"file_sizes": [19]})))
        .with_status(200)
        .with_body(
            json!({
                "results": [{"id": "asset-9", "upload_url": format!("{}/bucket/asset-9?sig=abc", server.url())}],
            })
            .to_string(),
        )
        .create_async()
        .await;
    // Storage requests carry no Curate credentials.
    let put = server
        .mock("PUT", "/bucket/asset-9")
        .match_query(Matcher::UrlEncoded("sig".into(), "abc".into()))
        .match_header("x-api-key", Matcher::Missing)
        .match_header("content-type", "image/png")
        .match_header("content-length", "19")
        .match_body(b"\x89PNG\r\n\x1a\nframe-bytes".to_vec())
        .with_status(200)
        .create_async()
        .await;

    let results = client(&server.url())
        .upload_assets(&[AssetDescriptor::local("frame.png", &path)], None)
        .await
        .unwrap();

    match &results[0] {
        UploadResult::Uploaded(reference) => assert_eq!(
            serde_json::to_value(reference).unwrap(),
            json!({"type": "LOCAL", "asset_id": "asset-9"})
        ),
        other => panic!("unexpected result {:?}", other),
    }
    presign.assert_async().await;
    put.assert_async().await;
}

#[tokio::test]
async fn test_download_streams_to_presigned_url() {
    let body = b"\x89PNG\r\n\x1a\nremote-bytes".to_vec();
    let mut server = mockito::Server::new_async().await;
    let source = server
        .mock("GET", "/remote/cat.png")
        .with_status(200)
        .with_body(&body)
        .expect(1)
        .create_async()
        .await;
    let presign = server
        .mock("POST", "/curate/batch/assets/bulk/")
        .match_body(Matcher::Json(json!({"file_sizes": [body.len()]})))
        .with_status(200)
        .with_body(
            json!({
                "results": [{"id": "asset-4", "upload_url": format!("{}/bucket/asset-4", server.url())}],
            })
            .to_string(),
        )
        .create_async()
        .await;
    let put = server
        .mock("PUT", "/bucket/asset-4")
        .match_header("content-type", "image/png")
        .match_body(body.clone())
        .with_status(200)
        .create_async()
        .await;

    let url = format!("{}/remote/cat.png", server.url());
    let results = client(&server.url())
        .with_upload_options(UploadOptions::default().with_url_mode(UrlUploadMode::Download))
        .upload_assets(&[AssetDescriptor::url("cat", &url).unwrap()], None)
        .await
        .unwrap();

    assert!(results[0].is_uploaded(), "{:?}", results[0]);
    source.assert_async().await;
    presign.assert_async().await;
    put.assert_async().await;
}

#[tokio::test]
async fn test_download_over_limit_not_staged() {
    let mut server = mockito::Server::new_async().await;
    let source = server
        .mock("GET", "/remote/large.jpg")
        .with_status(200)
        .with_body(vec![0xffu8; 64])
        .expect(1)
        .create_async()
        .await;
    let presign = server
        .mock("POST", "/curate/batch/assets/bulk/")
        .expect(0)
        .create_async()
        .await;

    let url = format!("{}/remote/large.jpg", server.url());
    let results = client(&server.url())
        .with_upload_options(
            UploadOptions::default()
                .with_url_mode(UrlUploadMode::Download)
                .with_asset_bytes_max(16),
        )
        .upload_assets(&[AssetDescriptor::url("large", &url).unwrap()], None)
        .await
        .unwrap();

    let failure = results[0].failure().unwrap();
    assert_eq!(failure.kind, FailureKind::LocalAsset);
    assert!(failure.message.contains("16 byte limit"), "{}", failure.message);
    source.assert_async().await;
    presign.assert_async().await;
}
