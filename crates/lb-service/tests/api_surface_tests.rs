//! Router-level tests for the HTTP surfaces that do not need a database.
//!
//! Uses a lazily-connecting pool: handlers under test either never touch it
//! or fail before they would.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use lb_service::config::Config;
use lb_service::recordings::importer::RecordingImporter;
use lb_service::recordings::storage::RecordingStorage;
use lb_service::routes::{build_routes, AppState};
use lb_service::services::Webhooks;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const GLOBAL_SECRET: &str = "0123456789abcdef0123456789abcdef";

fn test_state(storage_dir: &std::path::Path) -> AppState {
    let vars = HashMap::from([
        ("BBBLB_DOMAIN".to_string(), "lb.example.com".to_string()),
        ("BBBLB_SECRET".to_string(), GLOBAL_SECRET.to_string()),
        (
            "BBBLB_DB_URI".to_string(),
            "postgresql://localhost/unused".to_string(),
        ),
        (
            "BBBLB_RECORDING_PATH".to_string(),
            storage_dir.to_string_lossy().into_owned(),
        ),
    ]);
    let config = Config::from_vars(&vars).unwrap();

    let pool = PgPoolOptions::new()
        .connect_lazy("postgresql://localhost/unused")
        .unwrap();
    let http = reqwest::Client::new();
    let cancel = CancellationToken::new();
    let webhooks = Webhooks::new(http.clone(), config.webhook_retry, cancel.child_token());
    let storage = Arc::new(RecordingStorage::new(config.recording_path.clone()));
    let importer = Arc::new(RecordingImporter::new(
        pool.clone(),
        Arc::clone(&storage),
        webhooks.clone(),
        config.recording_threads,
        cancel,
    ));

    AppState {
        pool,
        config,
        http,
        importer,
        webhooks,
        metrics: None,
    }
}

async fn body_string(body: Body) -> String {
    let bytes = body.collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn upload_token(scope: &str) -> String {
    #[derive(serde::Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        exp: i64,
        scope: &'a str,
    }
    encode(
        &Header::new(Algorithm::HS256),
        &Claims {
            sub: "test-uploader",
            exp: chrono::Utc::now().timestamp() + 3600,
            scope,
        },
        &EncodingKey::from_secret(GLOBAL_SECRET.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_index_reports_version() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_routes(test_state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/bigbluebutton/api")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("application/xml"));

    let body = body_string(response.into_body()).await;
    assert!(body.contains("<returncode>SUCCESS</returncode>"));
    assert!(body.contains("<version>2.0</version>"));
}

#[tokio::test]
async fn test_get_join_url_is_not_implemented() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_routes(test_state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/bigbluebutton/api/getJoinUrl")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // BBB convention: failures are HTTP 200 with a FAILED envelope.
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response.into_body()).await;
    assert!(body.contains("<messageKey>notImplemented</messageKey>"));
}

#[tokio::test]
async fn test_text_track_endpoints_are_not_implemented() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    for (uri, method) in [
        ("/bigbluebutton/api/getRecordingTextTracks", "GET"),
        ("/bigbluebutton/api/putRecordingTextTrack", "POST"),
    ] {
        let response = build_routes(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_string(response.into_body()).await;
        assert!(body.contains("notImplemented"), "{uri} should be reserved");
    }
}

#[tokio::test]
async fn test_callback_end_rejects_bad_signature() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_routes(test_state(dir.path()));

    let uuid = uuid::Uuid::new_v4();
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/callback/{uuid}/end/{}", "ab".repeat(32)))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_string(response.into_body()).await;
    assert!(body.contains("signature check failed"));
}

#[tokio::test]
async fn test_upload_requires_authorization() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_routes(test_state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/recording/upload")
                .header(header::CONTENT_TYPE, "application/x-tar")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_upload_rejects_insufficient_scope() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_routes(test_state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/recording/upload")
                .header(header::AUTHORIZATION, format!("Bearer {}", upload_token("other")))
                .header(header::CONTENT_TYPE, "application/x-tar")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_upload_rejects_wrong_content_type() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_routes(test_state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/recording/upload")
                .header(header::AUTHORIZATION, format!("Bearer {}", upload_token("rec")))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(
        response.headers().get("Accept-Post").unwrap(),
        "application/x-tar"
    );
}

#[tokio::test]
async fn test_upload_accepts_tar_stream() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_routes(test_state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/recording/upload?tenant=t1")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", upload_token("rec:upload")),
                )
                .header(header::CONTENT_TYPE, "application/x-tar")
                .body(Body::from(vec![0u8; 1024]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_string(response.into_body()).await;
    assert!(body.contains("importId"));
}
