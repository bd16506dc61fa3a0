//! Recording upload endpoint.
//!
//! `POST /api/v1/recording/upload` accepts a tar stream with bearer-JWT
//! authorization. Tokens whose `kid` names a known server are verified with
//! that server's secret (the backend's post-publish hook pushes recordings
//! here); everything else verifies against the global secret and needs one
//! of the upload scopes.

use crate::repositories::ServersRepository;
use crate::routes::AppState;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use common::jwt::{extract_kid, verify_claims, verify_payload, UploadClaims};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::StreamReader;
use tracing::instrument;

/// Scopes that may upload recordings.
const UPLOAD_SCOPES: &[&str] = &["rec", "rec:upload", "bbb"];

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    /// Optional override of the tenant segment in the archive paths.
    pub tenant: Option<String>,
}

fn json_error(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        axum::Json(json!({ "error": error, "message": message })),
    )
        .into_response()
}

/// Resolve and verify the bearer token into upload claims.
///
/// Returns `None` for anything that should be answered with 401.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Option<UploadClaims> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?
        .strip_prefix("Bearer ")?
        .trim()
        .to_string();

    match extract_kid(&token).ok()? {
        Some(kid) => {
            // A server token: verified with that server's shared secret and
            // implicitly scoped to uploads.
            let server = ServersRepository::find_by_domain(&state.pool, &kid)
                .await
                .ok()??;
            let claims = verify_payload(&token, &server.secret).ok()?;
            Some(UploadClaims {
                sub: server.domain,
                exp: claims.get("exp").and_then(serde_json::Value::as_i64).unwrap_or(0),
                scope: "bbb".to_string(),
                jti: None,
            })
        }
        None => verify_claims::<UploadClaims>(&token, state.config.global_secret()).ok(),
    }
}

/// POST /api/v1/recording/upload
#[instrument(skip_all, name = "lb.api.upload")]
pub async fn recording_upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> Response {
    let headers = request.headers().clone();

    let Some(claims) = authorize(&state, &headers).await else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "Access denied",
            "This API is protected",
        );
    };
    if !claims.has_any_scope(UPLOAD_SCOPES) {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "Access denied",
            "This API is protected",
        );
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type != "application/x-tar" {
        let mut response = json_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported Media Type",
            &format!("Expected application/x-tar, got {content_type}"),
        );
        if let Ok(value) = "application/x-tar".parse() {
            response.headers_mut().insert("Accept-Post", value);
        }
        return response;
    }

    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);

    match state.importer.start_import(reader, query.tenant) {
        Ok(handle) => (
            StatusCode::ACCEPTED,
            axum::Json(json!({
                "message": "Import accepted",
                "importId": handle.import_id,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(target: "lb.api", error = %e, "Failed to accept import");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Import failed",
                "Could not accept the upload",
            )
        }
    }
}
