//! Balancer error types.
//!
//! BBB-surface errors map onto the XML error envelope with HTTP 200, per the
//! BBB convention; only transport-level faults use real 4xx/5xx codes.
//! Internal details are logged server-side and never leak into the message.

use crate::bbb::{xml, BbbError};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Balancer error type.
///
/// Variants named after the BBB `messageKey` values they produce.
#[derive(Debug, Error)]
pub enum LbError {
    /// Checksum rejection or unknown/disabled tenant.
    #[error("checksumError: {0}")]
    Checksum(String),

    /// Unknown meeting or recording.
    #[error("notFound: {0}")]
    NotFound(String),

    /// Scoped meeting ID too long, body too large.
    #[error("sizeError: {0}")]
    Size(String),

    /// Missing or unparseable request parameter.
    #[error("missing or invalid parameter: {0}")]
    MissingParameter(String),

    /// Malformed input.
    #[error("clientError: {0}")]
    Client(String),

    /// Reserved endpoint.
    #[error("notImplemented")]
    NotImplemented,

    /// No servers available or unexpected backend fault.
    #[error("internalError: {0}")]
    Internal(String),

    /// Database failure. Maps to internalError, details logged only.
    #[error("database error: {0}")]
    Database(String),

    /// A backend answered with a BBB error; surfaced verbatim.
    #[error(transparent)]
    Bbb(#[from] BbbError),
}

impl From<sqlx::Error> for LbError {
    fn from(err: sqlx::Error) -> Self {
        LbError::Database(err.to_string())
    }
}

impl LbError {
    /// The `messageKey` reported to the frontend.
    #[must_use]
    pub fn message_key(&self) -> String {
        match self {
            LbError::Checksum(_) => "checksumError".to_string(),
            LbError::NotFound(_) => "notFound".to_string(),
            LbError::Size(_) => "sizeError".to_string(),
            LbError::MissingParameter(name) => {
                let mut chars = name.chars();
                let capitalized = match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                };
                format!("missingParameter{capitalized}")
            }
            LbError::Client(_) => "clientError".to_string(),
            LbError::NotImplemented => "notImplemented".to_string(),
            LbError::Internal(_) | LbError::Database(_) => "internalError".to_string(),
            LbError::Bbb(BbbError::Api { message_key, .. }) => message_key.clone(),
            LbError::Bbb(_) => "internalError".to_string(),
        }
    }

    /// The `message` reported to the frontend. Internal detail is replaced
    /// by a generic message; the real error went to the logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            LbError::Checksum(msg)
            | LbError::NotFound(msg)
            | LbError::Size(msg)
            | LbError::Client(msg) => msg.clone(),
            LbError::MissingParameter(name) => {
                format!("Missing or invalid parameter {name}.")
            }
            LbError::NotImplemented => {
                "This API endpoint or feature is not implemented".to_string()
            }
            LbError::Internal(msg) => msg.clone(),
            LbError::Database(_) => "An internal error occurred".to_string(),
            LbError::Bbb(BbbError::Api { message, .. }) => message.clone(),
            LbError::Bbb(_) => "Backend request failed".to_string(),
        }
    }
}

/// Build an XML response with the BBB media type.
pub fn xml_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/xml;charset=utf-8")],
        body,
    )
        .into_response()
}

impl IntoResponse for LbError {
    fn into_response(self) -> Response {
        match &self {
            LbError::Database(detail) => {
                tracing::error!(target: "lb.database", error = %detail, "Database operation failed");
            }
            LbError::Bbb(BbbError::Transport(err)) => {
                tracing::error!(target: "lb.backend", error = %err, "Backend transport failure");
            }
            LbError::Bbb(BbbError::InvalidResponse(detail)) => {
                tracing::error!(target: "lb.backend", error = %detail, "Backend returned invalid XML");
            }
            _ => {}
        }

        // BBB convention: API-level failures are HTTP 200 with a FAILED
        // envelope. Oversized bodies keep their transport status.
        let status = match &self {
            LbError::Client(msg) if msg.contains("too large") => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::OK,
        };

        xml_response(
            status,
            xml::error_response(&self.message_key(), &self.public_message()),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_message_keys() {
        assert_eq!(
            LbError::Checksum("mismatch".to_string()).message_key(),
            "checksumError"
        );
        assert_eq!(
            LbError::NotFound("meeting".to_string()).message_key(),
            "notFound"
        );
        assert_eq!(LbError::NotImplemented.message_key(), "notImplemented");
        assert_eq!(
            LbError::Database("boom".to_string()).message_key(),
            "internalError"
        );
    }

    #[test]
    fn test_missing_parameter_key_is_capitalized() {
        let err = LbError::MissingParameter("meetingID".to_string());
        assert_eq!(err.message_key(), "missingParameterMeetingID");
        assert_eq!(err.public_message(), "Missing or invalid parameter meetingID.");
    }

    #[test]
    fn test_database_detail_not_leaked() {
        let err = LbError::Database("password=hunter2 rejected".to_string());
        assert_eq!(err.public_message(), "An internal error occurred");
    }

    #[test]
    fn test_bbb_api_error_passes_through() {
        let err = LbError::Bbb(BbbError::Api {
            message_key: "idNotUnique".to_string(),
            message: "A meeting already exists with that meeting ID.".to_string(),
        });
        assert_eq!(err.message_key(), "idNotUnique");
        assert!(err.public_message().contains("already exists"));
    }

    #[tokio::test]
    async fn test_into_response_is_http_200_xml() {
        use http_body_util::BodyExt;

        let response = LbError::Checksum("Checksum mismatch".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.starts_with("application/xml"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("<returncode>FAILED</returncode>"));
        assert!(body.contains("<messageKey>checksumError</messageKey>"));
    }
}
