//! Signed HTTP client for backend BBB servers.
//!
//! Serializes parameters in insertion order, appends the SHA-1 checksum and
//! parses the XML response envelope. Streaming request bodies (insertDocument,
//! create with pre-uploaded slides) and JSON responses are supported.

use super::checksum::checksum_for;
use super::params::Params;
use super::xml;
use std::time::Duration;
use thiserror::Error;

/// Error from a backend BBB call.
#[derive(Debug, Error)]
pub enum BbbError {
    /// The backend answered with `returncode=FAILED`.
    #[error("{message_key}: {message}")]
    Api {
        message_key: String,
        message: String,
    },

    /// The request never produced a usable response.
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend answered with something that is not a BBB envelope.
    #[error("backend returned invalid XML: {0}")]
    InvalidResponse(String),
}

/// A parsed BBB XML response envelope.
///
/// The full body is kept so callers can rewrite and forward it verbatim.
#[derive(Debug, Clone)]
pub struct BbbResponse {
    pub body: String,
    pub returncode: Option<String>,
    pub message_key: Option<String>,
    pub message: Option<String>,
}

impl BbbResponse {
    /// Parse a response body.
    ///
    /// # Errors
    ///
    /// Returns `InvalidResponse` when no `returncode` element is present.
    pub fn parse(body: String) -> Result<Self, BbbError> {
        let returncode = xml::find_text(&body, &["returncode"]);
        if returncode.is_none() {
            return Err(BbbError::InvalidResponse(
                "missing returncode element".to_string(),
            ));
        }
        let message_key = xml::find_text(&body, &["messageKey"]);
        let message = xml::find_text(&body, &["message"]);
        Ok(Self {
            body,
            returncode,
            message_key,
            message,
        })
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.returncode.as_deref() == Some("SUCCESS")
    }

    /// The error message key, when the call failed.
    #[must_use]
    pub fn error_key(&self) -> Option<&str> {
        if self.success() {
            None
        } else {
            self.message_key.as_deref()
        }
    }

    /// Convenience lookup into the response body.
    #[must_use]
    pub fn find_text(&self, path: &[&str]) -> Option<String> {
        xml::find_text(&self.body, path)
    }

    /// Turn a FAILED response into a [`BbbError::Api`].
    ///
    /// # Errors
    ///
    /// Returns `Api` carrying the backend's `messageKey` and `message`.
    pub fn raise_on_error(self) -> Result<Self, BbbError> {
        if self.success() {
            Ok(self)
        } else {
            Err(BbbError::Api {
                message_key: self
                    .message_key
                    .unwrap_or_else(|| "internalError".to_string()),
                message: self.message.unwrap_or_default(),
            })
        }
    }
}

/// Low-level client for one backend server.
///
/// Cheap to construct per call; the underlying `reqwest::Client` pool is
/// shared across all of them.
#[derive(Clone)]
pub struct BbbClient {
    http: reqwest::Client,
    api_base: String,
    secret: String,
    timeout: Option<Duration>,
}

impl BbbClient {
    /// Create a client for `api_base` (e.g. `https://bbb1.example.com/bigbluebutton/api`).
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        secret: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        let mut api_base = api_base.into();
        while api_base.ends_with('/') {
            api_base.pop();
        }
        Self {
            http,
            api_base,
            secret: secret.into(),
            timeout,
        }
    }

    /// The signed URL for `action`, usable as a redirect target.
    #[must_use]
    pub fn url_for(&self, action: &str, params: &Params) -> String {
        let query = params.to_query_string();
        let checksum = checksum_for(action, &query, &self.secret);
        if query.is_empty() {
            format!("{}/{}?checksum={}", self.api_base, action, checksum)
        } else {
            format!("{}/{}?{}&checksum={}", self.api_base, action, query, checksum)
        }
    }

    /// Issue a GET call and parse the XML envelope.
    ///
    /// # Errors
    ///
    /// `Transport` for connection-level failures, `InvalidResponse` for
    /// bodies that are not a BBB envelope. A FAILED returncode is NOT an
    /// error here; use [`BbbResponse::raise_on_error`].
    pub async fn action(&self, action: &str, params: &Params) -> Result<BbbResponse, BbbError> {
        let mut request = self.http.get(self.url_for(action, params));
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let body = request.send().await?.text().await?;
        BbbResponse::parse(body)
    }

    /// Issue a POST call with a request body and parse the XML envelope.
    ///
    /// No timeout is applied; bodies may be large and slow.
    ///
    /// # Errors
    ///
    /// See [`BbbClient::action`].
    pub async fn action_with_body(
        &self,
        action: &str,
        params: &Params,
        body: reqwest::Body,
        content_type: Option<&str>,
    ) -> Result<BbbResponse, BbbError> {
        let mut request = self.http.post(self.url_for(action, params)).body(body);
        if let Some(ctype) = content_type {
            request = request.header("Content-Type", ctype);
        }
        let body = request.send().await?.text().await?;
        BbbResponse::parse(body)
    }

    /// Issue a POST call and pass the JSON response through.
    ///
    /// Used for endpoints that answer JSON instead of XML (insertDocument).
    ///
    /// # Errors
    ///
    /// `Transport` for connection-level or JSON decode failures.
    pub async fn action_json(
        &self,
        action: &str,
        params: &Params,
        body: reqwest::Body,
        content_type: Option<&str>,
    ) -> Result<serde_json::Value, BbbError> {
        let mut request = self.http.post(self.url_for(action, params)).body(body);
        if let Some(ctype) = content_type {
            request = request.header("Content-Type", ctype);
        }
        Ok(request.send().await?.json().await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bbb::checksum::verify_checksum_query;

    fn client() -> BbbClient {
        BbbClient::new(
            reqwest::Client::new(),
            "https://bbb1.example.com/bigbluebutton/api/",
            "server-secret",
            None,
        )
    }

    #[test]
    fn test_url_for_is_verifiable() {
        let mut params = Params::new();
        params.set("meetingID", "t1:room");
        params.set("fullName", "Alice Example");

        let url = client().url_for("join", &params);
        let (base, query) = url.split_once('?').unwrap();
        assert_eq!(base, "https://bbb1.example.com/bigbluebutton/api/join");

        let verified = verify_checksum_query("join", query, &["server-secret"]).unwrap();
        assert_eq!(verified.get("meetingID"), Some("t1:room"));
        assert_eq!(verified.get("fullName"), Some("Alice Example"));
    }

    #[test]
    fn test_url_for_empty_params() {
        let url = client().url_for("getMeetings", &Params::new());
        let (_, query) = url.split_once('?').unwrap();
        assert!(verify_checksum_query("getMeetings", query, &["server-secret"]).is_ok());
    }

    #[test]
    fn test_parse_success_response() {
        let body = "<response><returncode>SUCCESS</returncode>\
                    <internalMeetingID>abc-123</internalMeetingID></response>";
        let response = BbbResponse::parse(body.to_string()).unwrap();

        assert!(response.success());
        assert_eq!(response.error_key(), None);
        assert_eq!(
            response.find_text(&["internalMeetingID"]).as_deref(),
            Some("abc-123")
        );
        assert!(response.raise_on_error().is_ok());
    }

    #[test]
    fn test_parse_failed_response() {
        let body = "<response><returncode>FAILED</returncode>\
                    <messageKey>notFound</messageKey>\
                    <message>Meeting not found</message></response>";
        let response = BbbResponse::parse(body.to_string()).unwrap();

        assert!(!response.success());
        assert_eq!(response.error_key(), Some("notFound"));

        let err = response.raise_on_error().unwrap_err();
        assert!(matches!(err, BbbError::Api { message_key, .. } if message_key == "notFound"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            BbbResponse::parse("<html>not bbb</html>".to_string()),
            Err(BbbError::InvalidResponse(_))
        ));
    }
}
