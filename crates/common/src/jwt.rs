//! JWT helpers shared across bbblb crates.
//!
//! All tokens in the balancer are HS256: recording upload tokens (signed with
//! the global secret or a server secret selected by `kid`), and the
//! `signed_parameters` payloads that BBB callbacks carry (signed with a server
//! secret on the way in, re-signed with the tenant secret on the way out).
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only HS256 is accepted
//! - The `sub` claim is redacted in Debug output

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum allowed JWT size in bytes (8KB).
///
/// Oversized tokens are rejected before any base64 or signature work is done.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Errors from JWT parsing and verification.
///
/// Messages are generic; details go to debug logs only.
#[derive(Error, Debug)]
pub enum JwtError {
    /// Token size exceeds [`MAX_JWT_SIZE_BYTES`].
    #[error("token rejected")]
    TokenTooLarge,

    /// Token is not a structurally valid JWT.
    #[error("token rejected")]
    MalformedToken,

    /// Signature or claim verification failed.
    #[error("token rejected")]
    VerificationFailed,
}

/// Claims carried by recording upload tokens.
///
/// `scope` is space-separated, BBB-style (`"rec rec:upload"`).
#[derive(Clone, Serialize, Deserialize)]
pub struct UploadClaims {
    /// Subject (uploader identity) - redacted in Debug output.
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Space-separated scopes granted to this token.
    #[serde(default)]
    pub scope: String,

    /// Optional unique token id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl fmt::Debug for UploadClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadClaims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("scope", &self.scope)
            .field("jti", &self.jti)
            .finish()
    }
}

impl UploadClaims {
    /// Check if the token carries any of the given scopes.
    #[must_use]
    pub fn has_any_scope(&self, scopes: &[&str]) -> bool {
        self.scope
            .split_whitespace()
            .any(|s| scopes.contains(&s))
    }
}

/// Extract the `kid` (key ID) from a JWT header without verifying anything.
///
/// Used to pick the verification secret: a `kid` naming a known BBB server
/// selects that server's shared secret, no `kid` selects the global secret.
/// The token MUST still be verified with the selected secret afterwards.
///
/// # Errors
///
/// Returns `TokenTooLarge` for oversized input and `MalformedToken` when the
/// header cannot be decoded. A missing or empty `kid` is `Ok(None)`.
pub fn extract_kid(token: &str) -> Result<Option<String>, JwtError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtError::TokenTooLarge);
    }

    let mut parts = token.split('.');
    let header_part = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(_), Some(_), None) => header,
        _ => return Err(JwtError::MalformedToken),
    };

    let header_bytes = URL_SAFE_NO_PAD.decode(header_part).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT header base64");
        JwtError::MalformedToken
    })?;

    let header: serde_json::Value = serde_json::from_slice(&header_bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT header JSON");
        JwtError::MalformedToken
    })?;

    Ok(header
        .get("kid")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string))
}

/// Sign an arbitrary JSON payload as an HS256 token.
///
/// # Errors
///
/// Returns `MalformedToken` if the payload cannot be serialized.
pub fn sign_payload(payload: &serde_json::Value, secret: &str) -> Result<String, JwtError> {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        payload,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to sign payload");
        JwtError::MalformedToken
    })
}

/// Verify an HS256 token carrying an arbitrary JSON payload.
///
/// BBB callback payloads do not always carry `exp`; when present it is
/// enforced, when absent the token does not expire.
///
/// # Errors
///
/// Returns `VerificationFailed` on any signature or expiry mismatch.
pub fn verify_payload(token: &str, secret: &str) -> Result<serde_json::Value, JwtError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        return Err(JwtError::TokenTooLarge);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let data = jsonwebtoken::decode::<serde_json::Value>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Payload verification failed");
        JwtError::VerificationFailed
    })?;

    if let Some(exp) = data.claims.get("exp").and_then(serde_json::Value::as_i64) {
        if exp < chrono::Utc::now().timestamp() {
            tracing::debug!(target: "common.jwt", exp = exp, "Payload token expired");
            return Err(JwtError::VerificationFailed);
        }
    }

    Ok(data.claims)
}

/// Verify an HS256 token into typed claims. `exp` is required and enforced.
///
/// # Errors
///
/// Returns `VerificationFailed` on any signature, structure or expiry mismatch.
pub fn verify_claims<T: DeserializeOwned>(token: &str, secret: &str) -> Result<T, JwtError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        return Err(JwtError::TokenTooLarge);
    }

    let validation = Validation::new(Algorithm::HS256);

    jsonwebtoken::decode::<T>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Claims verification failed");
        JwtError::VerificationFailed
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_claims(exp_offset: i64, scope: &str) -> UploadClaims {
        UploadClaims {
            sub: "uploader".to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset,
            scope: scope.to_string(),
            jti: None,
        }
    }

    #[test]
    fn test_extract_kid_present() {
        let header = r#"{"alg":"HS256","typ":"JWT","kid":"bbb1.example.com"}"#;
        let header_b64 = URL_SAFE_NO_PAD.encode(header);
        let token = format!("{header_b64}.payload.signature");

        let kid = extract_kid(&token).unwrap();
        assert_eq!(kid.as_deref(), Some("bbb1.example.com"));
    }

    #[test]
    fn test_extract_kid_absent() {
        let header = r#"{"alg":"HS256","typ":"JWT"}"#;
        let header_b64 = URL_SAFE_NO_PAD.encode(header);
        let token = format!("{header_b64}.payload.signature");

        assert!(extract_kid(&token).unwrap().is_none());
    }

    #[test]
    fn test_extract_kid_empty_is_none() {
        let header = r#"{"alg":"HS256","kid":""}"#;
        let header_b64 = URL_SAFE_NO_PAD.encode(header);
        let token = format!("{header_b64}.payload.signature");

        assert!(extract_kid(&token).unwrap().is_none());
    }

    #[test]
    fn test_extract_kid_malformed() {
        assert!(matches!(
            extract_kid("not-a-jwt"),
            Err(JwtError::MalformedToken)
        ));
        assert!(matches!(
            extract_kid("a.b.c.d"),
            Err(JwtError::MalformedToken)
        ));
    }

    #[test]
    fn test_extract_kid_oversized() {
        let oversized = "a".repeat(MAX_JWT_SIZE_BYTES + 1);
        assert!(matches!(
            extract_kid(&oversized),
            Err(JwtError::TokenTooLarge)
        ));
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = json!({"meeting_id": "room-1", "record_id": "rec-1"});
        let token = sign_payload(&payload, "server-secret").unwrap();
        let verified = verify_payload(&token, "server-secret").unwrap();

        assert_eq!(verified["meeting_id"], "room-1");
        assert_eq!(verified["record_id"], "rec-1");
    }

    #[test]
    fn test_payload_wrong_secret() {
        let payload = json!({"meeting_id": "room-1"});
        let token = sign_payload(&payload, "server-secret").unwrap();

        assert!(matches!(
            verify_payload(&token, "other-secret"),
            Err(JwtError::VerificationFailed)
        ));
    }

    #[test]
    fn test_payload_expired() {
        let payload = json!({"meeting_id": "room-1", "exp": 1_000_000});
        let token = sign_payload(&payload, "secret").unwrap();

        assert!(matches!(
            verify_payload(&token, "secret"),
            Err(JwtError::VerificationFailed)
        ));
    }

    #[test]
    fn test_claims_round_trip() {
        let claims = make_claims(3600, "rec rec:upload");
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"global"),
        )
        .unwrap();

        let verified: UploadClaims = verify_claims(&token, "global").unwrap();
        assert_eq!(verified.sub, "uploader");
        assert!(verified.has_any_scope(&["rec", "bbb"]));
        assert!(!verified.has_any_scope(&["admin"]));
    }

    #[test]
    fn test_claims_expired() {
        let claims = make_claims(-3600, "rec");
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"global"),
        )
        .unwrap();

        assert!(matches!(
            verify_claims::<UploadClaims>(&token, "global"),
            Err(JwtError::VerificationFailed)
        ));
    }

    #[test]
    fn test_upload_claims_debug_redacts_sub() {
        let claims = make_claims(3600, "rec");
        let debug_str = format!("{claims:?}");

        assert!(!debug_str.contains("uploader"));
        assert!(debug_str.contains("[REDACTED]"));
    }
}
