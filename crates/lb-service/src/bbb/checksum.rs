//! BBB request checksum computation and verification.
//!
//! The checksum is `hex(digest(action + queryString + secret))` where the
//! query string excludes the `checksum` parameter itself but keeps every
//! other parameter exactly as received. Verification therefore works on the
//! RAW query string and only parses parameters after the check passed.
//!
//! # Security
//!
//! - Digest comparison is constant-time
//! - Multiple accepted secrets support rotation; the first match wins
//! - SHA-1 is the BBB default; SHA-256 checksums (64 hex chars) are accepted

use super::params::Params;
use ring::digest;
use thiserror::Error;

/// Errors from inbound checksum verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("checksum parameter missing")]
    Missing,

    #[error("checksum has invalid format")]
    Malformed,

    #[error("checksum did not match")]
    Mismatch,
}

/// Compute the SHA-1 checksum for an outgoing request.
#[must_use]
pub fn checksum_for(action: &str, query: &str, secret: &str) -> String {
    let input = format!("{action}{query}{secret}");
    hex::encode(digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes()))
}

/// Verify and strip the checksum of an inbound query string.
///
/// Splits the `checksum` parameter out of `raw_query`, recomputes the digest
/// over the remaining query string for each candidate secret and compares in
/// constant time. On success the remaining query is parsed into [`Params`].
///
/// # Errors
///
/// - `Missing` when no `checksum` parameter is present
/// - `Malformed` when the checksum is not 40 or 64 hex characters
/// - `Mismatch` when no candidate secret produces the same digest
pub fn verify_checksum_query(
    action: &str,
    raw_query: &str,
    secrets: &[&str],
) -> Result<Params, ChecksumError> {
    let mut provided = None;
    let mut remaining = Vec::new();
    for pair in raw_query.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some(("checksum", value)) if provided.is_none() => provided = Some(value),
            _ => remaining.push(pair),
        }
    }

    let provided = provided.ok_or(ChecksumError::Missing)?;
    let provided = hex::decode(provided).map_err(|_| ChecksumError::Malformed)?;

    let algorithm = match provided.len() {
        20 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
        32 => &digest::SHA256,
        _ => return Err(ChecksumError::Malformed),
    };

    let query = remaining.join("&");
    for secret in secrets {
        let input = format!("{action}{query}{secret}");
        let computed = digest::digest(algorithm, input.as_bytes());
        if ring::constant_time::verify_slices_are_equal(computed.as_ref(), &provided).is_ok() {
            return Ok(Params::from_query(&query));
        }
    }

    Err(ChecksumError::Mismatch)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SECRET: &str = "bbb-shared-secret";

    fn signed_query(action: &str, query: &str, secret: &str) -> String {
        let checksum = checksum_for(action, query, secret);
        if query.is_empty() {
            format!("checksum={checksum}")
        } else {
            format!("{query}&checksum={checksum}")
        }
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let query = "meetingID=room-1&name=My+Room";
        let raw = signed_query("create", query, SECRET);

        let params = verify_checksum_query("create", &raw, &[SECRET]).unwrap();
        assert_eq!(params.get("meetingID"), Some("room-1"));
        assert_eq!(params.get("name"), Some("My Room"));
        assert!(!params.contains("checksum"));
    }

    #[test]
    fn test_checksum_position_does_not_matter() {
        let checksum = checksum_for("join", "a=1&b=2", SECRET);
        let raw = format!("a=1&checksum={checksum}&b=2");

        let params = verify_checksum_query("join", &raw, &[SECRET]).unwrap();
        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.get("b"), Some("2"));
    }

    #[test]
    fn test_empty_query() {
        let raw = signed_query("getMeetings", "", SECRET);
        let params = verify_checksum_query("getMeetings", &raw, &[SECRET]).unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn test_secret_rotation_accepts_any_listed_secret() {
        let raw = signed_query("create", "meetingID=m", "old-secret");
        let params = verify_checksum_query("create", &raw, &[SECRET, "old-secret"]);
        assert!(params.is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let raw = signed_query("create", "meetingID=m", "other-secret");
        assert_eq!(
            verify_checksum_query("create", &raw, &[SECRET]),
            Err(ChecksumError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_action_rejected() {
        let raw = signed_query("create", "meetingID=m", SECRET);
        assert_eq!(
            verify_checksum_query("join", &raw, &[SECRET]),
            Err(ChecksumError::Mismatch)
        );
    }

    #[test]
    fn test_tampered_query_rejected() {
        let raw = signed_query("create", "meetingID=m", SECRET);
        let tampered = raw.replace("meetingID=m", "meetingID=x");
        assert_eq!(
            verify_checksum_query("create", &tampered, &[SECRET]),
            Err(ChecksumError::Mismatch)
        );
    }

    #[test]
    fn test_missing_checksum() {
        assert_eq!(
            verify_checksum_query("create", "meetingID=m", &[SECRET]),
            Err(ChecksumError::Missing)
        );
    }

    #[test]
    fn test_malformed_checksum() {
        assert_eq!(
            verify_checksum_query("create", "meetingID=m&checksum=zz", &[SECRET]),
            Err(ChecksumError::Malformed)
        );
        assert_eq!(
            verify_checksum_query("create", "meetingID=m&checksum=abcd12", &[SECRET]),
            Err(ChecksumError::Malformed)
        );
    }

    #[test]
    fn test_sha256_checksum_accepted() {
        use ring::digest;
        let query = "meetingID=m";
        let input = format!("create{query}{SECRET}");
        let checksum = hex::encode(digest::digest(&digest::SHA256, input.as_bytes()));
        let raw = format!("{query}&checksum={checksum}");

        assert!(verify_checksum_query("create", &raw, &[SECRET]).is_ok());
    }
}
