//! Best-effort webhook forwarding.
//!
//! Intercepted callbacks are forwarded to the frontend asynchronously: each
//! forward runs as a supervised task on a shared tracker, retries up to
//! `WEBHOOK_RETRY` times with linear backoff (10s, 20s, ...) and dies with
//! the service on shutdown. Permanent failure only logs.

use crate::errors::LbError;
use crate::observability::metrics;
use crate::repositories::CallbacksRepository;
use ring::hmac;
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Compute the hex HMAC-SHA256 signature protecting an END callback URL.
///
/// The signed string is `bbblb:callback:end:{uuid}`; the key is the global
/// balancer secret. The backend calls the URL as-is, so the signature is the
/// only thing standing between the open internet and ending a meeting.
#[must_use]
pub fn end_callback_signature(secret: &str, uuid: &Uuid) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, format!("bbblb:callback:end:{uuid}").as_bytes());
    hex::encode(tag.as_ref())
}

/// Constant-time verification of an END callback signature.
#[must_use]
pub fn verify_end_callback_signature(secret: &str, uuid: &Uuid, sig_hex: &str) -> bool {
    let Ok(provided) = hex::decode(sig_hex) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, format!("bbblb:callback:end:{uuid}").as_bytes(), &provided).is_ok()
}

/// Handle for spawning supervised webhook forwards.
#[derive(Clone)]
pub struct Webhooks {
    http: reqwest::Client,
    retry: u32,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Webhooks {
    #[must_use]
    pub fn new(http: reqwest::Client, retry: u32, cancel: CancellationToken) -> Self {
        Self {
            http,
            retry,
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Fire-and-forget GET forward, passing the query parameters through.
    pub fn spawn_get(&self, url: String, query: Vec<(String, String)>) {
        let http = self.http.clone();
        let retry = self.retry;
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            trigger(retry, &cancel, || http.get(&url).query(&query)).await;
        });
    }

    /// Forward a re-signed JWT payload, then consume the callback row.
    ///
    /// The row is deleted after the attempts regardless of outcome; a dead
    /// frontend does not keep callbacks alive forever.
    pub fn spawn_signed_post(&self, pool: PgPool, callback_id: i64, url: String, jwt: String) {
        let http = self.http.clone();
        let retry = self.retry;
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let form = [("signed_parameters", jwt)];
            trigger(retry, &cancel, || http.post(&url).form(&form)).await;
            if let Err(e) = CallbacksRepository::delete(&pool, callback_id).await {
                tracing::warn!(
                    target: "lb.webhooks",
                    callback_id = callback_id,
                    error = %e,
                    "Failed to delete fired callback"
                );
            }
        });
    }

    /// Stop accepting new forwards and wait for in-flight ones, bounded.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                target: "lb.webhooks",
                "Webhook forwards still pending at shutdown, abandoning"
            );
        }
    }
}

/// Run one forward with bounded retries and linear backoff.
///
/// Returns whether any attempt succeeded.
async fn trigger<F>(retry: u32, cancel: &CancellationToken, build: F) -> bool
where
    F: Fn() -> reqwest::RequestBuilder,
{
    for attempt in 0..retry.max(1) {
        let backoff = Duration::from_secs(u64::from(attempt) * 10);
        if !backoff.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = cancel.cancelled() => return false,
            }
        }

        let outcome = tokio::select! {
            result = build().send() => result,
            () = cancel.cancelled() => return false,
        };

        match outcome.and_then(reqwest::Response::error_for_status) {
            Ok(_) => {
                metrics::record_webhook("success");
                return true;
            }
            Err(e) => {
                metrics::record_webhook("error");
                tracing::warn!(
                    target: "lb.webhooks",
                    error = %e,
                    attempt = attempt + 1,
                    max_attempts = retry,
                    "Failed to forward callback"
                );
            }
        }
    }
    false
}

/// Build the JWT a REC or proxied callback carries towards the frontend.
///
/// # Errors
///
/// Returns `LbError::Internal` when signing fails (never in practice).
pub fn resign_payload(payload: &serde_json::Value, tenant_secret: &str) -> Result<String, LbError> {
    common::jwt::sign_payload(payload, tenant_secret)
        .map_err(|e| LbError::Internal(format!("failed to sign callback payload: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_end_signature_round_trip() {
        let uuid = Uuid::new_v4();
        let sig = end_callback_signature("global-secret", &uuid);

        assert_eq!(sig.len(), 64);
        assert!(verify_end_callback_signature("global-secret", &uuid, &sig));
        assert!(!verify_end_callback_signature("other-secret", &uuid, &sig));
        assert!(!verify_end_callback_signature(
            "global-secret",
            &Uuid::new_v4(),
            &sig
        ));
    }

    #[test]
    fn test_signature_rejects_garbage() {
        let uuid = Uuid::new_v4();
        assert!(!verify_end_callback_signature("secret", &uuid, "not-hex"));
        assert!(!verify_end_callback_signature("secret", &uuid, ""));
        assert!(!verify_end_callback_signature("secret", &uuid, "abcd"));
    }

    #[test]
    fn test_signature_matches_known_construction() {
        // The signed string is exactly "bbblb:callback:end:" + uuid.
        let uuid = Uuid::nil();
        let sig = end_callback_signature("k", &uuid);

        let key = hmac::Key::new(hmac::HMAC_SHA256, b"k");
        let expected = hmac::sign(
            &key,
            b"bbblb:callback:end:00000000-0000-0000-0000-000000000000",
        );
        assert_eq!(sig, hex::encode(expected.as_ref()));
    }

    #[tokio::test]
    async fn test_trigger_gives_up_after_retries() {
        let http = reqwest::Client::new();
        let cancel = CancellationToken::new();
        // Unroutable per RFC 5737; connection fails fast enough with retry=1.
        let ok = trigger(1, &cancel, || {
            http.get("http://192.0.2.1:9/cb").timeout(Duration::from_millis(200))
        })
        .await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_trigger_respects_cancellation() {
        let http = reqwest::Client::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Second attempt would sleep 10s; cancellation returns immediately.
        let started = std::time::Instant::now();
        let ok = trigger(3, &cancel, || {
            http.get("http://192.0.2.1:9/cb").timeout(Duration::from_millis(200))
        })
        .await;
        assert!(!ok);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
