//! Data models for the balancer.
//!
//! Domain structs mapped from database rows by the repositories, plus the
//! per-server health state machine driven by the poller.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Callback type for meeting-end interception.
pub const CALLBACK_TYPE_END: &str = "END";

/// Callback type for recording-ready notification.
pub const CALLBACK_TYPE_REC: &str = "REC";

/// Per-server health, as tracked by the poller.
///
/// New servers start OFFLINE and must pass health checks before they
/// receive traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerHealth {
    /// Healthy; receives new meetings.
    Available,
    /// Recently errored or still recovering; serves existing meetings only.
    Unstable,
    /// Considered gone; its meetings are forgotten.
    Offline,
}

impl ServerHealth {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ServerHealth::Available => "available",
            ServerHealth::Unstable => "unstable",
            ServerHealth::Offline => "offline",
        }
    }

    /// Parse from database string representation.
    #[must_use]
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "available" => ServerHealth::Available,
            "unstable" => ServerHealth::Unstable,
            _ => ServerHealth::Offline,
        }
    }
}

/// A backend BBB server.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: i64,
    pub domain: String,
    pub secret: String,
    pub enabled: bool,
    pub health: ServerHealth,
    pub errors: i32,
    pub recover: i32,
    pub load: f64,
}

impl Server {
    /// Base URL of the server's BBB API.
    #[must_use]
    pub fn api_base(&self) -> String {
        format!("https://{}/bigbluebutton/api", self.domain)
    }

    /// Record a failed poll. OFFLINE servers stay OFFLINE; anything else
    /// degrades to UNSTABLE and, after `poll_fail` consecutive errors, to
    /// OFFLINE. Any error resets recovery progress.
    pub fn mark_error(&mut self, poll_fail: i32) {
        if self.health == ServerHealth::Offline {
            return;
        }
        self.recover = 0;
        self.errors += 1;
        self.health = if self.errors >= poll_fail {
            ServerHealth::Offline
        } else {
            ServerHealth::Unstable
        };
    }

    /// Record a successful poll. AVAILABLE servers stay AVAILABLE; anything
    /// else climbs through UNSTABLE and becomes AVAILABLE after
    /// `poll_recover` prior successes.
    pub fn mark_success(&mut self, poll_recover: i32) {
        if self.health == ServerHealth::Available {
            return;
        }
        if self.recover < poll_recover {
            self.recover += 1;
            self.health = ServerHealth::Unstable;
        } else {
            self.errors = 0;
            self.recover = 0;
            self.health = ServerHealth::Available;
        }
    }
}

/// A frontend customer. Meetings are namespaced per tenant.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub realm: String,
    /// Newline-separated accepted secrets; the first one signs.
    pub secret: String,
    pub enabled: bool,
    /// Stored override map: parameter -> operator + operand.
    pub overrides: BTreeMap<String, String>,
}

impl Tenant {
    /// All accepted secrets, primary first. Multiple entries exist during
    /// secret rotation.
    #[must_use]
    pub fn secrets(&self) -> Vec<&str> {
        self.secret
            .split('\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// The primary secret, used for signing.
    #[must_use]
    pub fn primary_secret(&self) -> &str {
        self.secrets().first().copied().unwrap_or("")
    }
}

/// A meeting bound to exactly one tenant and one server.
///
/// The server binding is immutable; load-balancing decisions happen only at
/// creation time.
#[derive(Debug, Clone)]
pub struct Meeting {
    pub id: i64,
    /// External meeting ID, unscoped, as provided by the frontend.
    pub external_id: String,
    /// Internal ID assigned by the backend; null until the create succeeded.
    pub internal_id: Option<String>,
    /// Balancer-minted UUID used in callback URLs.
    pub uuid: Uuid,
    pub tenant_fk: i64,
    pub server_fk: i64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// An intercepted callback and its optional forward URL.
#[derive(Debug, Clone)]
pub struct Callback {
    pub id: i64,
    pub uuid: Uuid,
    pub kind: String,
    pub tenant_fk: i64,
    pub server_fk: i64,
    pub forward: Option<String>,
    pub created: DateTime<Utc>,
}

/// Recording publication state, realized as a directory layout on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Published,
    Unpublished,
}

impl RecordingState {
    #[must_use]
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RecordingState::Published => "published",
            RecordingState::Unpublished => "unpublished",
        }
    }

    #[must_use]
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "published" => RecordingState::Published,
            _ => RecordingState::Unpublished,
        }
    }
}

/// An imported recording. Outlives its meeting; survives tenant deletion
/// as an orphan.
#[derive(Debug, Clone)]
pub struct Recording {
    pub id: i64,
    pub tenant_fk: Option<i64>,
    pub record_id: String,
    /// Original, unscoped external meeting ID.
    pub external_id: String,
    pub state: RecordingState,
    pub meta: BTreeMap<String, String>,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    pub participants: i32,
}

/// A playback rendition of a recording, stored as static assets on disk.
#[derive(Debug, Clone)]
pub struct PlaybackFormat {
    pub id: i64,
    pub recording_fk: i64,
    pub format: String,
    /// The `<playback>` subtree from the recording's metadata.xml.
    pub xml: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn server(health: ServerHealth) -> Server {
        Server {
            id: 1,
            domain: "bbb1.example.com".to_string(),
            secret: "secret".to_string(),
            enabled: true,
            health,
            errors: 0,
            recover: 0,
            load: 0.0,
        }
    }

    #[test]
    fn test_health_db_round_trip() {
        for health in [
            ServerHealth::Available,
            ServerHealth::Unstable,
            ServerHealth::Offline,
        ] {
            assert_eq!(ServerHealth::from_db_str(health.as_db_str()), health);
        }
        assert_eq!(ServerHealth::from_db_str("bogus"), ServerHealth::Offline);
    }

    #[test]
    fn test_error_sequence_reaches_offline() {
        // With POLL_FAIL=3: [ok, err, err, err] goes
        // OFFLINE -> UNSTABLE -> UNSTABLE -> UNSTABLE -> OFFLINE.
        let mut s = server(ServerHealth::Offline);

        s.mark_success(2);
        assert_eq!(s.health, ServerHealth::Unstable);

        s.mark_error(3);
        assert_eq!(s.health, ServerHealth::Unstable);
        s.mark_error(3);
        assert_eq!(s.health, ServerHealth::Unstable);
        s.mark_error(3);
        assert_eq!(s.health, ServerHealth::Offline);
    }

    #[test]
    fn test_success_sequence_reaches_available() {
        // With POLL_RECOVER=2: [ok, ok, ok] goes
        // OFFLINE -> UNSTABLE -> UNSTABLE -> AVAILABLE.
        let mut s = server(ServerHealth::Offline);

        s.mark_success(2);
        assert_eq!(s.health, ServerHealth::Unstable);
        s.mark_success(2);
        assert_eq!(s.health, ServerHealth::Unstable);
        s.mark_success(2);
        assert_eq!(s.health, ServerHealth::Available);
        assert_eq!(s.errors, 0);
        assert_eq!(s.recover, 0);
    }

    #[test]
    fn test_offline_stays_offline_on_error() {
        let mut s = server(ServerHealth::Offline);
        s.mark_error(3);
        assert_eq!(s.health, ServerHealth::Offline);
        assert_eq!(s.errors, 0);
    }

    #[test]
    fn test_available_stays_available_on_success() {
        let mut s = server(ServerHealth::Available);
        s.mark_success(2);
        assert_eq!(s.health, ServerHealth::Available);
    }

    #[test]
    fn test_error_resets_recovery_progress() {
        let mut s = server(ServerHealth::Offline);
        s.mark_success(2);
        s.mark_success(2);
        assert_eq!(s.recover, 2);

        s.mark_error(3);
        assert_eq!(s.recover, 0);
        assert_eq!(s.health, ServerHealth::Unstable);

        // Recovery starts over.
        s.mark_success(2);
        assert_eq!(s.health, ServerHealth::Unstable);
    }

    #[test]
    fn test_available_implies_clean_counters() {
        let mut s = server(ServerHealth::Offline);
        s.mark_error(3);
        s.mark_success(2);
        s.mark_success(2);
        s.mark_success(2);

        // The invariant: AVAILABLE => errors == 0 && recover == 0.
        while s.health != ServerHealth::Available {
            s.mark_success(2);
        }
        assert_eq!(s.errors, 0);
        assert_eq!(s.recover, 0);
    }

    #[test]
    fn test_tenant_secret_rotation() {
        let tenant = Tenant {
            id: 1,
            name: "t1".to_string(),
            realm: "t1.example.com".to_string(),
            secret: "new-secret\nold-secret".to_string(),
            enabled: true,
            overrides: BTreeMap::new(),
        };

        assert_eq!(tenant.secrets(), vec!["new-secret", "old-secret"]);
        assert_eq!(tenant.primary_secret(), "new-secret");
    }

    #[test]
    fn test_api_base() {
        assert_eq!(
            server(ServerHealth::Available).api_base(),
            "https://bbb1.example.com/bigbluebutton/api"
        );
    }
}
