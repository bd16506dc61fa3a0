//! Balancer configuration.
//!
//! Configuration is loaded from `BBBLB_`-prefixed environment variables into
//! a declared record: every key has a parser and a default, and unknown
//! `BBBLB_*` keys are rejected at load time. Sensitive fields are redacted
//! in Debug output.

use common::secret::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for all configuration keys.
pub const ENV_PREFIX: &str = "BBBLB_";

/// Minimum length of the global HMAC secret in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// The full set of accepted configuration keys (without prefix).
const KNOWN_KEYS: &[&str] = &[
    "DOMAIN",
    "SECRET",
    "DB_URI",
    "BIND_ADDRESS",
    "TENANT_HEADER",
    "MAX_BODY",
    "MAX_ITEMS",
    "WEBHOOK_RETRY",
    "POLL_INTERVAL",
    "POLL_FAIL",
    "POLL_RECOVER",
    "LOAD_BASE",
    "LOAD_USER",
    "LOAD_VIDEO",
    "LOAD_VOICE",
    "LOAD_PENALTY",
    "LOAD_COOLDOWN",
    "LOADFACTOR_INITIAL",
    "LOADFACTOR_MEETING",
    "LOADFACTOR_SIZE",
    "RECORDING_PATH",
    "RECORDING_THREADS",
    "REQUEST_TIMEOUT",
    "DEBUG",
];

/// Balancer configuration.
///
/// Loaded from `BBBLB_*` environment variables with sensible defaults.
/// The global secret and database URI are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Public domain of this balancer, used to build callback URLs.
    pub domain: String,

    /// Global HMAC key for callback signatures and upload tokens.
    pub secret: SecretString,

    /// PostgreSQL connection URI.
    pub db_uri: String,

    /// HTTP bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Header carrying the tenant realm (default: "X-Tenant-Realm").
    pub tenant_header: String,

    /// Maximum accepted request body size in bytes for buffered reads.
    pub max_body: usize,

    /// Pagination cap for getRecordings.
    pub max_items: i64,

    /// Webhook forward attempts before giving up.
    pub webhook_retry: u32,

    /// Poller loop interval in seconds.
    pub poll_interval: u64,

    /// Consecutive poll errors before a server goes OFFLINE.
    pub poll_fail: i32,

    /// Consecutive poll successes before a server recovers to AVAILABLE.
    pub poll_recover: i32,

    /// Load added per running meeting.
    pub load_base: f64,

    /// Load added per participant.
    pub load_user: f64,

    /// Load added per video stream.
    pub load_video: f64,

    /// Load added per voice participant.
    pub load_voice: f64,

    /// Anticipated-growth penalty for young meetings.
    pub load_penalty: f64,

    /// Minutes over which the penalty decays to zero.
    pub load_cooldown: u64,

    /// Load bump applied once when a meeting is placed on a server.
    pub loadfactor_initial: f64,

    /// Load bump applied per create call for an existing meeting slot.
    pub loadfactor_meeting: f64,

    /// Load bump applied per join call.
    pub loadfactor_size: f64,

    /// Root directory of the recording storage tree.
    pub recording_path: PathBuf,

    /// Concurrent recording import workers.
    pub recording_threads: usize,

    /// Timeout in seconds for control-plane backend calls.
    pub request_timeout: u64,

    /// Enable verbose request logging.
    pub debug: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("domain", &self.domain)
            .field("secret", &"[REDACTED]")
            .field("db_uri", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field("tenant_header", &self.tenant_header)
            .field("max_body", &self.max_body)
            .field("max_items", &self.max_items)
            .field("webhook_retry", &self.webhook_retry)
            .field("poll_interval", &self.poll_interval)
            .field("poll_fail", &self.poll_fail)
            .field("poll_recover", &self.poll_recover)
            .field("recording_path", &self.recording_path)
            .field("recording_threads", &self.recording_threads)
            .field("request_timeout", &self.request_timeout)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {ENV_PREFIX}{0}")]
    MissingEnvVar(&'static str),

    #[error("Unknown config parameter: {0}")]
    UnknownKey(String),

    #[error("Invalid value for {ENV_PREFIX}{key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.into(),
    }
}

fn parse<T>(vars: &HashMap<String, String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| invalid(key, format!("could not parse {raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn parse_bool(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if ["1", "true", "yes", "on"].contains(&v.as_str()) => Ok(true),
        Some(v) if ["0", "false", "no", "off", ""].contains(&v.as_str()) => Ok(false),
        Some(v) => Err(invalid(key, format!("expected a boolean, got {v:?}"))),
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when required keys are missing, values do not
    /// parse, or an unknown `BBBLB_*` variable is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a map of environment variables (for testing).
    ///
    /// Only `BBBLB_*` entries are considered; anything else in the map is
    /// ignored so the full process environment can be passed in.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(ENV_PREFIX)
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect();

        if let Some(unknown) = vars.keys().find(|k| !KNOWN_KEYS.contains(&k.as_str())) {
            return Err(ConfigError::UnknownKey(format!("{ENV_PREFIX}{unknown}")));
        }

        let domain = vars
            .get("DOMAIN")
            .cloned()
            .ok_or(ConfigError::MissingEnvVar("DOMAIN"))?;

        let secret = vars
            .get("SECRET")
            .cloned()
            .ok_or(ConfigError::MissingEnvVar("SECRET"))?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(invalid(
                "SECRET",
                format!("must be at least {MIN_SECRET_LEN} characters"),
            ));
        }

        let db_uri = vars
            .get("DB_URI")
            .cloned()
            .ok_or(ConfigError::MissingEnvVar("DB_URI"))?;

        let poll_interval = parse(&vars, "POLL_INTERVAL", 30)?;
        if poll_interval == 0 {
            return Err(invalid("POLL_INTERVAL", "must be greater than 0"));
        }

        let recording_threads = parse(&vars, "RECORDING_THREADS", 4)?;
        if recording_threads == 0 {
            return Err(invalid("RECORDING_THREADS", "must be greater than 0"));
        }

        let max_items = parse(&vars, "MAX_ITEMS", 100)?;
        if max_items <= 0 {
            return Err(invalid("MAX_ITEMS", "must be greater than 0"));
        }

        Ok(Config {
            domain,
            secret: SecretString::from(secret),
            db_uri,
            bind_address: vars
                .get("BIND_ADDRESS")
                .cloned()
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            tenant_header: vars
                .get("TENANT_HEADER")
                .cloned()
                .unwrap_or_else(|| "X-Tenant-Realm".to_string()),
            max_body: parse(&vars, "MAX_BODY", 1024 * 1024)?,
            max_items,
            webhook_retry: parse(&vars, "WEBHOOK_RETRY", 5)?,
            poll_interval,
            poll_fail: parse(&vars, "POLL_FAIL", 3)?,
            poll_recover: parse(&vars, "POLL_RECOVER", 2)?,
            load_base: parse(&vars, "LOAD_BASE", 1.0)?,
            load_user: parse(&vars, "LOAD_USER", 0.05)?,
            load_video: parse(&vars, "LOAD_VIDEO", 0.2)?,
            load_voice: parse(&vars, "LOAD_VOICE", 0.1)?,
            load_penalty: parse(&vars, "LOAD_PENALTY", 10.0)?,
            load_cooldown: parse(&vars, "LOAD_COOLDOWN", 15)?,
            loadfactor_initial: parse(&vars, "LOADFACTOR_INITIAL", 10.0)?,
            loadfactor_meeting: parse(&vars, "LOADFACTOR_MEETING", 1.0)?,
            loadfactor_size: parse(&vars, "LOADFACTOR_SIZE", 0.1)?,
            recording_path: PathBuf::from(
                vars.get("RECORDING_PATH")
                    .cloned()
                    .unwrap_or_else(|| "./recordings".to_string()),
            ),
            recording_threads,
            request_timeout: parse(&vars, "REQUEST_TIMEOUT", 10)?,
            debug: parse_bool(&vars, "DEBUG", false)?,
        })
    }

    /// Poller loop interval as a `Duration`.
    #[must_use]
    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Penalty decay window in seconds.
    #[must_use]
    pub fn load_cooldown_secs(&self) -> f64 {
        (self.load_cooldown * 60) as f64
    }

    /// The global secret as a plain str, for signing.
    #[must_use]
    pub fn global_secret(&self) -> &str {
        self.secret.expose_secret()
    }
}
