//! Distributed lease on a database row.
//!
//! A lease is a named, expiring, owner-tagged lock: presence of the row
//! implies held, absence implies free. The poller uses it to stay a
//! cluster-wide singleton. Holders must call [`Lease::check`] on every
//! iteration to refresh the timestamp and confirm ownership; a row whose
//! timestamp falls behind `force_after` may be broken by anyone.

use crate::errors::LbError;
use crate::observability::metrics;
use sqlx::PgPool;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::instrument;

static OWNER_ID: OnceLock<String> = OnceLock::new();

/// Process-lifetime-stable owner identifier: hostname, pid and a random
/// token, so restarted processes never collide with their former selves.
pub fn owner_id() -> &'static str {
    OWNER_ID.get_or_init(|| {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        let token: u32 = rand::random();
        format!("{hostname}-{}-{token:08x}", std::process::id())
    })
}

/// A handle on one named lease.
#[derive(Clone)]
pub struct Lease {
    pool: PgPool,
    pub name: String,
    /// Staleness threshold: rows older than this may be force-broken.
    pub timeout: Duration,
}

impl Lease {
    #[must_use]
    pub fn new(pool: PgPool, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            name: name.into(),
            timeout,
        }
    }

    /// Try to take the lease. In one transaction, any stale row is deleted
    /// and an insert is attempted; the lease is ours iff the insert stuck.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(lease = %self.name))]
    pub async fn try_acquire(&self) -> Result<bool, LbError> {
        let start = Instant::now();

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM leases WHERE name = $1 AND ts < now() - make_interval(secs => $2)")
            .bind(&self.name)
            .bind(self.timeout.as_secs_f64())
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO leases (name, owner, ts) VALUES ($1, $2, now()) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(&self.name)
        .bind(owner_id())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        tx.commit().await?;

        metrics::record_db_query("lease_try_acquire", "success", start.elapsed());

        if inserted {
            tracing::info!(
                target: "lb.lease",
                lease = %self.name,
                owner = owner_id(),
                "Lease acquired"
            );
        }
        Ok(inserted)
    }

    /// Refresh the timestamp and confirm we still hold the lease.
    ///
    /// Callers must abort their protected work when this returns false.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(lease = %self.name))]
    pub async fn check(&self) -> Result<bool, LbError> {
        let held = sqlx::query("UPDATE leases SET ts = now() WHERE name = $1 AND owner = $2")
            .bind(&self.name)
            .bind(owner_id())
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0;
        Ok(held)
    }

    /// Release the lease if we hold it. Releasing a lease someone else took
    /// over is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(lease = %self.name))]
    pub async fn try_release(&self) -> Result<(), LbError> {
        let released = sqlx::query("DELETE FROM leases WHERE name = $1 AND owner = $2")
            .bind(&self.name)
            .bind(owner_id())
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0;
        if released {
            tracing::info!(
                target: "lb.lease",
                lease = %self.name,
                "Lease released"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_id_is_stable_and_unique_per_process() {
        let a = owner_id();
        let b = owner_id();
        assert_eq!(a, b);
        assert!(a.contains(&std::process::id().to_string()));
    }
}
