//! Meetings repository.
//!
//! The create path serializes on `SELECT ... FOR UPDATE` and falls back to
//! get-or-create on the `(external_id, tenant_fk)` unique pair: a concurrent
//! loser re-reads and adopts the winner's row, server binding included.

use crate::errors::LbError;
use crate::models::Meeting;
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct MeetingRow {
    id: i64,
    external_id: String,
    internal_id: Option<String>,
    uuid: Uuid,
    tenant_fk: i64,
    server_fk: i64,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
}

impl From<MeetingRow> for Meeting {
    fn from(row: MeetingRow) -> Self {
        Meeting {
            id: row.id,
            external_id: row.external_id,
            internal_id: row.internal_id,
            uuid: row.uuid,
            tenant_fk: row.tenant_fk,
            server_fk: row.server_fk,
            created: row.created,
            modified: row.modified,
        }
    }
}

const MEETING_COLUMNS: &str =
    "id, external_id, internal_id, uuid, tenant_fk, server_fk, created, modified";

/// Repository for meeting operations.
pub struct MeetingsRepository;

impl MeetingsRepository {
    /// Find a meeting by `(tenant, external_id)` with a row lock.
    ///
    /// Serializes concurrent creates for the same meeting.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(tenant_id = tenant_fk, external_id = %external_id))]
    pub async fn find_for_update(
        conn: &mut PgConnection,
        tenant_fk: i64,
        external_id: &str,
    ) -> Result<Option<Meeting>, LbError> {
        let query = format!(
            "SELECT {MEETING_COLUMNS} FROM meetings \
             WHERE tenant_fk = $1 AND external_id = $2 FOR UPDATE"
        );
        let row: Option<MeetingRow> = sqlx::query_as(&query)
            .bind(tenant_fk)
            .bind(external_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(Meeting::from))
    }

    /// Find a meeting of a tenant by internal OR external meeting ID.
    ///
    /// The BBB API accepts either form in `meetingID`.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(tenant_id = tenant_fk))]
    pub async fn find_by_any_id(
        pool: &PgPool,
        tenant_fk: i64,
        meeting_id: &str,
    ) -> Result<Option<Meeting>, LbError> {
        let query = format!(
            "SELECT {MEETING_COLUMNS} FROM meetings \
             WHERE tenant_fk = $1 AND (external_id = $2 OR internal_id = $2) LIMIT 1"
        );
        let row: Option<MeetingRow> = sqlx::query_as(&query)
            .bind(tenant_fk)
            .bind(meeting_id)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(Meeting::from))
    }

    /// Find a meeting by its balancer-minted uuid.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(uuid = %uuid))]
    pub async fn find_by_uuid(pool: &PgPool, uuid: Uuid) -> Result<Option<Meeting>, LbError> {
        let query = format!("SELECT {MEETING_COLUMNS} FROM meetings WHERE uuid = $1");
        let row: Option<MeetingRow> = sqlx::query_as(&query)
            .bind(uuid)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(Meeting::from))
    }

    /// Get-or-create a meeting row inside the caller's transaction.
    ///
    /// Returns the row and whether it was freshly created. A unique-violation
    /// is not an error: the concurrent winner's row is re-read and returned.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` when even the fallback read fails to
    /// produce a row.
    #[instrument(skip_all, fields(tenant_id = tenant_fk, external_id = %external_id))]
    pub async fn get_or_create(
        conn: &mut PgConnection,
        tenant_fk: i64,
        server_fk: i64,
        external_id: &str,
        uuid: Uuid,
    ) -> Result<(Meeting, bool), LbError> {
        let start = Instant::now();

        let insert = format!(
            "INSERT INTO meetings (external_id, uuid, tenant_fk, server_fk) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (external_id, tenant_fk) DO NOTHING \
             RETURNING {MEETING_COLUMNS}"
        );
        let inserted: Option<MeetingRow> = sqlx::query_as(&insert)
            .bind(external_id)
            .bind(uuid)
            .bind(tenant_fk)
            .bind(server_fk)
            .fetch_optional(&mut *conn)
            .await?;

        if let Some(row) = inserted {
            metrics::record_db_query("create_meeting", "success", start.elapsed());
            return Ok((Meeting::from(row), true));
        }

        // Lost the race: the winner's row must exist now.
        let select = format!(
            "SELECT {MEETING_COLUMNS} FROM meetings WHERE tenant_fk = $1 AND external_id = $2"
        );
        let row: Option<MeetingRow> = sqlx::query_as(&select)
            .bind(tenant_fk)
            .bind(external_id)
            .fetch_optional(&mut *conn)
            .await?;

        metrics::record_db_query("create_meeting", "success", start.elapsed());

        match row {
            Some(row) => Ok((Meeting::from(row), false)),
            None => Err(LbError::Database(
                "meeting vanished between conflicting insert and re-read".to_string(),
            )),
        }
    }

    /// Record the backend-assigned internal meeting ID.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(meeting_id = id))]
    pub async fn set_internal_id(
        pool: &PgPool,
        id: i64,
        internal_id: &str,
    ) -> Result<(), LbError> {
        sqlx::query("UPDATE meetings SET internal_id = $2, modified = now() WHERE id = $1")
            .bind(id)
            .bind(internal_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Forget a meeting. Callbacks are not fired here; interception already
    /// handled or will handle them.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(meeting_id = id))]
    pub async fn delete(pool: &PgPool, id: i64) -> Result<(), LbError> {
        sqlx::query("DELETE FROM meetings WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// All meetings bound to a server.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(server_id = server_fk))]
    pub async fn for_server(pool: &PgPool, server_fk: i64) -> Result<Vec<Meeting>, LbError> {
        let query = format!("SELECT {MEETING_COLUMNS} FROM meetings WHERE server_fk = $1");
        let rows: Vec<MeetingRow> = sqlx::query_as(&query)
            .bind(server_fk)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(Meeting::from).collect())
    }

    /// Delete this server's meetings whose internal ID is known but not in
    /// the live set. Rows with a null internal ID are kept; their create
    /// call may still be in flight.
    ///
    /// Returns the number of forgotten meetings.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(server_id = server_fk))]
    pub async fn delete_missing(
        conn: &mut PgConnection,
        server_fk: i64,
        live_internal_ids: &[String],
    ) -> Result<u64, LbError> {
        let start = Instant::now();

        let result = sqlx::query(
            "DELETE FROM meetings \
             WHERE server_fk = $1 AND internal_id IS NOT NULL \
               AND internal_id <> ALL($2)",
        )
        .bind(server_fk)
        .bind(live_internal_ids)
        .execute(&mut *conn)
        .await;

        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_db_query("delete_missing_meetings", status, start.elapsed());

        Ok(result?.rows_affected())
    }

    /// Forget every meeting bound to a server. Used when a server goes
    /// OFFLINE and its meetings become zombies.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(server_id = server_fk))]
    pub async fn delete_all_for_server(
        conn: &mut PgConnection,
        server_fk: i64,
    ) -> Result<u64, LbError> {
        let result = sqlx::query("DELETE FROM meetings WHERE server_fk = $1")
            .bind(server_fk)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Purge meetings that never obtained an internal ID within `max_age`.
    ///
    /// Their backend create evidently never succeeded.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all)]
    pub async fn delete_stale_unconfirmed(
        pool: &PgPool,
        max_age: chrono::Duration,
    ) -> Result<u64, LbError> {
        let cutoff = Utc::now() - max_age;
        let result = sqlx::query(
            "DELETE FROM meetings WHERE internal_id IS NULL AND created < $1",
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
