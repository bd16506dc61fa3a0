//! Callbacks repository.
//!
//! Callback rows remember intercepted backend callbacks and their original
//! forward URLs. END callbacks are consumed-once; REC and custom-typed
//! callbacks may exist several times per meeting uuid.

use crate::errors::LbError;
use crate::models::{Callback, CALLBACK_TYPE_END};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::instrument;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct CallbackRow {
    id: i64,
    uuid: Uuid,
    kind: String,
    tenant_fk: i64,
    server_fk: i64,
    forward: Option<String>,
    created: DateTime<Utc>,
}

impl From<CallbackRow> for Callback {
    fn from(row: CallbackRow) -> Self {
        Callback {
            id: row.id,
            uuid: row.uuid,
            kind: row.kind,
            tenant_fk: row.tenant_fk,
            server_fk: row.server_fk,
            forward: row.forward,
            created: row.created,
        }
    }
}

const CALLBACK_COLUMNS: &str = "id, uuid, kind, tenant_fk, server_fk, forward, created";

/// Repository for callback operations.
pub struct CallbacksRepository;

impl CallbacksRepository {
    /// Persist an intercepted callback inside the caller's transaction.
    ///
    /// For END callbacks, a concurrent duplicate insert is a no-op: exactly
    /// one active END callback exists per meeting uuid.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(uuid = %uuid, kind = %kind))]
    pub async fn insert(
        conn: &mut PgConnection,
        uuid: Uuid,
        kind: &str,
        tenant_fk: i64,
        server_fk: i64,
        forward: Option<&str>,
    ) -> Result<(), LbError> {
        let query = if kind == CALLBACK_TYPE_END {
            "INSERT INTO callbacks (uuid, kind, tenant_fk, server_fk, forward) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (uuid) WHERE kind = 'END' DO NOTHING"
        } else {
            "INSERT INTO callbacks (uuid, kind, tenant_fk, server_fk, forward) \
             VALUES ($1, $2, $3, $4, $5)"
        };
        sqlx::query(query)
            .bind(uuid)
            .bind(kind)
            .bind(tenant_fk)
            .bind(server_fk)
            .bind(forward)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// All callbacks registered for `(uuid, kind)`.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(uuid = %uuid, kind = %kind))]
    pub async fn find_by_uuid_and_kind(
        pool: &PgPool,
        uuid: Uuid,
        kind: &str,
    ) -> Result<Vec<Callback>, LbError> {
        let query = format!(
            "SELECT {CALLBACK_COLUMNS} FROM callbacks WHERE uuid = $1 AND kind = $2"
        );
        let rows: Vec<CallbackRow> = sqlx::query_as(&query)
            .bind(uuid)
            .bind(kind)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(Callback::from).collect())
    }

    /// Delete a callback after it fired.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(callback_id = id))]
    pub async fn delete(pool: &PgPool, id: i64) -> Result<(), LbError> {
        sqlx::query("DELETE FROM callbacks WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Delete every callback belonging to a meeting uuid.
    ///
    /// Used by the create compensation path when the backend call failed.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(uuid = %uuid))]
    pub async fn delete_by_uuid(pool: &PgPool, uuid: Uuid) -> Result<(), LbError> {
        sqlx::query("DELETE FROM callbacks WHERE uuid = $1")
            .bind(uuid)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Purge callbacks older than the cutoff. Their meeting is long gone and
    /// the forward will never fire.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all)]
    pub async fn delete_older_than(
        pool: &PgPool,
        max_age: chrono::Duration,
    ) -> Result<u64, LbError> {
        let cutoff = Utc::now() - max_age;
        let result = sqlx::query("DELETE FROM callbacks WHERE created < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
