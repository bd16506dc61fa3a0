//! Recordings repository.
//!
//! Recording rows are upserted by `record_id` during import and queried with
//! the getRecordings filter set. Disk placement lives in
//! `crate::recordings::storage`; the repository only covers database state.

use crate::errors::LbError;
use crate::models::{PlaybackFormat, Recording, RecordingState};
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::instrument;

#[derive(sqlx::FromRow)]
struct RecordingRow {
    id: i64,
    tenant_fk: Option<i64>,
    record_id: String,
    external_id: String,
    state: String,
    meta: Json<BTreeMap<String, String>>,
    started: DateTime<Utc>,
    ended: DateTime<Utc>,
    participants: i32,
}

impl From<RecordingRow> for Recording {
    fn from(row: RecordingRow) -> Self {
        Recording {
            id: row.id,
            tenant_fk: row.tenant_fk,
            record_id: row.record_id,
            external_id: row.external_id,
            state: RecordingState::from_db_str(&row.state),
            meta: row.meta.0,
            started: row.started,
            ended: row.ended,
            participants: row.participants,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FormatRow {
    id: i64,
    recording_fk: i64,
    format: String,
    xml: String,
}

impl From<FormatRow> for PlaybackFormat {
    fn from(row: FormatRow) -> Self {
        PlaybackFormat {
            id: row.id,
            recording_fk: row.recording_fk,
            format: row.format,
            xml: row.xml,
        }
    }
}

const RECORDING_COLUMNS: &str =
    "id, tenant_fk, record_id, external_id, state, meta, started, ended, participants";

/// Filters accepted by getRecordings.
///
/// Lists are already split and trimmed by the handler; empty lists mean
/// "no filter". Prefix and state lists are truncated to sane bounds.
#[derive(Debug, Default, Clone)]
pub struct RecordingFilter {
    pub external_ids: Vec<String>,
    pub record_id_prefixes: Vec<String>,
    pub states: Vec<String>,
    pub meta: BTreeMap<String, String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

/// Maximum number of recordID prefixes considered per query.
const MAX_RECORD_ID_PREFIXES: usize = 100;

/// Maximum number of state filters considered per query.
const MAX_STATE_FILTERS: usize = 5;

/// Repository for recording operations.
pub struct RecordingsRepository;

impl RecordingsRepository {
    /// Upsert a recording row by `record_id` inside the caller's transaction.
    ///
    /// Re-imports refresh the tenant binding, metadata and timestamps but
    /// keep the current publication state.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(record_id = %record_id))]
    #[expect(
        clippy::too_many_arguments,
        reason = "Represents all recording columns for the atomic upsert"
    )]
    pub async fn upsert(
        conn: &mut PgConnection,
        tenant_fk: i64,
        record_id: &str,
        external_id: &str,
        state: RecordingState,
        meta: &BTreeMap<String, String>,
        started: DateTime<Utc>,
        ended: DateTime<Utc>,
        participants: i32,
    ) -> Result<Recording, LbError> {
        let start = Instant::now();

        let query = format!(
            "INSERT INTO recordings \
                 (tenant_fk, record_id, external_id, state, meta, started, ended, participants) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (record_id) DO UPDATE SET \
                 tenant_fk = EXCLUDED.tenant_fk, \
                 external_id = EXCLUDED.external_id, \
                 meta = EXCLUDED.meta, \
                 started = EXCLUDED.started, \
                 ended = EXCLUDED.ended, \
                 participants = EXCLUDED.participants \
             RETURNING {RECORDING_COLUMNS}"
        );
        let row: Result<RecordingRow, sqlx::Error> = sqlx::query_as(&query)
            .bind(tenant_fk)
            .bind(record_id)
            .bind(external_id)
            .bind(state.as_db_str())
            .bind(Json(meta))
            .bind(started)
            .bind(ended)
            .bind(participants)
            .fetch_one(&mut *conn)
            .await;

        let status = if row.is_ok() { "success" } else { "error" };
        metrics::record_db_query("upsert_recording", status, start.elapsed());

        Ok(Recording::from(row?))
    }

    /// Upsert a playback format by `(recording, format)`.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(recording_id = recording_fk, format = %format))]
    pub async fn upsert_format(
        conn: &mut PgConnection,
        recording_fk: i64,
        format: &str,
        xml: &str,
    ) -> Result<(), LbError> {
        sqlx::query(
            "INSERT INTO playback_formats (recording_fk, format, xml) VALUES ($1, $2, $3) \
             ON CONFLICT (recording_fk, format) DO UPDATE SET xml = EXCLUDED.xml",
        )
        .bind(recording_fk)
        .bind(format)
        .bind(xml)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// List a tenant's recordings matching the filter, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(tenant_id = tenant_fk))]
    pub async fn list(
        pool: &PgPool,
        tenant_fk: i64,
        filter: &RecordingFilter,
        max_items: i64,
    ) -> Result<Vec<Recording>, LbError> {
        let start = Instant::now();

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {RECORDING_COLUMNS} FROM recordings WHERE tenant_fk = "
        ));
        qb.push_bind(tenant_fk);

        if !filter.external_ids.is_empty() {
            qb.push(" AND external_id = ANY(");
            qb.push_bind(&filter.external_ids);
            qb.push(")");
        }

        if !filter.record_id_prefixes.is_empty() {
            qb.push(" AND (");
            for (i, prefix) in filter
                .record_id_prefixes
                .iter()
                .take(MAX_RECORD_ID_PREFIXES)
                .enumerate()
            {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push("record_id LIKE ");
                qb.push_bind(format!("{}%", escape_like(prefix)));
                qb.push(" ESCAPE '\\'");
            }
            qb.push(")");
        }

        // 'any' is practically the same as no state filter: only
        // published|unpublished exist here.
        if !filter.states.is_empty() && !filter.states.iter().any(|s| s == "any") {
            let states: Vec<String> = filter.states.iter().take(MAX_STATE_FILTERS).cloned().collect();
            qb.push(" AND state = ANY(");
            qb.push_bind(states);
            qb.push(")");
        }

        for (key, value) in &filter.meta {
            qb.push(" AND meta->>");
            qb.push_bind(key);
            qb.push(" = ");
            qb.push_bind(value);
        }

        qb.push(" ORDER BY id");

        if let Some(offset) = filter.offset.filter(|o| (1..10_000_i64).contains(o)) {
            qb.push(" OFFSET ");
            qb.push_bind(offset);
        }
        let limit = filter
            .limit
            .filter(|l| *l > 0 && *l < max_items)
            .unwrap_or(max_items);
        qb.push(" LIMIT ");
        qb.push_bind(limit);

        let rows: Result<Vec<RecordingRow>, sqlx::Error> =
            qb.build_query_as().fetch_all(pool).await;

        let status = if rows.is_ok() { "success" } else { "error" };
        metrics::record_db_query("list_recordings", status, start.elapsed());

        Ok(rows?.into_iter().map(Recording::from).collect())
    }

    /// Fetch and lock a tenant's recordings by record ID for state changes.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(tenant_id = tenant_fk))]
    pub async fn find_for_update(
        conn: &mut PgConnection,
        tenant_fk: i64,
        record_ids: &[String],
    ) -> Result<Vec<Recording>, LbError> {
        let query = format!(
            "SELECT {RECORDING_COLUMNS} FROM recordings \
             WHERE tenant_fk = $1 AND record_id = ANY($2) FOR UPDATE"
        );
        let rows: Vec<RecordingRow> = sqlx::query_as(&query)
            .bind(tenant_fk)
            .bind(record_ids)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(Recording::from).collect())
    }

    /// Update the publication state of one recording.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(recording_id = id, state = state.as_db_str()))]
    pub async fn set_state(
        conn: &mut PgConnection,
        id: i64,
        state: RecordingState,
    ) -> Result<(), LbError> {
        sqlx::query("UPDATE recordings SET state = $2 WHERE id = $1")
            .bind(id)
            .bind(state.as_db_str())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Replace the metadata map of one recording.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(recording_id = id))]
    pub async fn update_meta(
        conn: &mut PgConnection,
        id: i64,
        meta: &BTreeMap<String, String>,
    ) -> Result<(), LbError> {
        sqlx::query("UPDATE recordings SET meta = $2 WHERE id = $1")
            .bind(id)
            .bind(Json(meta))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Delete a tenant's recordings by record ID. Returns the deleted rows'
    /// record IDs so disk cleanup can follow.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(tenant_id = tenant_fk))]
    pub async fn delete_by_record_ids(
        pool: &PgPool,
        tenant_fk: i64,
        record_ids: &[String],
    ) -> Result<u64, LbError> {
        let result = sqlx::query(
            "DELETE FROM recordings WHERE tenant_fk = $1 AND record_id = ANY($2)",
        )
        .bind(tenant_fk)
        .bind(record_ids)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// All playback formats of a recording.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(recording_id = recording_fk))]
    pub async fn formats_for(
        pool: &PgPool,
        recording_fk: i64,
    ) -> Result<Vec<PlaybackFormat>, LbError> {
        let rows: Vec<FormatRow> = sqlx::query_as(
            "SELECT id, recording_fk, format, xml FROM playback_formats \
             WHERE recording_fk = $1 ORDER BY format",
        )
        .bind(recording_fk)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(PlaybackFormat::from).collect())
    }

    /// Every recording in the database, for the orphan scan.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all)]
    pub async fn list_all(pool: &PgPool) -> Result<Vec<Recording>, LbError> {
        let query = format!("SELECT {RECORDING_COLUMNS} FROM recordings ORDER BY id");
        let rows: Vec<RecordingRow> = sqlx::query_as(&query).fetch_all(pool).await?;
        Ok(rows.into_iter().map(Recording::from).collect())
    }

    /// Delete one playback format row (orphan scan).
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    pub async fn delete_format(pool: &PgPool, id: i64) -> Result<(), LbError> {
        sqlx::query("DELETE FROM playback_formats WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Delete one recording row (orphan scan).
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    pub async fn delete_row(pool: &PgPool, id: i64) -> Result<(), LbError> {
        sqlx::query("DELETE FROM recordings WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// Escape `%`, `_` and `\` for use in a LIKE prefix pattern.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("plain"), "plain");
        assert_eq!(escape_like("50%_done"), "50\\%\\_done");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_filter_defaults_are_empty() {
        let filter = RecordingFilter::default();
        assert!(filter.external_ids.is_empty());
        assert!(filter.record_id_prefixes.is_empty());
        assert!(filter.states.is_empty());
        assert!(filter.meta.is_empty());
        assert!(filter.offset.is_none());
        assert!(filter.limit.is_none());
    }
}
