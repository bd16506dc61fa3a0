//! Recording storage and import pipeline.
//!
//! Disk layout under `RECORDING_PATH`:
//!
//! ```text
//! {tenant}/{recordId}/{format}/...               published
//! {tenant}/{recordId}/unpublished/{format}/...   unpublished
//! .staging/{importId}/...                        in-flight imports
//! ```
//!
//! Publish/unpublish and import placement are directory renames; nothing is
//! ever copied, and a crash mid-import leaves only discarded staging data.

pub mod importer;
pub mod storage;

use crate::errors::LbError;
use crate::repositories::RecordingsRepository;
use sqlx::PgPool;
use storage::RecordingStorage;

pub use importer::{ImportHandle, RecordingImporter};

/// Reconcile recording rows against the on-disk tree.
///
/// Playback formats with no backing directory are deleted; recordings left
/// with zero formats (or no tenant to locate them under) follow. Returns
/// `(formats_removed, recordings_removed)`.
///
/// # Errors
///
/// Returns `LbError::Database` on database failures.
pub async fn remove_orphans(
    pool: &PgPool,
    storage: &RecordingStorage,
) -> Result<(u64, u64), LbError> {
    let mut formats_removed = 0u64;
    let mut recordings_removed = 0u64;

    for recording in RecordingsRepository::list_all(pool).await? {
        let tenant_name = match recording.tenant_fk {
            Some(tenant_fk) => crate::repositories::TenantsRepository::get(pool, tenant_fk)
                .await?
                .map(|t| t.name),
            None => None,
        };

        let Some(tenant_name) = tenant_name else {
            // Orphaned by tenant deletion; its directories are unreachable.
            tracing::info!(
                target: "lb.recordings",
                record_id = %recording.record_id,
                "Deleting recording without tenant"
            );
            RecordingsRepository::delete_row(pool, recording.id).await?;
            recordings_removed += 1;
            continue;
        };

        let mut populated = false;
        for format in RecordingsRepository::formats_for(pool, recording.id).await? {
            if storage.format_exists(&tenant_name, &recording.record_id, &format.format) {
                populated = true;
                continue;
            }
            tracing::info!(
                target: "lb.recordings",
                record_id = %recording.record_id,
                format = %format.format,
                "Deleting orphan playback format"
            );
            RecordingsRepository::delete_format(pool, format.id).await?;
            formats_removed += 1;
        }

        if !populated {
            tracing::info!(
                target: "lb.recordings",
                record_id = %recording.record_id,
                "Deleting recording without formats"
            );
            RecordingsRepository::delete_row(pool, recording.id).await?;
            recordings_removed += 1;
        }
    }

    Ok((formats_removed, recordings_removed))
}
