//! Recording import pipeline.
//!
//! Accepts a tar byte stream whose entry paths have the shape
//! `{tenant}/{recordId}/{format}/...`, stages the contents next to the
//! storage tree, then per recording: upserts the database rows, renames the
//! staged format directories into place and fires pending recording-ready
//! callbacks. Work runs on a worker pool bounded by `RECORDING_THREADS`.

use crate::bbb::{split_scope, xml};
use crate::errors::LbError;
use crate::models::{RecordingState, CALLBACK_TYPE_REC};
use crate::observability::metrics;
use crate::recordings::storage::{safe_segment, RecordingStorage};
use crate::repositories::{CallbacksRepository, RecordingsRepository, TenantsRepository};
use crate::services::webhooks::{resign_payload, Webhooks};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Outcome of a finished import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub recordings: usize,
    pub formats: usize,
}

/// Handle returned by [`RecordingImporter::start_import`].
///
/// The receiver resolves when the import finished; callers that only need
/// the accepted import id may drop it.
pub struct ImportHandle {
    pub import_id: Uuid,
    pub done: oneshot::Receiver<Result<ImportSummary, String>>,
}

/// The tar import worker pool.
pub struct RecordingImporter {
    pool: PgPool,
    storage: Arc<RecordingStorage>,
    webhooks: Webhooks,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl RecordingImporter {
    #[must_use]
    pub fn new(
        pool: PgPool,
        storage: Arc<RecordingStorage>,
        webhooks: Webhooks,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            storage,
            webhooks,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<RecordingStorage> {
        &self.storage
    }

    /// Accept a tar stream for import. Returns as soon as the work is queued.
    ///
    /// `force_tenant` overrides the first path segment of every entry.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Internal` when staging cannot be created or the
    /// importer is shutting down.
    pub fn start_import<R>(
        &self,
        reader: R,
        force_tenant: Option<String>,
    ) -> Result<ImportHandle, LbError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.cancel.is_cancelled() || self.tracker.is_closed() {
            return Err(LbError::Internal("importer is shutting down".to_string()));
        }

        let import_id = Uuid::new_v4();
        let staging = self
            .storage
            .create_staging(&import_id.to_string())
            .map_err(|e| LbError::Internal(format!("failed to create staging: {e}")))?;

        let (done_tx, done_rx) = oneshot::channel();
        let pool = self.pool.clone();
        let storage = Arc::clone(&self.storage);
        let webhooks = self.webhooks.clone();
        let semaphore = Arc::clone(&self.semaphore);

        self.tracker.spawn(async move {
            let started = Instant::now();
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    run_import(&pool, &storage, &webhooks, &staging, reader, force_tenant).await
                }
                Err(_) => Err("importer is shutting down".to_string()),
            };
            storage.discard_staging(&import_id.to_string());

            match &result {
                Ok(summary) => {
                    metrics::record_import("success", started.elapsed());
                    tracing::info!(
                        target: "lb.import",
                        import_id = %import_id,
                        recordings = summary.recordings,
                        formats = summary.formats,
                        "Import finished"
                    );
                }
                Err(e) => {
                    metrics::record_import("error", started.elapsed());
                    tracing::error!(
                        target: "lb.import",
                        import_id = %import_id,
                        error = %e,
                        "Import failed"
                    );
                }
            }
            let _ = done_tx.send(result);
        });

        Ok(ImportHandle {
            import_id,
            done: done_rx,
        })
    }

    /// Publish or unpublish a recording's directories on a blocking thread.
    ///
    /// # Errors
    ///
    /// Returns the underlying `io::Error`; `NotFound` means the recording
    /// exists in the database but not on disk.
    pub async fn set_published(
        &self,
        tenant: &str,
        record_id: &str,
        publish: bool,
    ) -> std::io::Result<()> {
        let storage = Arc::clone(&self.storage);
        let tenant = tenant.to_string();
        let record_id = record_id.to_string();
        tokio::task::spawn_blocking(move || {
            if publish {
                storage.publish(&tenant, &record_id)
            } else {
                storage.unpublish(&tenant, &record_id)
            }
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?
    }

    /// Remove a recording's directories in the background.
    pub fn spawn_delete(&self, tenant: String, record_id: String) {
        let storage = Arc::clone(&self.storage);
        self.tracker.spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || storage.delete(&tenant, &record_id)).await;
            if let Ok(Err(e)) = result {
                tracing::warn!(
                    target: "lb.recordings",
                    error = %e,
                    "Failed to delete recording directories"
                );
            }
        });
    }

    /// Drain in-flight imports, bounded by `timeout`. No new work accepted.
    pub async fn shutdown(&self, timeout: std::time::Duration) {
        self.tracker.close();
        self.semaphore.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                target: "lb.import",
                "Imports still running at shutdown, abandoning"
            );
        }
    }
}

/// The body of one import task.
async fn run_import<R>(
    pool: &PgPool,
    storage: &Arc<RecordingStorage>,
    webhooks: &Webhooks,
    staging: &Path,
    reader: R,
    force_tenant: Option<String>,
) -> Result<ImportSummary, String>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    // Stream the tar on a blocking thread; the bridge pulls from the async
    // byte stream as the archive reader consumes it.
    let staging_owned = staging.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || {
        extract_tar(SyncIoBridge::new(reader), &staging_owned, force_tenant.as_deref())
    })
    .await
    .map_err(|e| format!("import worker panicked: {e}"))??;

    if entries.is_empty() {
        return Err("archive contained no recording files".to_string());
    }

    // Group staged formats per recording.
    let mut recordings: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for (tenant, record_id, format) in entries {
        recordings.entry((tenant, record_id)).or_default().push(format);
    }

    let mut summary = ImportSummary {
        recordings: 0,
        formats: 0,
    };
    let mut errors: Vec<String> = Vec::new();

    for ((tenant_name, record_id), formats) in recordings {
        match finalize_recording(pool, storage, webhooks, staging, &tenant_name, &record_id, &formats)
            .await
        {
            Ok(count) => {
                summary.recordings += 1;
                summary.formats += count;
            }
            Err(e) => {
                tracing::error!(
                    target: "lb.import",
                    tenant = %tenant_name,
                    record_id = %record_id,
                    error = %e,
                    "Failed to import recording"
                );
                errors.push(format!("{tenant_name}/{record_id}: {e}"));
            }
        }
    }

    if errors.is_empty() {
        Ok(summary)
    } else {
        Err(errors.join("; "))
    }
}

/// Unpack the archive into the staging directory.
///
/// Returns the set of `(tenant, recordId, format)` triples that received at
/// least one file. Entries with unsafe path segments fail the import.
fn extract_tar<R: Read>(
    reader: R,
    staging: &Path,
    force_tenant: Option<&str>,
) -> Result<BTreeSet<(String, String, String)>, String> {
    let mut archive = tar::Archive::new(reader);
    let mut seen = BTreeSet::new();

    let entries = archive.entries().map_err(|e| format!("invalid tar: {e}"))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| format!("invalid tar entry: {e}"))?;

        let entry_type = entry.header().entry_type();
        if !entry_type.is_file() && !entry_type.is_dir() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| format!("invalid entry path: {e}"))?
            .into_owned();
        let mut segments: Vec<String> = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(seg) => {
                    segments.push(seg.to_string_lossy().into_owned());
                }
                Component::CurDir => {}
                _ => return Err(format!("unsafe entry path: {}", path.display())),
            }
        }

        let mut iter = segments.into_iter();
        let tenant = match (force_tenant, iter.next()) {
            (Some(forced), Some(_)) => forced.to_string(),
            (Some(forced), None) => forced.to_string(),
            (None, Some(seg)) => seg,
            (None, None) => continue,
        };
        let Some(record_id) = iter.next() else { continue };
        let Some(format) = iter.next() else { continue };
        let rest: Vec<String> = iter.collect();

        if !safe_segment(&tenant) || !safe_segment(&record_id) || !safe_segment(&format) {
            return Err(format!("unsafe entry path: {}", path.display()));
        }
        if rest.iter().any(|seg| seg == ".." || seg.is_empty()) {
            return Err(format!("unsafe entry path: {}", path.display()));
        }

        let mut dest = staging.join(&tenant).join(&record_id).join(&format);
        for seg in &rest {
            dest.push(seg);
        }

        if entry_type.is_dir() {
            std::fs::create_dir_all(&dest).map_err(|e| format!("mkdir failed: {e}"))?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("mkdir failed: {e}"))?;
        }
        entry
            .unpack(&dest)
            .map_err(|e| format!("unpack failed: {e}"))?;
        seen.insert((tenant, record_id, format));
    }

    Ok(seen)
}

/// Metadata parsed from a format's `metadata.xml`.
#[derive(Debug, Clone)]
struct ParsedMetadata {
    external_id: String,
    started: DateTime<Utc>,
    ended: DateTime<Utc>,
    participants: i32,
    meta: BTreeMap<String, String>,
    playback_xml: String,
}

fn parse_metadata(content: &str, record_id: &str, tenant_name: &str) -> ParsedMetadata {
    let meta: BTreeMap<String, String> =
        xml::child_text_map(content, &["meta"]).into_iter().collect();

    // The backend recorded the scoped meeting ID (create forwards it that
    // way); the stored external_id is always unscoped, like Meeting rows.
    let external_id = xml::find_attr(content, &["meeting"], "externalId")
        .or_else(|| meta.get("meetingId").cloned())
        .map(|id| match split_scope(&id) {
            Some((unscoped, scope)) if scope == tenant_name => unscoped.to_string(),
            _ => id,
        })
        .unwrap_or_else(|| record_id.to_string());

    let parse_ms = |path: &[&str]| {
        xml::find_text(content, path)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    };
    let started = parse_ms(&["start_time"]).unwrap_or_else(Utc::now);
    let ended = parse_ms(&["end_time"]).unwrap_or(started);

    let participants = xml::find_text(content, &["participants"])
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);

    let playback_xml = xml::extract_elements(content, "playback")
        .ok()
        .and_then(|mut elements| {
            if elements.is_empty() {
                None
            } else {
                Some(elements.swap_remove(0))
            }
        })
        .unwrap_or_else(|| "<playback/>".to_string());

    ParsedMetadata {
        external_id,
        started,
        ended,
        participants,
        meta,
        playback_xml,
    }
}

/// Upsert one recording, move its staged formats into place and fire any
/// pending recording-ready callbacks.
async fn finalize_recording(
    pool: &PgPool,
    storage: &Arc<RecordingStorage>,
    webhooks: &Webhooks,
    staging: &Path,
    tenant_name: &str,
    record_id: &str,
    formats: &[String],
) -> Result<usize, String> {
    let tenant = TenantsRepository::find_by_name(pool, tenant_name)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("unknown tenant {tenant_name:?}"))?;

    // Per-format metadata; the first parseable one provides recording-level
    // attributes.
    let mut parsed: BTreeMap<String, ParsedMetadata> = BTreeMap::new();
    for format in formats {
        let metadata_path = staging
            .join(tenant_name)
            .join(record_id)
            .join(format)
            .join("metadata.xml");
        let content = std::fs::read_to_string(&metadata_path)
            .map_err(|e| format!("missing metadata.xml for format {format:?}: {e}"))?;
        parsed.insert(
            format.clone(),
            parse_metadata(&content, record_id, tenant_name),
        );
    }
    let head = parsed
        .values()
        .next()
        .ok_or_else(|| "no formats to import".to_string())?
        .clone();

    let mut tx = pool.begin().await.map_err(|e| e.to_string())?;

    let recording = RecordingsRepository::upsert(
        &mut tx,
        tenant.id,
        record_id,
        &head.external_id,
        RecordingState::Published,
        &head.meta,
        head.started,
        head.ended,
        head.participants,
    )
    .await
    .map_err(|e| e.to_string())?;

    for (format, metadata) in &parsed {
        RecordingsRepository::upsert_format(&mut tx, recording.id, format, &metadata.playback_xml)
            .await
            .map_err(|e| e.to_string())?;
    }

    // Place directories before committing; a failed rename rolls the
    // database back and leaves only discarded staging data.
    {
        let storage = Arc::clone(storage);
        let staging = staging.to_path_buf();
        let tenant_name = tenant_name.to_string();
        let record_id = record_id.to_string();
        let formats: Vec<String> = parsed.keys().cloned().collect();
        let state = recording.state;
        tokio::task::spawn_blocking(move || {
            for format in &formats {
                let staged = staging.join(&tenant_name).join(&record_id).join(format);
                storage.install_format(&staged, &tenant_name, &record_id, format, state)?;
            }
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(|e| format!("install worker panicked: {e}"))?
        .map_err(|e| format!("failed to install formats: {e}"))?;
    }

    tx.commit().await.map_err(|e| e.to_string())?;

    fire_rec_callbacks(pool, webhooks, &tenant, &head, record_id).await;

    Ok(parsed.len())
}

/// Fire recording-ready callbacks registered for the origin meeting.
async fn fire_rec_callbacks(
    pool: &PgPool,
    webhooks: &Webhooks,
    tenant: &crate::models::Tenant,
    metadata: &ParsedMetadata,
    record_id: &str,
) {
    let Some(uuid) = metadata
        .meta
        .get("bbblb-uuid")
        .and_then(|v| Uuid::parse_str(v).ok())
    else {
        return;
    };

    let callbacks = match CallbacksRepository::find_by_uuid_and_kind(pool, uuid, CALLBACK_TYPE_REC)
        .await
    {
        Ok(callbacks) => callbacks,
        Err(e) => {
            tracing::warn!(
                target: "lb.import",
                uuid = %uuid,
                error = %e,
                "Failed to look up recording-ready callbacks"
            );
            return;
        }
    };

    let payload = serde_json::json!({
        "meeting_id": metadata.external_id,
        "record_id": record_id,
    });

    for callback in callbacks {
        let Some(forward) = callback.forward.clone() else {
            continue;
        };
        match resign_payload(&payload, tenant.primary_secret()) {
            Ok(jwt) => {
                webhooks.spawn_signed_post(pool.clone(), callback.id, forward, jwt);
            }
            Err(e) => {
                tracing::warn!(
                    target: "lb.import",
                    uuid = %uuid,
                    error = %e,
                    "Failed to sign recording-ready payload"
                );
            }
        }
    }
}
