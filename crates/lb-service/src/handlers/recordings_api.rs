//! Recording management endpoints of the BBB surface.
//!
//! getRecordings answers from the balancer's own database; publish, delete
//! and update combine database state changes with the rename-based storage
//! layout.

use super::{require_param, verified_params};
use crate::bbb::{add_scope, xml};
use crate::errors::{xml_response, LbError};
use crate::models::RecordingState;
use crate::repositories::{RecordingFilter, RecordingsRepository};
use crate::routes::AppState;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::instrument;

fn csv_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Render a recording's metadata map, minus the balancer-owned `bbblb-*`
/// routing keys. Those carry backend topology and never reach the frontend.
fn metadata_block(meta: &BTreeMap<String, String>) -> xml::Xml {
    let mut metadata = xml::Xml::new("metadata");
    for (key, value) in meta {
        if key.starts_with("bbblb-") {
            continue;
        }
        metadata = metadata.child(xml::Xml::text(key, value.clone()));
    }
    metadata
}

/// GET /bigbluebutton/api/getRecordings
#[instrument(skip_all, name = "lb.api.getRecordings")]
pub async fn get_recordings(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Response, LbError> {
    let (tenant, params) = verified_params(
        &state,
        &headers,
        &method,
        "getRecordings",
        query.as_deref(),
        None,
    )
    .await?;

    let meta: BTreeMap<String, String> = params
        .iter()
        .filter_map(|(name, value)| {
            name.strip_prefix("meta_")
                .map(|key| (key.to_string(), value.to_string()))
        })
        .collect();

    let filter = RecordingFilter {
        external_ids: csv_list(params.get("meetingID")),
        record_id_prefixes: csv_list(params.get("recordID")),
        states: csv_list(params.get("state")),
        meta,
        offset: params.get("offset").and_then(|v| v.parse().ok()),
        limit: params.get("limit").and_then(|v| v.parse().ok()),
    };

    let recordings =
        RecordingsRepository::list(&state.pool, tenant.id, &filter, state.config.max_items).await?;

    let mut rendered = String::new();
    for recording in recordings {
        let formats = RecordingsRepository::formats_for(&state.pool, recording.id).await?;

        let published = recording.state == RecordingState::Published;
        let metadata = metadata_block(&recording.meta);

        let mut playback = xml::Xml::new("playback");
        for format in formats {
            match xml::rename_root(&format.xml, "format") {
                Ok(fragment) => playback = playback.raw(fragment),
                Err(e) => {
                    tracing::warn!(
                        target: "lb.api",
                        record_id = %recording.record_id,
                        format = %format.format,
                        error = %e,
                        "Skipping playback format with unparseable XML"
                    );
                }
            }
        }

        let fragment = xml::Xml::new("recording")
            .child(xml::Xml::text("recordID", recording.record_id.clone()))
            .child(xml::Xml::text("meetingID", recording.external_id.clone()))
            .child(xml::Xml::text("internalMeetingID", recording.record_id.clone()))
            .child(xml::Xml::text(
                "name",
                recording
                    .meta
                    .get("meetingName")
                    .cloned()
                    .unwrap_or_default(),
            ))
            .child(xml::Xml::text(
                "isBreakout",
                recording
                    .meta
                    .get("isBreakout")
                    .cloned()
                    .unwrap_or_else(|| "false".to_string()),
            ))
            .child(xml::Xml::text(
                "published",
                if published { "true" } else { "false" },
            ))
            .child(xml::Xml::text("state", recording.state.as_db_str()))
            .child(xml::Xml::text(
                "startTime",
                recording.started.timestamp_millis().to_string(),
            ))
            .child(xml::Xml::text(
                "endTime",
                recording.ended.timestamp_millis().to_string(),
            ))
            .child(xml::Xml::text(
                "participants",
                recording.participants.to_string(),
            ))
            .child(metadata)
            .child(playback)
            .render();

        // Recording metadata may still carry the scoped meeting ID.
        let scoped_id = add_scope(&recording.external_id, &tenant.name);
        let fragment = xml::rewrite_meeting_ids(&fragment, &scoped_id, &recording.external_id)
            .unwrap_or(fragment);
        rendered.push_str(&fragment);
    }

    let body = xml::success_response(vec![xml::Xml::new("recordings").raw(rendered)]);
    Ok(xml_response(StatusCode::OK, body))
}

/// GET /bigbluebutton/api/publishRecordings
///
/// Publish/unpublish is an atomic directory rename plus a state column flip.
#[instrument(skip_all, name = "lb.api.publishRecordings")]
pub async fn publish_recordings(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Response, LbError> {
    let (tenant, params) = verified_params(
        &state,
        &headers,
        &method,
        "publishRecordings",
        query.as_deref(),
        None,
    )
    .await?;

    let record_ids = csv_list(Some(require_param(&params, "recordID")?));
    let publish = require_param(&params, "publish")?.eq_ignore_ascii_case("true");
    let new_state = if publish {
        RecordingState::Published
    } else {
        RecordingState::Unpublished
    };

    let mut tx = state.pool.begin().await?;
    let recordings =
        RecordingsRepository::find_for_update(&mut tx, tenant.id, &record_ids).await?;
    if recordings.is_empty() {
        return Err(LbError::NotFound("Unknown recording".to_string()));
    }

    for recording in &recordings {
        match state
            .importer
            .set_published(&tenant.name, &recording.record_id, publish)
            .await
        {
            Ok(()) => {
                RecordingsRepository::set_state(&mut tx, recording.id, new_state).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(
                    target: "lb.api",
                    record_id = %recording.record_id,
                    "Recording found in database but not in storage"
                );
            }
            Err(e) => {
                return Err(LbError::Internal(format!(
                    "Failed to move recording directories: {e}"
                )));
            }
        }
    }

    tx.commit().await?;

    Ok(xml_response(
        StatusCode::OK,
        xml::success_response(vec![xml::Xml::text("published", new_state.as_db_str())]),
    ))
}

/// GET /bigbluebutton/api/deleteRecordings
///
/// Rows go first; directories follow in the background, even for record IDs
/// that were never in the database.
#[instrument(skip_all, name = "lb.api.deleteRecordings")]
pub async fn delete_recordings(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Response, LbError> {
    let (tenant, params) = verified_params(
        &state,
        &headers,
        &method,
        "deleteRecordings",
        query.as_deref(),
        None,
    )
    .await?;

    let record_ids = csv_list(Some(require_param(&params, "recordID")?));

    RecordingsRepository::delete_by_record_ids(&state.pool, tenant.id, &record_ids).await?;
    for record_id in record_ids {
        state.importer.spawn_delete(tenant.name.clone(), record_id);
    }

    Ok(xml_response(
        StatusCode::OK,
        xml::success_response(vec![xml::Xml::text("deleted", "true")]),
    ))
}

/// GET/POST /bigbluebutton/api/updateRecordings
///
/// Merges `meta_*` parameters into the stored metadata; empty values delete
/// keys, balancer-owned `meta_bbblb-*` keys are never touched.
#[instrument(skip_all, name = "lb.api.updateRecordings")]
pub async fn update_recordings(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, LbError> {
    let (tenant, params) = verified_params(
        &state,
        &headers,
        &method,
        "updateRecordings",
        query.as_deref(),
        Some(&body),
    )
    .await?;

    let record_ids = csv_list(Some(require_param(&params, "recordID")?));
    let updates: Vec<(String, String)> = params
        .iter()
        .filter(|(name, _)| name.starts_with("meta_") && !name.starts_with("meta_bbblb-"))
        .map(|(name, value)| {
            (
                name.trim_start_matches("meta_").to_string(),
                value.to_string(),
            )
        })
        .collect();

    let mut tx = state.pool.begin().await?;
    let recordings =
        RecordingsRepository::find_for_update(&mut tx, tenant.id, &record_ids).await?;

    for recording in recordings {
        let mut meta = recording.meta.clone();
        for (key, value) in &updates {
            if value.is_empty() {
                meta.remove(key);
            } else {
                meta.insert(key.clone(), value.clone());
            }
        }
        RecordingsRepository::update_meta(&mut tx, recording.id, &meta).await?;
    }

    tx.commit().await?;

    Ok(xml_response(
        StatusCode::OK,
        xml::success_response(vec![xml::Xml::text("updated", "true")]),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_list() {
        assert_eq!(csv_list(Some("a, b ,,c")), vec!["a", "b", "c"]);
        assert!(csv_list(Some("")).is_empty());
        assert!(csv_list(None).is_empty());
    }

    #[test]
    fn test_metadata_block_hides_balancer_keys() {
        let meta = BTreeMap::from([
            ("meetingName".to_string(), "Demo Room".to_string()),
            ("isBreakout".to_string(), "false".to_string()),
            ("bbblb-uuid".to_string(), "7f1bb1b7".to_string()),
            ("bbblb-server".to_string(), "bbb1.internal".to_string()),
            ("bbblb-tenant".to_string(), "t1".to_string()),
            ("bbblb-origin".to_string(), "lb.example.com".to_string()),
        ]);

        let rendered = metadata_block(&meta).render();

        assert!(rendered.contains("<meetingName>Demo Room</meetingName>"));
        assert!(rendered.contains("<isBreakout>false</isBreakout>"));
        assert!(!rendered.contains("bbblb-"));
        assert!(!rendered.contains("bbb1.internal"));
    }
}
