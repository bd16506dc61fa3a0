//! Backend-to-balancer callback endpoints.
//!
//! The balancer substitutes its own URLs for the callbacks a frontend
//! registered; when the backend calls them, the original URLs are fired
//! asynchronously. All signature checks are constant-time; an invalid
//! signature mutates nothing.

use crate::errors::LbError;
use crate::models::CALLBACK_TYPE_END;
use crate::repositories::{
    CallbacksRepository, MeetingsRepository, ServersRepository, TenantsRepository,
};
use crate::routes::AppState;
use crate::services::webhooks::{resign_payload, verify_end_callback_signature};
use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::instrument;
use uuid::Uuid;

/// GET/POST /api/v1/callback/{uuid}/end/{sig}
///
/// The meetingEndedURL replacement. Verifies the URL signature, consumes the
/// END callback, forwards the original URL (if any) and forgets the meeting.
#[instrument(skip_all, name = "lb.callback.end", fields(uuid = %uuid))]
pub async fn callback_end(
    State(state): State<AppState>,
    Path((uuid, sig)): Path<(Uuid, String)>,
    RawQuery(query): RawQuery,
) -> Result<Response, LbError> {
    if !verify_end_callback_signature(state.config.global_secret(), &uuid, &sig) {
        tracing::warn!(target: "lb.callback", uuid = %uuid, "Callback signature mismatch");
        return Ok((
            StatusCode::UNAUTHORIZED,
            "Access denied, signature check failed",
        )
            .into_response());
    }

    // Notify the frontend, if one registered an end callback.
    let callbacks =
        CallbacksRepository::find_by_uuid_and_kind(&state.pool, uuid, CALLBACK_TYPE_END).await?;
    for callback in callbacks {
        if let Some(forward) = callback.forward.clone() {
            let passthrough = crate::bbb::Params::from_query(query.as_deref().unwrap_or(""))
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect();
            state.webhooks.spawn_get(forward, passthrough);
        }
        CallbacksRepository::delete(&state.pool, callback.id).await?;
    }

    // Mark the meeting as ended, if still present.
    if let Some(meeting) = MeetingsRepository::find_by_uuid(&state.pool, uuid).await? {
        tracing::info!(
            target: "lb.callback",
            uuid = %uuid,
            meeting = %meeting.external_id,
            "Meeting ended via callback"
        );
        MeetingsRepository::delete(&state.pool, meeting.id).await?;
    }

    Ok((StatusCode::OK, "OK").into_response())
}

/// POST /api/v1/callback/{uuid}/{type}
///
/// Generic JWT callback proxy. The inbound `signed_parameters` payload is
/// verified with the originating server's secret, re-signed with the tenant
/// secret and forwarded to every registered URL.
#[instrument(skip_all, name = "lb.callback.proxy", fields(uuid = %uuid, kind = %kind))]
pub async fn callback_proxy(
    State(state): State<AppState>,
    Path((uuid, kind)): Path<(Uuid, String)>,
    body: Bytes,
) -> Result<Response, LbError> {
    if body.len() > state.config.max_body {
        return Ok((StatusCode::PAYLOAD_TOO_LARGE, "Request Entity Too Large").into_response());
    }

    let form = crate::bbb::Params::from_query(&String::from_utf8_lossy(&body));
    let Some(token) = form.get("signed_parameters") else {
        return Ok((StatusCode::BAD_REQUEST, "Invalid request").into_response());
    };

    let callbacks = CallbacksRepository::find_by_uuid_and_kind(&state.pool, uuid, &kind).await?;
    let Some(first) = callbacks.first() else {
        // Already fired, or never registered. Nothing to do.
        return Ok((StatusCode::OK, "OK").into_response());
    };

    let server = ServersRepository::get(&state.pool, first.server_fk)
        .await?
        .ok_or_else(|| LbError::Internal("Callback lost its server".to_string()))?;

    let Ok(payload) = common::jwt::verify_payload(token, &server.secret) else {
        tracing::warn!(target: "lb.callback", uuid = %uuid, "Callback payload verification failed");
        return Ok((
            StatusCode::UNAUTHORIZED,
            "Access denied, signature check failed",
        )
            .into_response());
    };

    let tenant = TenantsRepository::get(&state.pool, first.tenant_fk)
        .await?
        .ok_or_else(|| LbError::Internal("Callback lost its tenant".to_string()))?;

    for callback in callbacks {
        let Some(forward) = callback.forward.clone() else {
            CallbacksRepository::delete(&state.pool, callback.id).await?;
            continue;
        };
        let jwt = resign_payload(&payload, tenant.primary_secret())?;
        state
            .webhooks
            .spawn_signed_post(state.pool.clone(), callback.id, forward, jwt);
    }

    Ok((StatusCode::OK, "OK").into_response())
}
