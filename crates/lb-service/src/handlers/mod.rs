//! HTTP request handlers.
//!
//! The BBB surface handlers share a small context protocol: resolve the
//! tenant from the realm header, verify the inbound checksum against the
//! tenant's secrets, then hand verified parameters to the endpoint logic.

pub mod bbb_api;
pub mod callbacks;
pub mod health;
pub mod recordings_api;
pub mod upload;

use crate::bbb::{verify_checksum_query, BbbClient, Params};
use crate::errors::LbError;
use crate::models::{Meeting, Server, Tenant};
use crate::repositories::{MeetingsRepository, TenantsRepository};
use crate::routes::AppState;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use std::time::Duration;

/// Resolve the tenant addressed by the realm header.
///
/// Unknown and disabled tenants both fail the checksum step, indistinguishably.
pub(crate) async fn require_tenant(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Tenant, LbError> {
    let realm = headers
        .get(&state.config.tenant_header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("__NO_REALM__");

    TenantsRepository::find_enabled_by_realm(&state.pool, realm)
        .await?
        .ok_or_else(|| {
            LbError::Checksum(
                "Unknown tenant, unable to perform checksum security check".to_string(),
            )
        })
}

/// Resolve the tenant and return the checksum-verified query parameters.
///
/// Some endpoints allow passing the query in a form-encoded POST body; the
/// body is only consulted when the query string is empty, and only up to
/// `MAX_BODY` bytes.
pub(crate) async fn verified_params(
    state: &AppState,
    headers: &HeaderMap,
    method: &Method,
    action: &str,
    raw_query: Option<&str>,
    body: Option<&Bytes>,
) -> Result<(Tenant, Params), LbError> {
    let tenant = require_tenant(state, headers).await?;

    let mut query = raw_query.unwrap_or("").to_string();
    if query.is_empty() && *method == Method::POST {
        let form_encoded = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if form_encoded {
            if let Some(body) = body {
                if body.len() > state.config.max_body {
                    return Err(LbError::Checksum(
                        "Request body too large, could not verify checksum".to_string(),
                    ));
                }
                query = String::from_utf8_lossy(body).into_owned();
            }
        }
    }

    let params = verify_checksum_query(action, &query, &tenant.secrets())
        .map_err(|e| LbError::Checksum(format!("Checksum verification failed: {e}")))?;

    Ok((tenant, params))
}

/// Get a required, non-empty parameter.
pub(crate) fn require_param<'a>(params: &'a Params, name: &str) -> Result<&'a str, LbError> {
    params
        .get(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LbError::MissingParameter(name.to_string()))
}

/// Resolve the meeting addressed by the `meetingID` parameter.
///
/// Accepts the internal or external meeting ID, scoped to the tenant.
pub(crate) async fn require_meeting(
    state: &AppState,
    tenant: &Tenant,
    params: &Params,
) -> Result<Meeting, LbError> {
    let meeting_id = require_param(params, "meetingID")?;
    MeetingsRepository::find_by_any_id(&state.pool, tenant.id, meeting_id)
        .await?
        .ok_or_else(|| {
            LbError::NotFound(
                "We could not find a meeting with that meeting ID - \
                 perhaps the meeting is not yet running?"
                    .to_string(),
            )
        })
}

/// A signed client for one backend server, on the shared connection pool.
pub(crate) fn backend_client(state: &AppState, server: &Server) -> BbbClient {
    BbbClient::new(
        state.http.clone(),
        server.api_base(),
        server.secret.clone(),
        Some(Duration::from_secs(state.config.request_timeout)),
    )
}
