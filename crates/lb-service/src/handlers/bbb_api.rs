//! The BBB API mediator: meeting endpoints.
//!
//! Every endpoint authenticates the tenant by realm header, verifies the
//! inbound checksum, resolves the meeting where required and forwards a
//! re-signed call to the meeting's backend server. Database handles are
//! released before upstream HTTP calls so slow backends cannot exhaust the
//! connection pool.

use super::{backend_client, require_meeting, require_param, verified_params};
use crate::bbb::{add_scope, split_scope, xml, Params, MAX_MEETING_ID_LEN};
use crate::errors::{xml_response, LbError};
use crate::models::{Meeting, Tenant, CALLBACK_TYPE_END, CALLBACK_TYPE_REC};
use crate::overrides::apply_overrides;
use crate::repositories::{CallbacksRepository, MeetingsRepository, ServersRepository};
use crate::routes::AppState;
use crate::services::webhooks::end_callback_signature;
use axum::extract::{RawQuery, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::TryStreamExt;
use tracing::instrument;
use uuid::Uuid;

/// Create parameters whose callbacks are proxied with re-signed JWTs.
const JWT_CALLBACK_PARAMS: &[&str] = &["meta_analytics-callback-url"];

/// Suffix marking recording-ready callback parameters.
const RECORDING_READY_SUFFIX: &str = "-recording-ready-url";

/// GET /bigbluebutton/api - the version/index document.
pub async fn index() -> Response {
    let body = xml::success_response(vec![
        xml::Xml::text("version", "2.0"),
        xml::Xml::text("info", "Served by bbblb"),
    ]);
    xml_response(StatusCode::OK, body)
}

/// Replace callback parameters with balancer-owned URLs and persist the
/// originals for later forwarding.
///
/// Callback rows are only inserted for freshly created meetings; repeated
/// create calls still get the rewritten parameters.
async fn intercept_callbacks(
    conn: &mut sqlx::PgConnection,
    state: &AppState,
    params: &mut Params,
    meeting: &Meeting,
    is_new: bool,
) -> Result<(), LbError> {
    let secret = state.config.global_secret();
    let domain = &state.config.domain;

    // meetingEndedURL carries no signed payload, so the replacement URL is
    // itself signed.
    let original_end = params.remove("meetingEndedURL");
    if is_new {
        if let Some(ref url) = original_end {
            CallbacksRepository::insert(
                conn,
                meeting.uuid,
                CALLBACK_TYPE_END,
                meeting.tenant_fk,
                meeting.server_fk,
                Some(url),
            )
            .await?;
        }
    }
    let sig = end_callback_signature(secret, &meeting.uuid);
    params.set(
        "meetingEndedURL",
        format!("https://{domain}/api/v1/callback/{}/end/{sig}", meeting.uuid),
    );

    // Recording-ready callbacks fire only after the recording was imported
    // and is actually servable; the backend never sees them.
    let ready_params: Vec<String> = params
        .names()
        .filter(|name| name.starts_with("meta_") && name.ends_with(RECORDING_READY_SUFFIX))
        .map(ToString::to_string)
        .collect();
    for name in ready_params {
        if let Some(url) = params.remove(&name) {
            if is_new {
                CallbacksRepository::insert(
                    conn,
                    meeting.uuid,
                    CALLBACK_TYPE_REC,
                    meeting.tenant_fk,
                    meeting.server_fk,
                    Some(&url),
                )
                .await?;
            }
        }
    }

    // JWT-style callbacks are proxied live; intercepted so the payload can
    // be re-signed with the tenant secret.
    for name in JWT_CALLBACK_PARAMS {
        let Some(url) = params.remove(name) else {
            continue;
        };
        let kind = name
            .trim_start_matches("meta_")
            .trim_end_matches("-callback-url");
        if is_new {
            CallbacksRepository::insert(
                conn,
                meeting.uuid,
                kind,
                meeting.tenant_fk,
                meeting.server_fk,
                Some(&url),
            )
            .await?;
        }
        params.set(
            *name,
            format!("https://{domain}/api/v1/callback/{}/{kind}", meeting.uuid),
        );
    }

    Ok(())
}

/// Check the scoped meeting ID against the backend's length limit.
fn check_scoped_len(scoped_id: &str, unscoped_id: &str) -> Result<(), LbError> {
    if scoped_id.len() > MAX_MEETING_ID_LEN {
        let budget = MAX_MEETING_ID_LEN - (scoped_id.len() - unscoped_id.len());
        return Err(LbError::Size(format!(
            "Meeting ID must be between 2 and {budget} characters"
        )));
    }
    Ok(())
}

/// GET/POST /bigbluebutton/api/create
///
/// The critical path: bind the meeting to exactly one server, intercept
/// callbacks, forward, and compensate on upstream failure.
#[instrument(skip_all, name = "lb.api.create")]
pub async fn create(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, LbError> {
    let (tenant, mut params) = verified_params(
        &state,
        &headers,
        &method,
        "create",
        query.as_deref(),
        Some(&body),
    )
    .await?;

    let unscoped_id = require_param(&params, "meetingID")?.to_string();
    require_param(&params, "name")?;
    let scoped_id = add_scope(&unscoped_id, &tenant.name);
    check_scoped_len(&scoped_id, &unscoped_id)?;

    // Phase one: find or create the binding inside one transaction. The row
    // lock on the meeting (or the chosen server) serializes concurrent
    // creates; losers observe the winner's row.
    let mut tx = state.pool.begin().await?;

    let existing = MeetingsRepository::find_for_update(&mut tx, tenant.id, &unscoped_id).await?;
    let (meeting, created, server) = match existing {
        Some(meeting) => {
            let server = ServersRepository::get(&mut *tx, meeting.server_fk)
                .await?
                .ok_or_else(|| LbError::Internal("Meeting lost its server".to_string()))?;
            (meeting, false, server)
        }
        None => {
            let best = ServersRepository::select_best_for_update(&mut tx)
                .await?
                .ok_or_else(|| LbError::Internal("No suitable servers available.".to_string()))?;

            // Bump the load estimate immediately so concurrent creates see it.
            let delta = state.config.loadfactor_initial + state.config.loadfactor_meeting;
            ServersRepository::bump_load(&mut *tx, best.id, delta).await?;

            let (meeting, created) = MeetingsRepository::get_or_create(
                &mut tx,
                tenant.id,
                best.id,
                &unscoped_id,
                Uuid::new_v4(),
            )
            .await?;

            // A racing winner may have bound a different server.
            let server = if meeting.server_fk == best.id {
                best
            } else {
                ServersRepository::get(&mut *tx, meeting.server_fk)
                    .await?
                    .ok_or_else(|| LbError::Internal("Meeting lost its server".to_string()))?
            };
            (meeting, created, server)
        }
    };

    params.set("meetingID", scoped_id.clone());
    params.set("meta_bbblb-uuid", meeting.uuid.to_string());
    params.set("meta_bbblb-origin", state.config.domain.clone());
    params.set("meta_bbblb-tenant", tenant.name.clone());
    params.set("meta_bbblb-server", server.domain.clone());
    intercept_callbacks(&mut tx, &state, &mut params, &meeting, created).await?;
    apply_overrides(&tenant.overrides, &mut params);

    tx.commit().await?;
    // Transaction dropped: the connection is back in the pool before the
    // potentially slow backend call below.

    // Phase two: create the meeting on the backend.
    let bbb = backend_client(&state, &server);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let upstream = if content_type.as_deref() == Some("application/xml") && !body.is_empty() {
        // Pre-uploaded slides document travels along.
        bbb.action_with_body("create", &params, body.clone().into(), content_type.as_deref())
            .await
    } else {
        bbb.action("create", &params).await
    };

    match upstream.and_then(crate::bbb::BbbResponse::raise_on_error) {
        Ok(response) => {
            if created {
                tracing::info!(
                    target: "lb.api",
                    meeting = %unscoped_id,
                    tenant = %tenant.name,
                    server = %server.domain,
                    "Created meeting"
                );
                if let Some(internal_id) = response.find_text(&["internalMeetingID"]) {
                    MeetingsRepository::set_internal_id(&state.pool, meeting.id, &internal_id)
                        .await?;
                }
            }
            let body = xml::rewrite_meeting_ids(&response.body, &scoped_id, &unscoped_id)
                .unwrap_or(response.body);
            Ok(xml_response(StatusCode::OK, body))
        }
        Err(e) => {
            if created {
                tracing::error!(
                    target: "lb.api",
                    meeting = %unscoped_id,
                    server = %server.domain,
                    error = %e,
                    "Backend create failed, compensating"
                );
                CallbacksRepository::delete_by_uuid(&state.pool, meeting.uuid).await?;
                MeetingsRepository::delete(&state.pool, meeting.id).await?;
            }
            Err(e.into())
        }
    }
}

/// GET /bigbluebutton/api/join
///
/// Bumps the server load and answers a 302 to the backend's signed join URL.
#[instrument(skip_all, name = "lb.api.join")]
pub async fn join(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Response, LbError> {
    let (tenant, mut params) =
        verified_params(&state, &headers, &method, "join", query.as_deref(), None).await?;

    let unscoped_id = require_param(&params, "meetingID")?.to_string();
    let scoped_id = add_scope(&unscoped_id, &tenant.name);
    let meeting = require_meeting(&state, &tenant, &params).await?;
    let server = ServersRepository::get(&state.pool, meeting.server_fk)
        .await?
        .ok_or_else(|| LbError::Internal("Meeting lost its server".to_string()))?;

    ServersRepository::bump_load(&state.pool, server.id, state.config.loadfactor_size).await?;

    let bbb = backend_client(&state, &server);
    params.set("meetingID", scoped_id);
    let redirect = bbb.url_for("join", &params);

    Ok((
        StatusCode::FOUND,
        [(header::LOCATION, redirect)],
    )
        .into_response())
}

/// GET/POST /bigbluebutton/api/end
///
/// The local meeting is forgotten regardless of the backend outcome.
#[instrument(skip_all, name = "lb.api.end")]
pub async fn end(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, LbError> {
    let (tenant, mut params) = verified_params(
        &state,
        &headers,
        &method,
        "end",
        query.as_deref(),
        Some(&body),
    )
    .await?;

    let unscoped_id = require_param(&params, "meetingID")?.to_string();
    let scoped_id = add_scope(&unscoped_id, &tenant.name);
    let meeting = require_meeting(&state, &tenant, &params).await?;
    let server = ServersRepository::get(&state.pool, meeting.server_fk)
        .await?
        .ok_or_else(|| LbError::Internal("Meeting lost its server".to_string()))?;

    MeetingsRepository::delete(&state.pool, meeting.id).await?;

    // Best-effort end on the backend; API-level errors pass through,
    // transport failures are swallowed since the meeting is gone locally.
    let bbb = backend_client(&state, &server);
    params.set("meetingID", scoped_id.clone());
    match bbb.action("end", &params).await {
        Ok(response) => {
            let body = xml::rewrite_meeting_ids(&response.body, &scoped_id, &unscoped_id)
                .unwrap_or(response.body);
            Ok(xml_response(StatusCode::OK, body))
        }
        Err(e) => {
            tracing::warn!(
                target: "lb.api",
                meeting = %unscoped_id,
                server = %server.domain,
                error = %e,
                "Backend end failed after local removal"
            );
            Ok(xml_response(
                StatusCode::OK,
                xml::success_response(vec![
                    xml::Xml::text("messageKey", "sentEndMeetingRequest"),
                    xml::Xml::text(
                        "message",
                        "A request to end the meeting was sent.",
                    ),
                ]),
            ))
        }
    }
}

/// GET/POST /bigbluebutton/api/isMeetingRunning
#[instrument(skip_all, name = "lb.api.isMeetingRunning")]
pub async fn is_meeting_running(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, LbError> {
    let (tenant, mut params) = verified_params(
        &state,
        &headers,
        &method,
        "isMeetingRunning",
        query.as_deref(),
        Some(&body),
    )
    .await?;

    let unscoped_id = require_param(&params, "meetingID")?.to_string();
    let scoped_id = add_scope(&unscoped_id, &tenant.name);

    // An unknown meeting is not running; that is not an error.
    let meeting = match require_meeting(&state, &tenant, &params).await {
        Ok(meeting) => meeting,
        Err(LbError::NotFound(_)) => {
            return Ok(xml_response(
                StatusCode::OK,
                xml::success_response(vec![xml::Xml::text("running", "false")]),
            ));
        }
        Err(e) => return Err(e),
    };
    let server = ServersRepository::get(&state.pool, meeting.server_fk)
        .await?
        .ok_or_else(|| LbError::Internal("Meeting lost its server".to_string()))?;

    let bbb = backend_client(&state, &server);
    params.set("meetingID", scoped_id.clone());
    let response = bbb.action("isMeetingRunning", &params).await?;

    if response.find_text(&["running"]).as_deref() == Some("false") {
        MeetingsRepository::delete(&state.pool, meeting.id).await?;
    }

    let body = xml::rewrite_meeting_ids(&response.body, &scoped_id, &unscoped_id)
        .unwrap_or(response.body);
    Ok(xml_response(StatusCode::OK, body))
}

/// Forward a meeting-scoped call and forget the meeting on `notFound`.
async fn forward_meeting_action(
    state: &AppState,
    tenant: &Tenant,
    mut params: Params,
    action: &str,
) -> Result<Response, LbError> {
    let unscoped_id = require_param(&params, "meetingID")?.to_string();
    let scoped_id = add_scope(&unscoped_id, &tenant.name);
    let meeting = require_meeting(state, tenant, &params).await?;
    let server = ServersRepository::get(&state.pool, meeting.server_fk)
        .await?
        .ok_or_else(|| LbError::Internal("Meeting lost its server".to_string()))?;

    let bbb = backend_client(state, &server);
    params.set("meetingID", scoped_id.clone());
    let response = bbb.action(action, &params).await?;

    if response.error_key() == Some("notFound") {
        MeetingsRepository::delete(&state.pool, meeting.id).await?;
    }

    let body = xml::rewrite_meeting_ids(&response.body, &scoped_id, &unscoped_id)
        .unwrap_or(response.body);
    Ok(xml_response(StatusCode::OK, body))
}

/// GET/POST /bigbluebutton/api/getMeetingInfo
#[instrument(skip_all, name = "lb.api.getMeetingInfo")]
pub async fn get_meeting_info(
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
        "getMeetingInfo",
        query.as_deref(),
        Some(&body),
    )
    .await?;
    forward_meeting_action(&state, &tenant, params, "getMeetingInfo").await
}

/// GET /bigbluebutton/api/sendChatMessage
#[instrument(skip_all, name = "lb.api.sendChatMessage")]
pub async fn send_chat_message(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Response, LbError> {
    let (tenant, params) = verified_params(
        &state,
        &headers,
        &method,
        "sendChatMessage",
        query.as_deref(),
        None,
    )
    .await?;
    forward_meeting_action(&state, &tenant, params, "sendChatMessage").await
}

/// GET/POST /bigbluebutton/api/getMeetings
///
/// Fans out to every server hosting a meeting of this tenant, unions the
/// results and filters out anything that is not ours.
#[instrument(skip_all, name = "lb.api.getMeetings")]
pub async fn get_meetings(
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
        "getMeetings",
        query.as_deref(),
        Some(&body),
    )
    .await?;

    let servers = ServersRepository::with_meetings_for_tenant(&state.pool, tenant.id).await?;

    let calls = servers.iter().map(|server| {
        let bbb = backend_client(&state, server);
        let params = params.clone();
        let domain = server.domain.clone();
        async move { (domain, bbb.action("getMeetings", &params).await) }
    });
    let responses = futures::future::join_all(calls).await;

    let mut merged = String::new();
    for (domain, result) in responses {
        let response = match result.and_then(crate::bbb::BbbResponse::raise_on_error) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    target: "lb.api",
                    server = %domain,
                    error = %e,
                    "getMeetings fan-out failed for one server"
                );
                continue;
            }
        };
        let fragments = xml::extract_elements(&response.body, "meeting").unwrap_or_default();
        for fragment in fragments {
            if xml::find_text(&fragment, &["metadata", "bbblb-tenant"]).as_deref()
                != Some(tenant.name.as_str())
            {
                continue;
            }
            let Some(scoped_id) = xml::find_text(&fragment, &["meetingID"]) else {
                continue;
            };
            let Some((unscoped_id, scope)) = split_scope(&scoped_id) else {
                continue;
            };
            if scope != tenant.name {
                continue;
            }
            let fragment = xml::rewrite_meeting_ids(&fragment, &scoped_id, unscoped_id)
                .unwrap_or(fragment);
            merged.push_str(&fragment);
        }
    }

    let body = xml::success_response(vec![xml::Xml::new("meetings").raw(merged)]);
    Ok(xml_response(StatusCode::OK, body))
}

/// POST /bigbluebutton/api/insertDocument
///
/// Streams the request body through to the backend without buffering.
#[instrument(skip_all, name = "lb.api.insertDocument")]
pub async fn insert_document(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, LbError> {
    let (parts, body) = request.into_parts();
    let headers = parts.headers;
    let query = parts.uri.query().map(ToString::to_string);

    let (tenant, mut params) = verified_params(
        &state,
        &headers,
        &Method::GET,
        "insertDocument",
        query.as_deref(),
        None,
    )
    .await?;

    let unscoped_id = require_param(&params, "meetingID")?.to_string();
    let scoped_id = add_scope(&unscoped_id, &tenant.name);
    let meeting = require_meeting(&state, &tenant, &params).await?;
    let server = ServersRepository::get(&state.pool, meeting.server_fk)
        .await?
        .ok_or_else(|| LbError::Internal("Meeting lost its server".to_string()))?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let bbb = backend_client(&state, &server);
    params.set("meetingID", scoped_id);

    let stream = body
        .into_data_stream()
        .map_err(std::io::Error::other);
    let upstream = bbb
        .action_json(
            "insertDocument",
            &params,
            reqwest::Body::wrap_stream(stream),
            content_type.as_deref(),
        )
        .await?;

    Ok(axum::Json(upstream).into_response())
}

/// GET /bigbluebutton/api/getJoinUrl - backend-only, cannot be balanced.
pub async fn get_join_url() -> LbError {
    LbError::NotImplemented
}

/// Caption endpoints are reserved; processing happens on the backend.
pub async fn not_implemented() -> LbError {
    LbError::NotImplemented
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_check_scoped_len() {
        assert!(check_scoped_len("t1:room", "room").is_ok());

        let unscoped = "x".repeat(300);
        let scoped = add_scope(&unscoped, "t1");
        let err = check_scoped_len(&scoped, &unscoped).unwrap_err();
        assert!(matches!(err, LbError::Size(_)));
        // The reported budget accounts for the scope prefix.
        assert!(err.public_message().contains("253"));
    }

    #[test]
    fn test_jwt_callback_kind_derivation() {
        let kind = "meta_analytics-callback-url"
            .trim_start_matches("meta_")
            .trim_end_matches("-callback-url");
        assert_eq!(kind, "analytics");
    }

    #[test]
    fn test_recording_ready_suffix_matches() {
        for name in [
            "meta_bn-recording-ready-url",
            "meta_bbb-recording-ready-url",
        ] {
            assert!(name.starts_with("meta_") && name.ends_with(RECORDING_READY_SUFFIX));
        }
        assert!(!"meta_analytics-callback-url".ends_with(RECORDING_READY_SUFFIX));
    }
}
