//! HTTP routes for the balancer.
//!
//! Two surfaces share one router: the BBB API under `/bigbluebutton/api`
//! (checksum-authenticated, XML) and the private balancer API under `/api`
//! (signature/JWT-authenticated). Plus ambient `/v1/health` and `/metrics`.

use crate::config::Config;
use crate::handlers;
use crate::recordings::importer::RecordingImporter;
use crate::services::Webhooks;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: PgPool,

    /// Service configuration.
    pub config: Config,

    /// Shared HTTP client pool for backend calls and webhook forwards.
    pub http: reqwest::Client,

    /// Recording import pipeline.
    pub importer: Arc<RecordingImporter>,

    /// Supervised webhook forwarding.
    pub webhooks: Webhooks,

    /// Prometheus render handle, when metrics are installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Build the application routes.
///
/// The streaming endpoints (insertDocument, recording upload) sit outside
/// the body limit; everything buffered is capped slightly above `MAX_BODY`
/// so oversize detection stays in our hands.
pub fn build_routes(state: AppState) -> Router {
    let buffered_limit = DefaultBodyLimit::max(state.config.max_body + 1024);

    let bbb_api = Router::new()
        .route("/", get(handlers::bbb_api::index).post(handlers::bbb_api::index))
        .route(
            "/create",
            get(handlers::bbb_api::create).post(handlers::bbb_api::create),
        )
        .route("/join", get(handlers::bbb_api::join))
        .route(
            "/end",
            get(handlers::bbb_api::end).post(handlers::bbb_api::end),
        )
        .route(
            "/isMeetingRunning",
            get(handlers::bbb_api::is_meeting_running).post(handlers::bbb_api::is_meeting_running),
        )
        .route(
            "/getMeetings",
            get(handlers::bbb_api::get_meetings).post(handlers::bbb_api::get_meetings),
        )
        .route(
            "/getMeetingInfo",
            get(handlers::bbb_api::get_meeting_info).post(handlers::bbb_api::get_meeting_info),
        )
        .route(
            "/sendChatMessage",
            get(handlers::bbb_api::send_chat_message),
        )
        .route("/getJoinUrl", get(handlers::bbb_api::get_join_url))
        .route(
            "/getRecordings",
            get(handlers::recordings_api::get_recordings),
        )
        .route(
            "/publishRecordings",
            get(handlers::recordings_api::publish_recordings),
        )
        .route(
            "/deleteRecordings",
            get(handlers::recordings_api::delete_recordings),
        )
        .route(
            "/updateRecordings",
            get(handlers::recordings_api::update_recordings)
                .post(handlers::recordings_api::update_recordings),
        )
        .route(
            "/getRecordingTextTracks",
            get(handlers::bbb_api::not_implemented).post(handlers::bbb_api::not_implemented),
        )
        .route(
            "/putRecordingTextTrack",
            post(handlers::bbb_api::not_implemented),
        )
        .layer(buffered_limit.clone())
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    // Streaming endpoints, body limits off.
    let streaming = Router::new()
        .route(
            "/bigbluebutton/api/insertDocument",
            post(handlers::bbb_api::insert_document),
        )
        .route(
            "/api/v1/recording/upload",
            post(handlers::upload::recording_upload),
        )
        .layer(DefaultBodyLimit::disable());

    let private_api = Router::new()
        .route(
            "/v1/callback/:uuid/end/:sig",
            get(handlers::callbacks::callback_end).post(handlers::callbacks::callback_end),
        )
        .route(
            "/v1/callback/:uuid/:kind",
            post(handlers::callbacks::callback_proxy),
        )
        .layer(buffered_limit)
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    // No request timeout on the streaming router: uploads may be large and
    // slow by design.
    Router::new()
        .nest("/bigbluebutton/api", bbb_api)
        .nest("/api", private_api)
        .merge(streaming)
        .route("/v1/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
