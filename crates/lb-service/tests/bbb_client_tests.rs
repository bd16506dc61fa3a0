//! Integration tests for the backend BBB client against a mock server.
//!
//! Verifies that outgoing calls carry a valid checksum, that the XML
//! envelope round-trips, and that error surfaces behave.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use lb_service::bbb::{verify_checksum_query, BbbClient, BbbError, Params};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const SECRET: &str = "backend-secret";

fn client_for(server: &MockServer) -> BbbClient {
    BbbClient::new(
        reqwest::Client::new(),
        format!("{}/bigbluebutton/api", server.uri()),
        SECRET,
        None,
    )
}

/// A responder that checks the inbound checksum before answering.
fn checked_response(action: &'static str, body: &'static str) -> impl Fn(&Request) -> ResponseTemplate + Send + Sync {
    move |request: &Request| {
        let query = request.url.query().unwrap_or("");
        match verify_checksum_query(action, query, &[SECRET]) {
            Ok(_) => ResponseTemplate::new(200).set_body_string(body),
            Err(_) => ResponseTemplate::new(200).set_body_string(
                "<response><returncode>FAILED</returncode>\
                 <messageKey>checksumError</messageKey>\
                 <message>Checksum mismatch</message></response>",
            ),
        }
    }
}

#[tokio::test]
async fn test_action_signs_and_parses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bigbluebutton/api/isMeetingRunning"))
        .respond_with(checked_response(
            "isMeetingRunning",
            "<response><returncode>SUCCESS</returncode><running>true</running></response>",
        ))
        .mount(&server)
        .await;

    let mut params = Params::new();
    params.set("meetingID", "t1:room with spaces");

    let response = client_for(&server)
        .action("isMeetingRunning", &params)
        .await
        .unwrap();

    assert!(response.success());
    assert_eq!(response.find_text(&["running"]).as_deref(), Some("true"));
}

#[tokio::test]
async fn test_failed_envelope_becomes_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bigbluebutton/api/end"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<response><returncode>FAILED</returncode>\
             <messageKey>notFound</messageKey>\
             <message>Meeting not found</message></response>",
        ))
        .mount(&server)
        .await;

    let response = client_for(&server).action("end", &Params::new()).await.unwrap();
    assert!(!response.success());
    assert_eq!(response.error_key(), Some("notFound"));

    let err = response.raise_on_error().unwrap_err();
    assert!(matches!(err, BbbError::Api { message_key, .. } if message_key == "notFound"));
}

#[tokio::test]
async fn test_non_envelope_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bigbluebutton/api/getMeetings"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .action("getMeetings", &Params::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BbbError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_action_json_posts_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bigbluebutton/api/insertDocument"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"response": {"returncode": "SUCCESS"}})),
        )
        .mount(&server)
        .await;

    let mut params = Params::new();
    params.set("meetingID", "t1:room");

    let value = client_for(&server)
        .action_json(
            "insertDocument",
            &params,
            reqwest::Body::from("<modules/>"),
            Some("application/xml"),
        )
        .await
        .unwrap();

    assert_eq!(value["response"]["returncode"], "SUCCESS");
}

#[tokio::test]
async fn test_url_for_round_trips_through_verifier() {
    let server = MockServer::start().await;
    let mut params = Params::new();
    params.set("meetingID", "t1:room");
    params.set("fullName", "Alice & Bob");
    params.set("role", "MODERATOR");

    let url = client_for(&server).url_for("join", &params);
    let (_, query) = url.split_once('?').unwrap();

    let verified = verify_checksum_query("join", query, &[SECRET]).unwrap();
    assert_eq!(verified.get("fullName"), Some("Alice & Bob"));
    assert_eq!(verified.get("role"), Some("MODERATOR"));
}
