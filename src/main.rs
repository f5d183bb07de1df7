mod bigquery;
mod command;
mod config;
mod format;
mod lookup;
mod slack;
#[cfg(test)]
mod test_support;
mod types;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bigquery::{AssetStore, BigQueryClient};
use command::{parse_identifier, CommandError, CommandKind, RETRY_MESSAGE};
use config::Config;
use slack::{
    verify_signature_now, ResponseDelivery, ResponseUrlClient, SignatureError, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use types::{SlackMessage, SlashCommand};

#[derive(Clone)]
struct AppState {
    store: Arc<dyn AssetStore>,
    delivery: Arc<dyn ResponseDelivery>,
    config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asset_lookup=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        "Serving lookups from {} and {}",
        config.instances_table, config.status_table
    );
    if config.bigquery.access_token.is_some() {
        warn!("Using static BIGQUERY_ACCESS_TOKEN; it will not be refreshed");
    }

    let port = config.port;
    let state = AppState {
        store: Arc::new(BigQueryClient::new(&config.bigquery)),
        delivery: Arc::new(ResponseUrlClient::new()),
        config: Arc::new(config),
    };

    let app = router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", port);
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/slack/commands", post(slack_commands_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn slack_commands_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SlackMessage>, Response> {
    let form_encoded = headers
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if !form_encoded {
        warn!("Rejected request with unexpected Content-Type: {:?}", headers.get(CONTENT_TYPE));
        return Err((
            StatusCode::BAD_REQUEST,
            "This request does not appear to be from Slack (incorrect Content-Type).",
        )
            .into_response());
    }

    // Nothing below runs for an unauthenticated request.
    authenticate(&state.config, &headers, &body).map_err(|e| {
        CommandError::from(e).log();
        StatusCode::UNAUTHORIZED.into_response()
    })?;

    let command: SlashCommand = match serde_urlencoded::from_bytes(&body) {
        Ok(command) => command,
        Err(e) => {
            let err = CommandError::Validation("undecodable form body");
            info!("Failed to decode slash command: {}", e);
            return Ok(Json(err.user_message("/getinfo")));
        }
    };

    info!(
        team_id = %command.team_id,
        user_id = %command.user_id,
        channel_id = %command.channel_id,
        "Slash command {} received",
        command.command
    );

    let Some(kind) = CommandKind::from_command(&command.command) else {
        let err = CommandError::UnknownCommand(command.command.trim().to_string());
        err.log();
        return Ok(Json(err.user_message(&command.command)));
    };

    let identifier = match parse_identifier(&command.text, &state.config.identifier_pattern) {
        Ok(identifier) => identifier,
        Err(err) => {
            err.log();
            return Ok(Json(err.user_message(kind.name())));
        }
    };

    Ok(Json(
        respond_within_deadline(state, kind, identifier, command.response_url).await,
    ))
}

fn authenticate(config: &Config, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(SignatureError::MissingHeader(TIMESTAMP_HEADER))?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .ok_or(SignatureError::MissingHeader(SIGNATURE_HEADER))?;

    verify_signature_now(
        &config.signing_secret,
        timestamp,
        signature.as_bytes(),
        body,
        config.signature_tolerance,
    )
}

/// Answers inline when the lookup beats the acknowledgement deadline.
/// Otherwise acknowledges now and posts the result to `response_url` once the
/// lookup settles.
async fn respond_within_deadline(
    state: AppState,
    kind: CommandKind,
    identifier: String,
    response_url: String,
) -> SlackMessage {
    let store = state.store.clone();
    let config = state.config.clone();
    let lookup_identifier = identifier.clone();
    let mut lookup = tokio::spawn(async move {
        lookup::run_lookup(store.as_ref(), &config, kind, &lookup_identifier).await
    });

    let ack_deadline = state.config.ack_deadline;
    if let Ok(joined) = tokio::time::timeout(ack_deadline, &mut lookup).await {
        return reply_from(joined, kind);
    }

    if !response_url.starts_with(&state.config.response_url_prefix) {
        lookup.abort();
        warn!(
            "Lookup for '{}' missed the {:?} ack deadline and response_url is unusable",
            identifier, ack_deadline
        );
        return SlackMessage::ephemeral(RETRY_MESSAGE);
    }

    info!(
        "Lookup for '{}' exceeded {:?}, replying via response_url",
        identifier, ack_deadline
    );
    let delivery = state.delivery.clone();
    tokio::spawn(async move {
        let message = reply_from(lookup.await, kind).replacing_original();
        if let Err(e) = delivery.deliver(&response_url, &message).await {
            error!("Failed to deliver delayed response: {}", e);
        }
    });

    SlackMessage::ephemeral(format!(
        "⏳ Looking up *{}*… results will follow shortly.",
        identifier
    ))
}

fn reply_from(
    joined: Result<Result<SlackMessage, CommandError>, JoinError>,
    kind: CommandKind,
) -> SlackMessage {
    match joined {
        Ok(Ok(message)) => message,
        Ok(Err(err)) => {
            err.log();
            err.user_message(kind.name())
        }
        Err(e) => {
            error!("Lookup task failed: {}", e);
            SlackMessage::ephemeral(RETRY_MESSAGE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slack::compute_signature;
    use crate::test_support::{
        instance_record, test_config, FakeStore, RecordingDelivery, TEST_SECRET,
    };
    use axum::http::{HeaderName, HeaderValue};
    use axum_test::{TestResponse, TestServer};
    use serde_json::Value;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use tokio::sync::mpsc::UnboundedReceiver;

    const RESPONSE_URL: &str = "https://hooks.slack.com/commands/T1/123/abc";

    struct Harness {
        server: TestServer,
        store: Arc<FakeStore>,
        delivered: UnboundedReceiver<(String, SlackMessage)>,
    }

    fn harness(store: FakeStore, config: Config) -> Harness {
        let store = Arc::new(store);
        let (delivery, delivered) = RecordingDelivery::new();
        let state = AppState {
            store: store.clone(),
            delivery: Arc::new(delivery),
            config: Arc::new(config),
        };
        Harness {
            server: TestServer::new(router(state)).unwrap(),
            store,
            delivered,
        }
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn command_body(command: &str, text: &str, response_url: &str) -> String {
        serde_urlencoded::to_string([
            ("token", "legacy"),
            ("team_id", "T1"),
            ("user_id", "U1"),
            ("channel_id", "C1"),
            ("command", command),
            ("text", text),
            ("response_url", response_url),
        ])
        .unwrap()
    }

    async fn post_signed(
        server: &TestServer,
        body: &str,
        timestamp: u64,
        secret: &str,
    ) -> TestResponse {
        let timestamp = timestamp.to_string();
        let signature = compute_signature(secret, &timestamp, body.as_bytes());
        server
            .post("/slack/commands")
            .bytes(Bytes::from(body.to_string()))
            .content_type("application/x-www-form-urlencoded")
            .add_header(
                HeaderName::from_static("x-slack-request-timestamp"),
                HeaderValue::from_str(&timestamp).unwrap(),
            )
            .add_header(
                HeaderName::from_static("x-slack-signature"),
                HeaderValue::from_str(&signature).unwrap(),
            )
            .await
    }

    fn text_of(response: &TestResponse) -> String {
        let json: Value = response.json();
        json.to_string()
    }

    #[tokio::test]
    async fn health_check_responds() {
        let h = harness(FakeStore::with_records(vec![]), test_config());
        let response = h.server.get("/health").await;
        response.assert_status_ok();
        response.assert_text("ok");
    }

    #[tokio::test]
    async fn known_instance_is_answered_inline() {
        let h = harness(
            FakeStore::with_records(vec![instance_record("web-01")]),
            test_config(),
        );
        let body = command_body("/getinfo", "WEB-01", RESPONSE_URL);
        let response = post_signed(&h.server, &body, now(), TEST_SECRET).await;

        response.assert_status_ok();
        let json: Value = response.json();
        assert_eq!(json["response_type"], "ephemeral");
        assert_eq!(json["blocks"][0]["type"], "section");
        let rendered = json.to_string();
        assert!(rendered.contains("web-01"));
        assert!(rendered.contains("e2-medium"));

        assert_eq!(h.store.calls(), 1);
        let query = h.store.last_query().unwrap();
        assert_eq!(query.parameters()[0].value, "web-01");
        assert!(!query.sql().contains("web-01"));
    }

    #[tokio::test]
    async fn bad_signature_is_unauthorized_without_body() {
        let h = harness(
            FakeStore::with_records(vec![instance_record("web-01")]),
            test_config(),
        );
        let body = command_body("/getinfo", "web-01", RESPONSE_URL);
        let response = post_signed(&h.server, &body, now(), "wrong-secret").await;

        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
        assert!(response.text().is_empty());
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn replayed_request_is_unauthorized() {
        let h = harness(
            FakeStore::with_records(vec![instance_record("web-01")]),
            test_config(),
        );
        let body = command_body("/getinfo", "web-01", RESPONSE_URL);
        let response = post_signed(&h.server, &body, now() - 600, TEST_SECRET).await;

        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn missing_signature_headers_are_unauthorized() {
        let h = harness(FakeStore::with_records(vec![]), test_config());
        let response = h
            .server
            .post("/slack/commands")
            .bytes(Bytes::from(command_body("/getinfo", "web-01", RESPONSE_URL)))
            .content_type("application/x-www-form-urlencoded")
            .await;

        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
        assert!(response.text().is_empty());
    }

    #[tokio::test]
    async fn non_form_requests_are_rejected() {
        let h = harness(FakeStore::with_records(vec![]), test_config());
        let response = h
            .server
            .post("/slack/commands")
            .json(&serde_json::json!({ "command": "/getinfo" }))
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_identifier_is_denied_before_any_query() {
        let h = harness(
            FakeStore::with_records(vec![instance_record("web-01")]),
            test_config(),
        );
        let body = command_body("/getinfo", "web-01' OR '1'='1", RESPONSE_URL);
        let response = post_signed(&h.server, &body, now(), TEST_SECRET).await;

        response.assert_status_ok();
        assert!(text_of(&response).contains("Usage: `/getinfo my-resource`"));
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn absent_identifier_gets_no_match_after_one_query() {
        let h = harness(FakeStore::with_records(vec![]), test_config());
        let body = command_body("/getinfo", "ghost-vm", RESPONSE_URL);
        let response = post_signed(&h.server, &body, now(), TEST_SECRET).await;

        response.assert_status_ok();
        assert!(text_of(&response).contains("No information found for resource: *ghost-vm*"));
        assert_eq!(h.store.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let h = harness(FakeStore::with_records(vec![]), test_config());
        let body = command_body("/deploy", "web-01", RESPONSE_URL);
        let response = post_signed(&h.server, &body, now(), TEST_SECRET).await;

        response.assert_status_ok();
        assert!(text_of(&response).contains("Command '/deploy' not recognized."));
        assert_eq!(h.store.calls(), 0);
    }

    #[tokio::test]
    async fn upstream_failure_suggests_retry() {
        let h = harness(FakeStore::failing(), test_config());
        let body = command_body("/checkstatus", "db-7", RESPONSE_URL);
        let response = post_signed(&h.server, &body, now(), TEST_SECRET).await;

        response.assert_status_ok();
        let json: Value = response.json();
        assert_eq!(json["text"], RETRY_MESSAGE);
    }

    #[tokio::test]
    async fn slow_lookup_is_acknowledged_then_delivered() {
        let config = Config {
            ack_deadline: Duration::from_millis(50),
            ..test_config()
        };
        let mut h = harness(
            FakeStore::with_records(vec![instance_record("web-01")])
                .delayed(Duration::from_millis(300)),
            config,
        );
        let body = command_body("/getinfo", "web-01", RESPONSE_URL);
        let response = post_signed(&h.server, &body, now(), TEST_SECRET).await;

        response.assert_status_ok();
        let ack: Value = response.json();
        assert!(ack["text"].as_str().unwrap().contains("Looking up *web-01*"));
        assert!(ack.get("blocks").is_none());

        let (url, message) = tokio::time::timeout(Duration::from_secs(5), h.delivered.recv())
            .await
            .expect("delayed response was not delivered")
            .unwrap();
        assert_eq!(url, RESPONSE_URL);
        assert!(message.replace_original);
        assert!(serde_json::to_string(&message).unwrap().contains("e2-medium"));
        assert_eq!(h.store.calls(), 1);
    }

    #[tokio::test]
    async fn slow_lookup_with_foreign_response_url_is_not_delivered() {
        let config = Config {
            ack_deadline: Duration::from_millis(50),
            ..test_config()
        };
        let mut h = harness(
            FakeStore::with_records(vec![instance_record("web-01")])
                .delayed(Duration::from_millis(300)),
            config,
        );
        let body = command_body("/getinfo", "web-01", "http://169.254.169.254/latest");
        let response = post_signed(&h.server, &body, now(), TEST_SECRET).await;

        let json: Value = response.json();
        assert_eq!(json["text"], RETRY_MESSAGE);
        let delivered = tokio::time::timeout(Duration::from_millis(500), h.delivered.recv()).await;
        assert!(!matches!(delivered, Ok(Some(_))));
    }
}
