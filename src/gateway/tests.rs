use super::*;
use crate::bus::OutboundMessage;
use crate::config::BotSettings;
use crate::engine::Engine;
use crate::store::MemoryStore;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use std::sync::Mutex;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct RecordingEngine {
    seen: Mutex<Vec<(String, String, bool)>>,
    reply: Option<String>,
}

impl RecordingEngine {
    fn new(reply: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            reply: reply.map(String::from),
        })
    }

    fn seen(&self) -> Vec<(String, String, bool)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    async fn respond(
        &self,
        message: &InboundMessage,
        _bot: &BotParams,
        send: SendFn,
        extra: Option<&RelayAddress>,
    ) -> Result<(), GatewayError> {
        self.seen.lock().unwrap().push((
            message.publisher_id_conversation_id.clone(),
            message.text.clone(),
            extra.is_some(),
        ));
        if let Some(reply) = &self.reply {
            send(OutboundMessage::text(reply.clone())).await?;
        }
        Ok(())
    }
}

/// Replies after a delay, for exercising the typing race.
struct SlowEngine {
    delay: Duration,
}

#[async_trait]
impl Engine for SlowEngine {
    async fn respond(
        &self,
        _message: &InboundMessage,
        _bot: &BotParams,
        send: SendFn,
        _extra: Option<&RelayAddress>,
    ) -> Result<(), GatewayError> {
        tokio::time::sleep(self.delay).await;
        send(OutboundMessage::text("late reply")).await
    }
}

fn bot() -> BotParams {
    BotParams {
        publisher_id: "pub-1".into(),
        bot_id: "bot-1".into(),
        settings: BotSettings {
            messenger_app_secret: "secret".into(),
            messenger_page_access_token: "page-token".into(),
            messenger_verify_token: "verify-me".into(),
            ..BotSettings::default()
        },
    }
}

fn state_with(server: &MockServer, engine: Arc<dyn Engine>, typing_delay: Duration) -> AppState {
    let client = reqwest::Client::new();
    let tracker = Tracker::new(client.clone());
    let registry = Arc::new(ConnectionRegistry::new());
    let messenger = Arc::new(MessengerChannel::with_base(
        client.clone(),
        tracker.clone(),
        server.uri(),
    ));
    let relay = Arc::new(
        RelayChannel::new(client.clone(), tracker.clone()).with_chunk_pacing(Duration::ZERO),
    );
    let web = Arc::new(WebChannel::new(registry.clone(), client, tracker.clone()));
    let store = Arc::new(MemoryStore::new());
    store.insert_bot(bot());
    AppState {
        store,
        engine,
        dispatcher: Arc::new(Dispatcher::new(
            messenger.clone(),
            relay.clone(),
            web.clone(),
        )),
        messenger,
        relay,
        web,
        registry,
        tracker,
        typing_delay,
    }
}

fn sign(body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    let mut mac = Hmac::<sha1::Sha1>::new_from_slice(b"secret").unwrap();
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

fn messenger_body() -> Vec<u8> {
    serde_json::json!({
        "object": "page",
        "entry": [{
            "id": "page-7",
            "messaging": [{
                "sender": { "id": "user-9" },
                "timestamp": 1700000000123i64,
                "message": { "mid": "mid-1", "text": "hello" },
            }],
        }],
    })
    .to_string()
    .into_bytes()
}

async fn mount_graph(server: &MockServer) {
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn graph_sends(server: &MockServer) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/me/messages")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_health_reports_version() {
    let server = MockServer::start().await;
    let app = router(state_with(&server, RecordingEngine::new(None), Duration::from_secs(30)));

    let response = app
        .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], crate::VERSION);
}

#[tokio::test]
async fn test_handshake_echoes_challenge() {
    let server = MockServer::start().await;
    let app = router(state_with(&server, RecordingEngine::new(None), Duration::from_secs(30)));

    let uri = "/webhooks/pub-1/bot-1/messenger?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=12345";
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"12345");
}

#[tokio::test]
async fn test_handshake_rejects_wrong_token() {
    let server = MockServer::start().await;
    let app = router(state_with(&server, RecordingEngine::new(None), Duration::from_secs(30)));

    let uri = "/webhooks/pub-1/bot-1/messenger?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345";
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_handshake_unknown_bot_is_not_found() {
    let server = MockServer::start().await;
    let app = router(state_with(&server, RecordingEngine::new(None), Duration::from_secs(30)));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/webhooks/pub-1/missing/messenger?hub.mode=subscribe")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_rejects_missing_signature_without_engine_call() {
    let server = MockServer::start().await;
    let engine = RecordingEngine::new(None);
    let app = router(state_with(&server, engine.clone(), Duration::from_secs(30)));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/pub-1/bot-1/messenger")
                .header("content-type", "application/json")
                .body(Body::from(messenger_body()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.seen().is_empty());
}

#[tokio::test]
async fn test_webhook_rejects_tampered_signature() {
    let server = MockServer::start().await;
    let engine = RecordingEngine::new(None);
    let app = router(state_with(&server, engine.clone(), Duration::from_secs(30)));

    let mut body = messenger_body();
    let signature = sign(&body);
    body.extend_from_slice(b" "); // tamper after signing

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/pub-1/bot-1/messenger")
                .header("content-type", "application/json")
                .header("x-hub-signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.seen().is_empty());
}

#[tokio::test]
async fn test_webhook_ignores_non_page_objects() {
    let server = MockServer::start().await;
    let engine = RecordingEngine::new(Some("hi back"));
    let app = router(state_with(&server, engine.clone(), Duration::from_secs(30)));

    let body = serde_json::json!({
        "object": "user",
        "entry": [{
            "id": "page-7",
            "messaging": [{
                "sender": { "id": "user-9" },
                "timestamp": 1700000000123i64,
                "message": { "mid": "mid-1", "text": "hello" },
            }],
        }],
    })
    .to_string()
    .into_bytes();
    let signature = sign(&body);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/pub-1/bot-1/messenger")
                .header("content-type", "application/json")
                .header("x-hub-signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.seen().is_empty());
}

#[tokio::test]
async fn test_webhook_acks_then_replies_through_graph() {
    let server = MockServer::start().await;
    mount_graph(&server).await;
    let engine = RecordingEngine::new(Some("hi back"));
    let app = router(state_with(&server, engine.clone(), Duration::from_secs(30)));

    let body = messenger_body();
    let signature = sign(&body);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/pub-1/bot-1/messenger")
                .header("content-type", "application/json")
                .header("x-hub-signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Processing happens after the ACK
    tokio::time::sleep(Duration::from_millis(400)).await;
    let seen = engine.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "pub-1::page-7::user-9");
    assert_eq!(seen[0].1, "hello");
    assert!(!seen[0].2, "messenger carries no relay address");

    let sends = graph_sends(&server).await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0]["message"]["text"], "hi back");
    assert_eq!(sends[0]["recipient"]["id"], "user-9");
}

#[tokio::test]
async fn test_typing_indicator_fires_for_slow_engine() {
    let server = MockServer::start().await;
    mount_graph(&server).await;
    let engine = Arc::new(SlowEngine {
        delay: Duration::from_millis(400),
    });
    let app = router(state_with(&server, engine, Duration::from_millis(50)));

    let body = messenger_body();
    let signature = sign(&body);
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri("/webhooks/pub-1/bot-1/messenger")
            .header("content-type", "application/json")
            .header("x-hub-signature", signature)
            .body(Body::from(body))
            .unwrap(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    let sends = graph_sends(&server).await;
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0]["sender_action"], "typing_on");
    assert_eq!(sends[1]["message"]["text"], "late reply");
}

#[tokio::test]
async fn test_typing_indicator_suppressed_for_fast_engine() {
    let server = MockServer::start().await;
    mount_graph(&server).await;
    let engine = RecordingEngine::new(Some("fast"));
    let app = router(state_with(&server, engine, Duration::from_millis(100)));

    let body = messenger_body();
    let signature = sign(&body);
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri("/webhooks/pub-1/bot-1/messenger")
            .header("content-type", "application/json")
            .header("x-hub-signature", signature)
            .body(Body::from(body))
            .unwrap(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let sends = graph_sends(&server).await;
    assert_eq!(sends.len(), 1, "no typing indicator expected");
    assert_eq!(sends[0]["message"]["text"], "fast");
}

#[tokio::test]
async fn test_relay_webhook_replies_to_service_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v3/conversations/conv-1/activities"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let engine = RecordingEngine::new(Some("relay reply"));
    let app = router(state_with(&server, engine.clone(), Duration::from_secs(30)));

    let activity = serde_json::json!({
        "type": "message",
        "id": "act-1",
        "channelId": "telegram",
        "from": { "id": "tg-1", "name": "Ada" },
        "recipient": { "id": "bot-9" },
        "conversation": { "id": "conv-1" },
        "serviceUrl": server.uri(),
        "text": "hi bot",
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/pub-1/bot-1/relay")
                .header("content-type", "application/json")
                .body(Body::from(activity.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let seen = engine.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, "hi bot");
    assert!(seen[0].2, "relay hands the reply address to the engine");

    let activities: Vec<serde_json::Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().ends_with("/activities"))
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0]["text"], "relay reply");
}

#[tokio::test]
async fn test_relay_webhook_unknown_bot_is_not_found() {
    let server = MockServer::start().await;
    let app = router(state_with(&server, RecordingEngine::new(None), Duration::from_secs(30)));

    let activity = serde_json::json!({
        "type": "message",
        "channelId": "slack",
        "conversation": { "id": "conv-1" },
        "serviceUrl": server.uri(),
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/pub-1/missing/relay")
                .header("content-type", "application/json")
                .body(Body::from(activity.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ws_route_requires_upgrade() {
    let server = MockServer::start().await;
    let app = router(state_with(&server, RecordingEngine::new(None), Duration::from_secs(30)));

    let response = app
        .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.status().is_client_error());
}
