// Shared by several integration test binaries; not every binary uses it all.
#![allow(dead_code)]

use async_trait::async_trait;
use chatgate::GatewayError;
use chatgate::analytics::Tracker;
use chatgate::bus::{InboundMessage, OutboundMessage};
use chatgate::channels::dispatcher::Dispatcher;
use chatgate::channels::messenger::MessengerChannel;
use chatgate::channels::relay::RelayChannel;
use chatgate::channels::web::{ConnectionRegistry, WebChannel};
use chatgate::config::{BotParams, BotSettings};
use chatgate::engine::{Engine, SendFn};
use chatgate::gateway::AppState;
use chatgate::store::{MemoryStore, RelayAddress};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::MockServer;

/// Captures everything the gateway hands to the engine and optionally sends
/// a scripted reply back.
pub struct RecordingEngine {
    seen: Mutex<Vec<SeenMessage>>,
    reply: Option<String>,
}

#[derive(Clone)]
pub struct SeenMessage {
    pub key: String,
    pub text: String,
    pub sender_name: String,
    pub has_relay_address: bool,
}

impl RecordingEngine {
    pub fn new(reply: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            reply: reply.map(String::from),
        })
    }

    pub fn seen(&self) -> Vec<SeenMessage> {
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
        self.seen.lock().unwrap().push(SeenMessage {
            key: message.publisher_id_conversation_id.clone(),
            text: message.text.clone(),
            sender_name: message.sender_name.clone(),
            has_relay_address: extra.is_some(),
        });
        if let Some(reply) = &self.reply {
            send(OutboundMessage::text(reply.clone())).await?;
        }
        Ok(())
    }
}

pub fn test_bot() -> BotParams {
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

/// App state wired against one mock server standing in for every platform
/// API, with a long typing delay so indicators never interfere unless a test
/// opts in.
pub fn test_state(server: &MockServer, engine: Arc<dyn Engine>) -> AppState {
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
    store.insert_bot(test_bot());
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
        typing_delay: Duration::from_secs(60),
    }
}

/// `sha1=<hex>` signature over `body` with the test bot's app secret.
pub fn sign_webhook(body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    let mut mac =
        Hmac::<sha1::Sha1>::new_from_slice(b"secret").expect("hmac accepts any key length");
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}
