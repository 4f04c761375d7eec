use crate::analytics::Tracker;
use crate::bus::{
    CardImageFetch, Channel, InboundCard, InboundMessage, OutboundMessage, compose_keys,
    decompose_keys,
};
use crate::channels::base::ChannelSender;
use crate::config::BotParams;
use crate::errors::GatewayError;
use crate::store::Conversation;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Live WebSocket connections keyed by conversation id. Registration replaces
/// any previous connection for the same conversation; connections are removed
/// when the socket closes or errors, and a send to a dead connection removes
/// it as a side effect.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conversation_id: &str, sender: mpsc::UnboundedSender<String>) {
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(conversation_id.to_string(), sender);
        debug!("web: registered connection for {}", conversation_id);
    }

    pub fn remove(&self, conversation_id: &str) {
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(conversation_id);
        debug!("web: removed connection for {}", conversation_id);
    }

    pub fn is_connected(&self, conversation_id: &str) -> bool {
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(conversation_id)
    }

    /// Serialize and push one frame to the live connection, failing when none
    /// is registered.
    pub fn send_json(
        &self,
        conversation_id: &str,
        value: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        let frame = value.to_string();
        let sender = {
            let connections = self
                .connections
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            connections.get(conversation_id).cloned()
        };
        let Some(sender) = sender else {
            return Err(GatewayError::MissingChannelData(format!(
                "no live web connection for {conversation_id}"
            )));
        };
        if sender.send(frame).is_err() {
            self.remove(conversation_id);
            return Err(GatewayError::MissingChannelData(format!(
                "web connection for {conversation_id} is gone"
            )));
        }
        Ok(())
    }
}

/// The JSON frame a web client sends over the socket.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebEnvelope {
    pub publisher_id: String,
    pub bot_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub text: String,
    /// Epoch milliseconds; server time when omitted.
    #[serde(default)]
    pub creation_timestamp: Option<i64>,
    #[serde(default)]
    pub cards: Option<Vec<InboundCard>>,
}

pub struct WebChannel {
    registry: Arc<ConnectionRegistry>,
    client: reqwest::Client,
    tracker: Tracker,
}

impl WebChannel {
    pub fn new(registry: Arc<ConnectionRegistry>, client: reqwest::Client, tracker: Tracker) -> Self {
        Self {
            registry,
            client,
            tracker,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Normalize one envelope into the canonical inbound message. Web frames
    /// carry no platform message id, so one is generated.
    pub fn normalize(&self, bot: &BotParams, envelope: &WebEnvelope) -> InboundMessage {
        let cards = envelope.cards.clone().filter(|c| !c.is_empty());
        let fetch_card_images = cards.as_ref().map(|cards| {
            cards
                .iter()
                .map(|card| {
                    let client = self.client.clone();
                    let url = card.image_url.clone();
                    CardImageFetch::new(move || {
                        let client = client.clone();
                        let url = url.clone();
                        async move { card_image_bytes(&client, &url).await }
                    })
                })
                .collect()
        });

        InboundMessage {
            publisher_id_conversation_id: compose_keys(
                &bot.publisher_id,
                &envelope.conversation_id,
            ),
            creation_timestamp: envelope
                .creation_timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            id: Uuid::new_v4().to_string(),
            sender_id: envelope.sender_id.clone(),
            sender_name: format!("web user {}", envelope.sender_id),
            sender_is_bot: false,
            channel: Channel::Web,
            text: envelope.text.clone(),
            cards,
            fetch_card_images,
        }
    }

    /// JSON pass-through: the canonical outbound message is the wire format.
    pub fn send_to_conversation(
        &self,
        bot: &BotParams,
        conversation_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), GatewayError> {
        let value = serde_json::to_value(message)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("web frame encode: {e}")))?;
        self.registry.send_json(conversation_id, &value)?;
        if let Some(text) = &message.text {
            self.tracker.log_outgoing(bot, Channel::Web, conversation_id, text);
        }
        Ok(())
    }
}

/// Inline `data:` URLs decode locally; anything else is fetched.
async fn card_image_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, GatewayError> {
    if url.starts_with("data:") {
        let payload = url
            .split_once("base64,")
            .map(|(_, p)| p)
            .ok_or_else(|| GatewayError::Config(format!("unsupported data url: {url}")))?;
        return BASE64
            .decode(payload)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("invalid base64 image: {e}")));
    }
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::delivery(status.as_u16(), body));
    }
    Ok(response.bytes().await?.to_vec())
}

#[async_trait]
impl ChannelSender for WebChannel {
    fn name(&self) -> &'static str {
        "web"
    }

    async fn send(
        &self,
        bot: &BotParams,
        conversation: &Conversation,
        message: &OutboundMessage,
    ) -> Result<(), GatewayError> {
        let Some((_bot_id, conversation_id)) =
            decompose_keys(&conversation.bot_id_conversation_id)
        else {
            return Err(GatewayError::Config(format!(
                "malformed conversation key: {}",
                conversation.bot_id_conversation_id
            )));
        };
        self.send_to_conversation(bot, conversation_id, message)
    }
}
