use crate::analytics::Tracker;
use crate::bus::{
    Channel, CardImageFetch, InboundCard, InboundMessage, OutboundMessage, compose_keys,
    decompose_keys,
};
use crate::channels::base::{ChannelSender, split_text_at_word, strip_markdown};
use crate::config::BotParams;
use crate::errors::GatewayError;
use crate::store::Conversation;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{Value, json};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha1 = Hmac<Sha1>;

pub const GRAPH_API_BASE: &str = "https://graph.facebook.com/v2.6";

/// The graph API rejects longer text messages.
const TEXT_CHUNK_LIMIT: usize = 320;
/// Generic templates cap out at ten elements.
const MAX_CARD_COUNT: usize = 10;

// ---------------------------------------------------------------------------
// Wire types

#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    pub id: String,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

/// One messaging event. Exactly one of `message`/`postback` is set for the
/// events this gateway handles; delivery/read receipts carry neither and are
/// skipped.
#[derive(Debug, Deserialize)]
pub struct MessagingEvent {
    pub sender: Identity,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub message: Option<MessageEvent>,
    #[serde(default)]
    pub postback: Option<PostbackEvent>,
}

#[derive(Debug, Deserialize)]
pub struct Identity {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageEvent {
    pub mid: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: AttachmentPayload,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentPayload {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct UserProfile {
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PostbackEvent {
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Webhook authentication

/// Validate the `X-Hub-Signature` header: HMAC-SHA1 over the exact raw body,
/// `sha1=<hex>` format, constant-time comparison. Must run before the body is
/// parsed for business logic.
pub fn verify_signature(app_secret: &str, signature: &str, body: &[u8]) -> bool {
    let Some(hex_sig) = signature.strip_prefix("sha1=") else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    expected.as_bytes().ct_eq(hex_sig.as_bytes()).into()
}

// ---------------------------------------------------------------------------
// Channel

pub struct MessengerChannel {
    client: reqwest::Client,
    graph_base: String,
    tracker: Tracker,
}

impl MessengerChannel {
    pub fn new(client: reqwest::Client, tracker: Tracker) -> Self {
        Self::with_base(client, tracker, GRAPH_API_BASE)
    }

    pub fn with_base(client: reqwest::Client, tracker: Tracker, base: impl Into<String>) -> Self {
        Self {
            client,
            graph_base: base.into(),
            tracker,
        }
    }

    /// Normalize one messaging event into the canonical inbound message.
    /// Postbacks become ordinary text messages with a generated id. Returns
    /// `None` for event kinds this gateway ignores (delivery receipts, optins).
    pub async fn normalize(
        &self,
        bot: &BotParams,
        entry_id: &str,
        event: &MessagingEvent,
    ) -> Option<InboundMessage> {
        let (mid, text, attachments) = if let Some(message) = &event.message {
            (
                message.mid.clone(),
                message.text.clone().unwrap_or_default(),
                message.attachments.as_deref(),
            )
        } else if let Some(postback) = &event.postback {
            // Button taps share the free-text shape, payload substituted for text
            (Uuid::new_v4().to_string(), postback.payload.clone(), None)
        } else {
            debug!("messenger: skipping unhandled messaging event");
            return None;
        };

        // Enrichment is best-effort: a profile fetch failure never aborts
        // message processing.
        let sender_name = match self.get_user_profile(bot, &event.sender.id).await {
            Ok(profile) => format!(
                "{} {}",
                profile.first_name.unwrap_or_default(),
                profile.last_name.unwrap_or_default()
            )
            .trim()
            .to_string(),
            Err(e) => {
                warn!("messenger: profile fetch for {} failed: {}", event.sender.id, e);
                String::new()
            }
        };

        let cards: Option<Vec<InboundCard>> = attachments.map(|atts| {
            atts.iter()
                .filter(|a| a.kind == "image")
                .filter_map(|a| a.payload.url.clone())
                .map(|image_url| InboundCard { image_url })
                .collect()
        });
        let cards = cards.filter(|c| !c.is_empty());

        let fetch_card_images = cards.as_ref().map(|cards| {
            cards
                .iter()
                .map(|card| {
                    let client = self.client.clone();
                    let url = card.image_url.clone();
                    CardImageFetch::new(move || {
                        let client = client.clone();
                        let url = url.clone();
                        async move { fetch_binary(&client, &url).await }
                    })
                })
                .collect()
        });

        let conversation_id = compose_keys(entry_id, &event.sender.id);
        Some(InboundMessage {
            publisher_id_conversation_id: compose_keys(&bot.publisher_id, &conversation_id),
            creation_timestamp: event.timestamp,
            id: mid,
            sender_id: event.sender.id.clone(),
            sender_name,
            sender_is_bot: false,
            channel: Channel::Messenger,
            text,
            cards,
            fetch_card_images,
        })
    }

    /// Render one canonical outbound message: typing indicator, then cards,
    /// then text/quick-replies, in that order.
    pub async fn send(
        &self,
        bot: &BotParams,
        conversation_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), GatewayError> {
        // conversation ids are pageId::senderId
        let Some((_page_id, recipient)) = decompose_keys(conversation_id) else {
            return Err(GatewayError::Config(format!(
                "malformed messenger conversation id: {}",
                conversation_id
            )));
        };

        if message.typing_on {
            self.call_send_api(
                bot,
                &json!({
                    "recipient": { "id": recipient },
                    "sender_action": "typing_on",
                }),
            )
            .await?;
        }

        if let Some(cards) = &message.cards {
            let elements: Vec<Value> = cards
                .iter()
                .take(MAX_CARD_COUNT)
                .enumerate()
                .map(|(i, card)| {
                    let buttons: Option<Vec<Value>> = card.actions.as_ref().map(|actions| {
                        actions
                            .iter()
                            .map(|a| {
                                if let Some(url) = &a.url {
                                    json!({ "type": "web_url", "title": a.text, "url": url })
                                } else {
                                    json!({
                                        "type": "postback",
                                        "title": a.text,
                                        "payload": a.postback.as_deref().unwrap_or(&a.text),
                                    })
                                }
                            })
                            .collect()
                    });
                    json!({
                        "title": card.title.clone().unwrap_or_else(|| (i + 1).to_string()),
                        "subtitle": card.subtitle,
                        "image_url": card.image_url,
                        "buttons": buttons,
                    })
                })
                .collect();

            if !elements.is_empty() {
                self.call_send_api(
                    bot,
                    &json!({
                        "recipient": { "id": recipient },
                        "message": {
                            "attachment": {
                                "type": "template",
                                "payload": {
                                    "template_type": "generic",
                                    "elements": elements,
                                }
                            }
                        }
                    }),
                )
                .await?;
            }
        }

        let quick_replies: Option<Vec<Value>> = message.actions.as_ref().map(|actions| {
            actions
                .iter()
                .map(|a| {
                    json!({
                        "content_type": "text",
                        "title": a.text,
                        "payload": a.postback.as_deref().unwrap_or(&a.text),
                    })
                })
                .collect()
        });

        let text = message.text.as_deref().unwrap_or("");
        let chunks = split_text_at_word(text, TEXT_CHUNK_LIMIT);
        let (last, but_last) = match chunks.split_last() {
            Some((last, rest)) => (Some(last.as_str()), rest),
            None => (None, &[] as &[String]),
        };

        for chunk in but_last {
            self.call_send_api(
                bot,
                &json!({
                    "recipient": { "id": recipient },
                    "message": { "text": strip_markdown(chunk) },
                }),
            )
            .await?;
        }

        if last.is_some() || quick_replies.is_some() {
            // The graph API rejects empty text alongside quick replies, so an
            // empty last chunk becomes a single space.
            let rendered = last.map(strip_markdown).unwrap_or_default();
            let rendered = if rendered.is_empty() {
                " ".to_string()
            } else {
                rendered
            };
            self.call_send_api(
                bot,
                &json!({
                    "recipient": { "id": recipient },
                    "message": {
                        "text": rendered,
                        "quick_replies": quick_replies,
                    }
                }),
            )
            .await?;
        }

        if !text.is_empty() {
            self.tracker
                .log_outgoing(bot, Channel::Messenger, conversation_id, text);
        }
        Ok(())
    }

    pub async fn send_typing(
        &self,
        bot: &BotParams,
        conversation_id: &str,
    ) -> Result<(), GatewayError> {
        self.send(bot, conversation_id, &OutboundMessage::typing_on())
            .await
    }

    async fn call_send_api(&self, bot: &BotParams, payload: &Value) -> Result<(), GatewayError> {
        let url = format!("{}/me/messages", self.graph_base);
        let response = self
            .client
            .post(&url)
            .query(&[("access_token", &bot.settings.messenger_page_access_token)])
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::delivery(status.as_u16(), body));
        }
        Ok(())
    }

    async fn get_user_profile(
        &self,
        bot: &BotParams,
        user_id: &str,
    ) -> Result<UserProfile, GatewayError> {
        let url = format!("{}/{}", self.graph_base, user_id);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("fields", "first_name,last_name,profile_pic"),
                (
                    "access_token",
                    bot.settings.messenger_page_access_token.as_str(),
                ),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::delivery(status.as_u16(), body));
        }
        Ok(response.json().await?)
    }
}

async fn fetch_binary(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, GatewayError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::delivery(status.as_u16(), body));
    }
    Ok(response.bytes().await?.to_vec())
}

#[async_trait]
impl ChannelSender for MessengerChannel {
    fn name(&self) -> &'static str {
        "messenger"
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
        MessengerChannel::send(self, bot, conversation_id, message).await
    }
}
