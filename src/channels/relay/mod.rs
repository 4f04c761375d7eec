use crate::analytics::Tracker;
use crate::bus::{
    CardImageFetch, Channel, InboundCard, InboundMessage, OutboundMessage, compose_keys,
};
use crate::channels::base::{ChannelSender, split_text_at_word};
use crate::config::{BotParams, BotSettings};
use crate::errors::GatewayError;
use crate::store::{AccountRef, Conversation, RelayAddress};
use crate::utils::strip_zero_width;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// The relay accepts far larger texts than the graph API does.
const TEXT_CHUNK_LIMIT: usize = 4000;
/// Delay between successive text chunks so clients render them in order.
const CHUNK_PACING: Duration = Duration::from_millis(200);
const MIN_CAROUSEL_ITEMS: usize = 2;
const MAX_CAROUSEL_ITEMS: usize = 5;
const HERO_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.hero";

const DEFAULT_TOKEN_URL: &str =
    "https://login.microsoftonline.com/botframework.com/oauth2/v2.0/token";
const TOKEN_SCOPE: &str = "https://api.botframework.com/.default";
/// Refresh this long before the token actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Wire types

/// A bot-framework activity as delivered to the webhook. Only the fields this
/// gateway reads are modeled; outbound activities are built ad hoc.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayActivity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    /// RFC3339, assigned by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<AccountRef>,
    /// The bot account the activity was addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<AccountRef>,
    pub conversation: AccountRef,
    pub service_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<RelayAttachment>>,
    /// Raw platform event the relay tunnels through. Telegram keeps the
    /// sender's name only in here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayAttachment {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
}

/// The reply address of an activity, stored on the conversation so later
/// cold sends can reach the same thread.
pub fn reply_address(activity: &RelayActivity) -> RelayAddress {
    RelayAddress {
        id: activity.id.clone(),
        channel_id: activity.channel_id.clone(),
        conversation: activity.conversation.clone(),
        bot: activity.recipient.clone().unwrap_or(AccountRef {
            id: "bot".to_string(),
            name: None,
        }),
        service_url: activity.service_url.clone(),
    }
}

// ---------------------------------------------------------------------------
// Token service

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Client-credentials tokens for the relay's service endpoints, cached per
/// app id until shortly before expiry.
pub struct RelayAuth {
    client: reqwest::Client,
    token_url: String,
    cache: Mutex<HashMap<String, CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl RelayAuth {
    pub fn new(client: reqwest::Client, token_url: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn token(&self, settings: &BotSettings) -> Result<String, GatewayError> {
        {
            let cache = self
                .cache
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(cached) = cache.get(&settings.microsoft_app_id) {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", settings.microsoft_app_id.as_str()),
                ("client_secret", settings.microsoft_app_password.as_str()),
                ("scope", TOKEN_SCOPE),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Auth(format!(
                "relay token request answered {status}: {body}"
            )));
        }
        let token: TokenResponse = response.json().await?;

        let expires_at = Instant::now()
            + Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                settings.microsoft_app_id.clone(),
                CachedToken {
                    token: token.access_token.clone(),
                    expires_at,
                },
            );
        Ok(token.access_token)
    }
}

// ---------------------------------------------------------------------------
// Channel

pub struct RelayChannel {
    client: reqwest::Client,
    auth: Arc<RelayAuth>,
    tracker: Tracker,
    chunk_pacing: Duration,
}

impl RelayChannel {
    pub fn new(client: reqwest::Client, tracker: Tracker) -> Self {
        let auth = Arc::new(RelayAuth::new(client.clone(), DEFAULT_TOKEN_URL));
        Self {
            client,
            auth,
            tracker,
            chunk_pacing: CHUNK_PACING,
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.auth = Arc::new(RelayAuth::new(self.client.clone(), token_url));
        self
    }

    pub fn with_chunk_pacing(mut self, pacing: Duration) -> Self {
        self.chunk_pacing = pacing;
        self
    }

    /// Normalize one activity into the canonical inbound message. Returns
    /// `None` for non-message activities and for channel ids this gateway
    /// does not recognize.
    pub fn normalize(&self, bot: &BotParams, activity: &RelayActivity) -> Option<InboundMessage> {
        if activity.kind != "message" {
            debug!("relay: skipping {} activity", activity.kind);
            return None;
        }
        let Ok(channel) = activity.channel_id.parse::<Channel>() else {
            warn!("relay: unknown channel id {:?}", activity.channel_id);
            return None;
        };

        let text = strip_zero_width(activity.text.as_deref().unwrap_or_default());
        let sender_name = activity
            .from
            .as_ref()
            .and_then(|from| from.name.clone())
            .or_else(|| {
                // Telegram omits the name from the account and only ships it
                // in the tunneled source event
                (channel == Channel::Telegram)
                    .then(|| activity.channel_data.as_ref().and_then(telegram_sender_name))
                    .flatten()
            })
            .unwrap_or_else(|| "unknown".to_string());

        let creation_timestamp = activity
            .timestamp
            .as_deref()
            .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
            .map_or_else(
                || chrono::Utc::now().timestamp_millis(),
                |dt| dt.timestamp_millis(),
            );

        let cards: Option<Vec<InboundCard>> = activity.attachments.as_ref().map(|atts| {
            atts.iter()
                .filter(|a| a.content_type.starts_with("image"))
                .filter_map(|a| a.content_url.clone())
                .map(|image_url| InboundCard { image_url })
                .collect()
        });
        let cards = cards.filter(|c| !c.is_empty());

        // Skype serves attachment URLs behind the relay's auth; the other
        // channels serve plain URLs.
        let authed = channel == Channel::Skype && !bot.settings.microsoft_app_id.is_empty();
        let fetch_card_images = cards.as_ref().map(|cards| {
            cards
                .iter()
                .map(|card| {
                    let client = self.client.clone();
                    let url = card.image_url.clone();
                    let auth = authed.then(|| (self.auth.clone(), bot.settings.clone()));
                    CardImageFetch::new(move || {
                        let client = client.clone();
                        let url = url.clone();
                        let auth = auth.clone();
                        async move { fetch_attachment(&client, &url, auth.as_ref()).await }
                    })
                })
                .collect()
        });

        Some(InboundMessage {
            publisher_id_conversation_id: compose_keys(
                &bot.publisher_id,
                &activity.conversation.id,
            ),
            creation_timestamp,
            id: activity
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            sender_id: activity
                .from
                .as_ref()
                .map(|from| from.id.clone())
                .unwrap_or_default(),
            sender_name,
            sender_is_bot: false,
            channel,
            text,
            cards,
            fetch_card_images,
        })
    }

    /// Render one canonical outbound message to a reply address: typing
    /// indicator, then cards, then paced text chunks with quick replies on
    /// the last chunk.
    pub async fn send_to_address(
        &self,
        bot: &BotParams,
        address: &RelayAddress,
        message: &OutboundMessage,
    ) -> Result<(), GatewayError> {
        let rich = address
            .channel_id
            .parse::<Channel>()
            .map(Channel::supports_rich_cards)
            .unwrap_or(false);

        if message.typing_on {
            self.post_activity(bot, address, &json!({ "type": "typing" }))
                .await?;
        }

        if let Some(cards) = &message.cards {
            if rich {
                let attachments: Vec<Value> = cards.iter().map(hero_card).collect();
                if (MIN_CAROUSEL_ITEMS..=MAX_CAROUSEL_ITEMS).contains(&attachments.len()) {
                    self.post_activity(
                        bot,
                        address,
                        &json!({
                            "type": "message",
                            "attachmentLayout": "carousel",
                            "attachments": attachments,
                        }),
                    )
                    .await?;
                } else {
                    for attachment in attachments {
                        self.post_activity(
                            bot,
                            address,
                            &json!({ "type": "message", "attachments": [attachment] }),
                        )
                        .await?;
                    }
                }
            } else {
                for card in cards {
                    let text = degrade_card(card);
                    if !text.is_empty() {
                        self.post_activity(
                            bot,
                            address,
                            &json!({ "type": "message", "text": text }),
                        )
                        .await?;
                    }
                }
            }
        }

        // Quick replies ride the last text chunk. Without rich card support
        // the fallback list is folded into the text before chunking; postback
        // actions with no fallback are dropped entirely.
        let text = message.text.as_deref().unwrap_or("");
        let mut body = text.to_string();
        if !rich {
            if let Some(actions) = &message.actions {
                let fallbacks: Vec<String> = actions
                    .iter()
                    .filter_map(|a| {
                        a.fallback.clone().or_else(|| {
                            a.url.as_ref().map(|url| format!("{} ({})", a.text, url))
                        })
                    })
                    .collect();
                if !fallbacks.is_empty() {
                    if !body.is_empty() {
                        body.push('\n');
                    }
                    body.push_str(&format!("({})", fallbacks.join(", ")));
                }
            }
        }
        let buttons = message.actions.as_ref().filter(|_| rich).map(|actions| {
            json!([{
                "contentType": HERO_CARD_CONTENT_TYPE,
                "content": {
                    "buttons": actions.iter().map(action_button).collect::<Vec<Value>>(),
                },
            }])
        });

        let chunks = split_text_at_word(&body, TEXT_CHUNK_LIMIT);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 && !self.chunk_pacing.is_zero() {
                tokio::time::sleep(self.chunk_pacing).await;
            }
            let mut activity =
                json!({ "type": "message", "text": chunk, "textFormat": "markdown" });
            if i == last {
                if let Some(buttons) = &buttons {
                    activity["attachments"] = buttons.clone();
                }
            }
            self.post_activity(bot, address, &activity).await?;
        }
        if chunks.is_empty() {
            if let Some(buttons) = &buttons {
                self.post_activity(
                    bot,
                    address,
                    &json!({ "type": "message", "attachments": buttons }),
                )
                .await?;
            }
        }

        if !text.is_empty() {
            let channel = address
                .channel_id
                .parse::<Channel>()
                .unwrap_or(Channel::Webchat);
            self.tracker
                .log_outgoing(bot, channel, &address.conversation.id, text);
        }
        Ok(())
    }

    async fn post_activity(
        &self,
        bot: &BotParams,
        address: &RelayAddress,
        activity: &Value,
    ) -> Result<(), GatewayError> {
        let mut payload = activity.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("from".to_string(), json!({ "id": address.bot.id }));
            map.insert(
                "recipient".to_string(),
                json!({ "id": address.conversation.id }),
            );
        }

        let url = format!(
            "{}/v3/conversations/{}/activities",
            address.service_url.trim_end_matches('/'),
            address.conversation.id
        );
        let mut request = self.client.post(&url).json(&payload);
        if !bot.settings.microsoft_app_id.is_empty() {
            let token = self.auth.token(&bot.settings).await?;
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::delivery(status.as_u16(), body));
        }
        Ok(())
    }
}

fn telegram_sender_name(channel_data: &Value) -> Option<String> {
    let from = channel_data
        .get("message")
        .and_then(|m| m.get("from"))
        .or_else(|| channel_data.get("callback_query").and_then(|c| c.get("from")))?;
    let first = from.get("first_name").and_then(Value::as_str).unwrap_or("");
    let last = from.get("last_name").and_then(Value::as_str).unwrap_or("");
    let name = format!("{first} {last}").trim().to_string();
    (!name.is_empty()).then_some(name)
}

fn hero_card(card: &crate::bus::Card) -> Value {
    let buttons: Vec<Value> = card
        .actions
        .as_ref()
        .map(|actions| actions.iter().map(action_button).collect())
        .unwrap_or_default();
    let images: Vec<Value> = card
        .image_url
        .as_ref()
        .map(|url| vec![json!({ "url": url })])
        .unwrap_or_default();
    json!({
        "contentType": HERO_CARD_CONTENT_TYPE,
        "content": {
            "title": card.title,
            "subtitle": card.subtitle,
            "images": images,
            "buttons": buttons,
        },
    })
}

fn action_button(action: &crate::bus::Action) -> Value {
    if let Some(url) = &action.url {
        json!({ "type": "openUrl", "title": action.text, "value": url })
    } else {
        json!({
            "type": "imBack",
            "title": action.text,
            "value": action.postback.as_deref().unwrap_or(&action.text),
        })
    }
}

/// Plain-text stand-in for a card on channels without hero card support.
/// URL buttons keep their target; postback buttons appear only when they
/// carry a fallback.
fn degrade_card(card: &crate::bus::Card) -> String {
    let mut lines = Vec::new();
    if let Some(title) = &card.title {
        lines.push(title.clone());
    }
    if let Some(subtitle) = &card.subtitle {
        lines.push(subtitle.clone());
    }
    if let Some(url) = &card.image_url {
        lines.push(url.clone());
    }
    if let Some(actions) = &card.actions {
        for action in actions {
            if let Some(url) = &action.url {
                lines.push(format!("{} ({})", action.text, url));
            } else if let Some(fallback) = &action.fallback {
                lines.push(fallback.clone());
            }
        }
    }
    lines.join("\n")
}

async fn fetch_attachment(
    client: &reqwest::Client,
    url: &str,
    auth: Option<&(Arc<RelayAuth>, BotSettings)>,
) -> Result<Vec<u8>, GatewayError> {
    let mut request = client.get(url);
    if let Some((auth, settings)) = auth {
        let token = auth.token(settings).await?;
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::delivery(status.as_u16(), body));
    }
    Ok(response.bytes().await?.to_vec())
}

#[async_trait]
impl ChannelSender for RelayChannel {
    fn name(&self) -> &'static str {
        "relay"
    }

    /// Cold send: reach the thread through the reply address stored on the
    /// conversation at inbound time.
    async fn send(
        &self,
        bot: &BotParams,
        conversation: &Conversation,
        message: &OutboundMessage,
    ) -> Result<(), GatewayError> {
        let Some(data) = &conversation.channel_data else {
            return Err(GatewayError::MissingChannelData(
                conversation.bot_id_conversation_id.clone(),
            ));
        };
        self.send_to_address(bot, &data.address, message).await
    }
}
