use super::channel::Channel;
use super::fetch::CardImageFetch;
use serde::{Deserialize, Serialize};

/// The canonical inbound message every channel normalizes into.
/// Immutable once constructed; one instance per inbound platform event.
#[derive(Debug)]
pub struct InboundMessage {
    /// `publisherId::conversationId` composite key. Never empty.
    pub publisher_id_conversation_id: String,
    /// Epoch milliseconds, derived from the platform timestamp.
    pub creation_timestamp: i64,
    /// Platform message id, or a generated uuid for synthesized events
    /// (postbacks, web envelopes).
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    /// Always false for user-originated events.
    pub sender_is_bot: bool,
    pub channel: Channel,
    pub text: String,
    /// Image attachments reduced to their URL.
    pub cards: Option<Vec<InboundCard>>,
    /// One deferred fetch per image attachment. Each executes at most once;
    /// events whose images the engine never examines cost no downloads.
    pub fetch_card_images: Option<Vec<CardImageFetch>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundCard {
    pub image_url: String,
}

/// The canonical outbound message produced by the conversational engine.
/// This crate never mutates it, only projects it per channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cards: Option<Vec<Card>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
    /// Pure typing signal, no text.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub typing_on: bool,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn typing_on() -> Self {
        Self {
            typing_on: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
}

/// A quick reply or card button. A populated `url` makes it a URL action;
/// otherwise it is a postback action (`postback` falling back to `text`).
/// Never both — renderers check `url` first, matching that invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Plain-text stand-in for channels that cannot render this action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl Action {
    pub fn postback(text: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            postback: Some(payload.into()),
            url: None,
            fallback: None,
        }
    }

    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            postback: None,
            url: Some(url.into()),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }
}
