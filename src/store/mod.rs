use crate::bus::Channel;
use crate::config::BotParams;
use crate::errors::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// One chat thread, created by the storage collaborator on the first inbound
/// message. Read-only to this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub channel: Channel,
    /// `botId::conversationId` composite key.
    #[serde(rename = "botId_conversationId")]
    pub bot_id_conversation_id: String,
    /// Platform routing metadata required for cold sends on relay channels.
    #[serde(default, rename = "channelData", skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<ChannelData>,
    /// Broadcast opt-in.
    #[serde(default = "default_subscribed")]
    pub subscribed: bool,
    /// Broadcast categories this conversation opted into.
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

fn default_subscribed() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelData {
    pub address: RelayAddress,
}

/// A bot-framework reply address, stored verbatim from the inbound activity
/// so cold sends can be issued outside a live request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub channel_id: String,
    pub conversation: AccountRef,
    pub bot: AccountRef,
    pub service_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One page of a conversation scan. `last_key` is an opaque continuation
/// token; `None` means the scan is exhausted.
#[derive(Debug, Default)]
pub struct ConversationPage {
    pub items: Vec<Conversation>,
    pub last_key: Option<String>,
}

/// Read access to externally persisted bot and conversation records.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_bot(
        &self,
        publisher_id: &str,
        bot_id: &str,
    ) -> Result<Option<BotParams>, GatewayError>;

    /// One page of the bot's conversations, filtered server-side to
    /// currently-subscribed ones.
    async fn query_conversations_page(
        &self,
        publisher_id: &str,
        bot_id: &str,
        start_key: Option<String>,
    ) -> Result<ConversationPage, GatewayError>;
}

/// In-memory store backing the binary and the tests. Conversations are keyed
/// by `(publisher_id, bot_id)`; pagination slices by a numeric offset token.
pub struct MemoryStore {
    bots: Mutex<HashMap<(String, String), BotParams>>,
    conversations: Mutex<HashMap<(String, String), Vec<Conversation>>>,
    page_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            bots: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    pub fn insert_bot(&self, bot: BotParams) {
        let key = (bot.publisher_id.clone(), bot.bot_id.clone());
        self.bots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key, bot);
    }

    pub fn insert_conversation(
        &self,
        publisher_id: &str,
        bot_id: &str,
        conversation: Conversation,
    ) {
        self.conversations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry((publisher_id.to_string(), bot_id.to_string()))
            .or_default()
            .push(conversation);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_bot(
        &self,
        publisher_id: &str,
        bot_id: &str,
    ) -> Result<Option<BotParams>, GatewayError> {
        let bots = self
            .bots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(bots
            .get(&(publisher_id.to_string(), bot_id.to_string()))
            .cloned())
    }

    async fn query_conversations_page(
        &self,
        publisher_id: &str,
        bot_id: &str,
        start_key: Option<String>,
    ) -> Result<ConversationPage, GatewayError> {
        let offset: usize = match start_key {
            Some(key) => key
                .parse()
                .map_err(|_| GatewayError::Config(format!("bad page token: {}", key)))?,
            None => 0,
        };

        let conversations = self
            .conversations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let subscribed: Vec<Conversation> = conversations
            .get(&(publisher_id.to_string(), bot_id.to_string()))
            .map(|all| all.iter().filter(|c| c.subscribed).cloned().collect())
            .unwrap_or_default();

        let items: Vec<Conversation> = subscribed
            .iter()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();
        let next = offset + items.len();
        let last_key = (next < subscribed.len()).then(|| next.to_string());

        Ok(ConversationPage { items, last_key })
    }
}
