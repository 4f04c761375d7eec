use crate::bus::OutboundMessage;
use crate::channels::dispatcher::Dispatcher;
use crate::config::BotParams;
use crate::errors::GatewayError;
use crate::store::{Conversation, ConversationStore};
use futures_util::future::join_all;
use tracing::{info, warn};

/// Per-recipient outcome of one fan-out. One failed conversation never stops
/// the others; callers decide what to do with the failures.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failures: Vec<(String, GatewayError)>,
}

/// Fan one message out to every subscribed conversation of a bot, optionally
/// restricted to conversations subscribed to at least one of `categories`
/// (case-insensitive). Zero matching conversations is a successful no-op.
pub async fn broadcast(
    store: &dyn ConversationStore,
    dispatcher: &Dispatcher,
    bot: &BotParams,
    message: &OutboundMessage,
    categories: Option<&[String]>,
) -> Result<BroadcastReport, GatewayError> {
    let mut recipients: Vec<Conversation> = Vec::new();
    let mut start_key = None;
    loop {
        let page = store
            .query_conversations_page(&bot.publisher_id, &bot.bot_id, start_key)
            .await?;
        recipients.extend(
            page.items
                .into_iter()
                .filter(|c| matches_categories(&c.subscriptions, categories)),
        );
        start_key = page.last_key;
        if start_key.is_none() {
            break;
        }
    }

    if recipients.is_empty() {
        info!("broadcast for {} matched no conversations", bot.bot_id);
        return Ok(BroadcastReport::default());
    }

    let sends = recipients
        .iter()
        .map(|conversation| dispatcher.send(bot, conversation, message));
    let results = join_all(sends).await;

    let mut report = BroadcastReport {
        attempted: recipients.len(),
        ..BroadcastReport::default()
    };
    for (conversation, result) in recipients.iter().zip(results) {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(
                    "broadcast send to {} failed: {}",
                    conversation.bot_id_conversation_id, e
                );
                report
                    .failures
                    .push((conversation.bot_id_conversation_id.clone(), e));
            }
        }
    }
    info!(
        "broadcast for {}: {}/{} delivered",
        bot.bot_id, report.delivered, report.attempted
    );
    Ok(report)
}

/// No category restriction means every subscribed conversation matches;
/// otherwise the conversation must share at least one category, compared
/// case-insensitively.
fn matches_categories(subscriptions: &[String], categories: Option<&[String]>) -> bool {
    let Some(categories) = categories.filter(|c| !c.is_empty()) else {
        return true;
    };
    categories.iter().any(|category| {
        subscriptions
            .iter()
            .any(|s| s.to_lowercase() == category.to_lowercase())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::Tracker;
    use crate::bus::Channel;
    use crate::channels::messenger::MessengerChannel;
    use crate::channels::relay::RelayChannel;
    use crate::channels::web::{ConnectionRegistry, WebChannel};
    use crate::config::BotSettings;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn bot() -> BotParams {
        BotParams {
            publisher_id: "pub-1".into(),
            bot_id: "bot-1".into(),
            settings: BotSettings::default(),
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<ConnectionRegistry>) {
        let client = reqwest::Client::new();
        let tracker = Tracker::new(client.clone());
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::new(MessengerChannel::new(client.clone(), tracker.clone())),
            Arc::new(RelayChannel::new(client.clone(), tracker.clone())),
            Arc::new(WebChannel::new(registry.clone(), client, tracker)),
        );
        (dispatcher, registry)
    }

    fn web_conversation(id: &str, subscriptions: &[&str]) -> Conversation {
        Conversation {
            channel: Channel::Web,
            bot_id_conversation_id: format!("bot-1::{id}"),
            channel_data: None,
            subscribed: true,
            subscriptions: subscriptions.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_category_match_is_case_insensitive() {
        let subs = vec!["News".to_string(), "Sports".to_string()];
        assert!(matches_categories(&subs, Some(&["news".to_string()])));
        assert!(matches_categories(&subs, Some(&["SPORTS".to_string()])));
        assert!(!matches_categories(&subs, Some(&["weather".to_string()])));
    }

    #[test]
    fn test_no_categories_matches_everyone() {
        assert!(matches_categories(&[], None));
        assert!(matches_categories(&[], Some(&[])));
        assert!(matches_categories(&["news".to_string()], None));
    }

    #[tokio::test]
    async fn test_zero_subscribers_is_a_no_op() {
        let store = MemoryStore::new();
        let (dispatcher, _) = dispatcher();
        let report = broadcast(&store, &dispatcher, &bot(), &OutboundMessage::text("hi"), None)
            .await
            .unwrap();
        assert_eq!(report.attempted, 0);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_walks_every_page() {
        let store = MemoryStore::with_page_size(2);
        let (dispatcher, registry) = dispatcher();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let id = format!("conv-{i}");
            store.insert_conversation("pub-1", "bot-1", web_conversation(&id, &[]));
            let (tx, rx) = mpsc::unbounded_channel();
            registry.register(&id, tx);
            receivers.push(rx);
        }

        let report = broadcast(&store, &dispatcher, &bot(), &OutboundMessage::text("news"), None)
            .await
            .unwrap();
        assert_eq!(report.attempted, 5);
        assert_eq!(report.delivered, 5);
        for rx in &mut receivers {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn test_category_filter_narrows_recipients() {
        let store = MemoryStore::new();
        let (dispatcher, registry) = dispatcher();
        store.insert_conversation("pub-1", "bot-1", web_conversation("conv-a", &["News"]));
        store.insert_conversation("pub-1", "bot-1", web_conversation("conv-b", &["sports"]));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.register("conv-a", tx_a);
        registry.register("conv-b", tx_b);

        let categories = vec!["news".to_string()];
        let report = broadcast(
            &store,
            &dispatcher,
            &bot(),
            &OutboundMessage::text("headline"),
            Some(&categories),
        )
        .await
        .unwrap();
        assert_eq!(report.attempted, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_one_failure_never_blocks_the_rest() {
        let store = MemoryStore::new();
        let (dispatcher, registry) = dispatcher();
        store.insert_conversation("pub-1", "bot-1", web_conversation("conv-live", &[]));
        store.insert_conversation("pub-1", "bot-1", web_conversation("conv-dead", &[]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("conv-live", tx);

        let report = broadcast(&store, &dispatcher, &bot(), &OutboundMessage::text("hi"), None)
            .await
            .unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "bot-1::conv-dead");
        assert!(rx.try_recv().is_ok());
    }
}
