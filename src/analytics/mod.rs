//! Best-effort event tracking. Calls are fired in parallel with message
//! delivery and their failure never aborts it.

use crate::bus::Channel;
use crate::config::BotParams;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_TRACKER_BASE: &str = "https://tracker.dashbot.io";
const TRACKER_VERSION: &str = "0.7.4-rest";

#[derive(Clone)]
pub struct Tracker {
    client: reqwest::Client,
    base: Arc<String>,
}

impl Tracker {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base(client, DEFAULT_TRACKER_BASE)
    }

    pub fn with_base(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: Arc::new(base.into()),
        }
    }

    pub fn log_incoming(&self, bot: &BotParams, channel: Channel, user_id: &str, text: &str) {
        self.track(bot, channel, "incoming", user_id, text);
    }

    pub fn log_outgoing(&self, bot: &BotParams, channel: Channel, user_id: &str, text: &str) {
        self.track(bot, channel, "outgoing", user_id, text);
    }

    /// Fire-and-forget: spawns the request and only logs failures.
    fn track(&self, bot: &BotParams, channel: Channel, kind: &'static str, user_id: &str, text: &str) {
        let Some((platform, api_key)) = key_for(bot, channel) else {
            return;
        };
        let url = format!("{}/track", self.base);
        let client = self.client.clone();
        let body = serde_json::json!({ "text": text, "userId": user_id });
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .query(&[
                    ("type", kind),
                    ("platform", platform),
                    ("apiKey", api_key.as_str()),
                    ("v", TRACKER_VERSION),
                ])
                .json(&body)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!("tracked {} event on {}", kind, platform);
                }
                Ok(resp) => warn!("tracker answered {}", resp.status()),
                Err(e) => warn!("tracker call failed: {}", e),
            }
        });
    }
}

fn key_for(bot: &BotParams, channel: Channel) -> Option<(&'static str, String)> {
    if channel == Channel::Messenger {
        if let Some(key) = &bot.settings.dashbot_facebook_key {
            return Some(("facebook", key.clone()));
        }
    }
    bot.settings
        .dashbot_generic_key
        .as_ref()
        .map(|key| ("generic", key.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotSettings;

    fn bot(generic: Option<&str>, facebook: Option<&str>) -> BotParams {
        BotParams {
            publisher_id: "p".into(),
            bot_id: "b".into(),
            settings: BotSettings {
                dashbot_generic_key: generic.map(String::from),
                dashbot_facebook_key: facebook.map(String::from),
                ..BotSettings::default()
            },
        }
    }

    #[test]
    fn test_messenger_prefers_facebook_key() {
        let bot = bot(Some("gen"), Some("fb"));
        let (platform, key) = key_for(&bot, Channel::Messenger).unwrap();
        assert_eq!(platform, "facebook");
        assert_eq!(key, "fb");
    }

    #[test]
    fn test_relay_uses_generic_key() {
        let bot = bot(Some("gen"), Some("fb"));
        let (platform, key) = key_for(&bot, Channel::Telegram).unwrap();
        assert_eq!(platform, "generic");
        assert_eq!(key, "gen");
    }

    #[test]
    fn test_no_keys_means_no_tracking() {
        assert!(key_for(&bot(None, None), Channel::Messenger).is_none());
    }

    #[tokio::test]
    async fn test_track_posts_to_tracker() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/track"))
            .and(query_param("type", "outgoing"))
            .and(query_param("platform", "generic"))
            .and(query_param("apiKey", "gen"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let tracker = Tracker::with_base(reqwest::Client::new(), server.uri());
        tracker.log_outgoing(&bot(Some("gen"), None), Channel::Slack, "conv-1", "hello");

        // Fire-and-forget: give the spawned task a moment to land.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        server.verify().await;
    }
}
