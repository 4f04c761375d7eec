use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable per-request bot configuration, loaded from the store.
/// Never mutated by this crate.
#[derive(Clone, Serialize, Deserialize)]
pub struct BotParams {
    #[serde(rename = "publisherId")]
    pub publisher_id: String,
    #[serde(rename = "botId")]
    pub bot_id: String,
    #[serde(default)]
    pub settings: BotSettings,
}

impl fmt::Debug for BotParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotParams")
            .field("publisher_id", &self.publisher_id)
            .field("bot_id", &self.bot_id)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Platform credentials and integration keys for one bot.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct BotSettings {
    #[serde(default, rename = "messengerAppSecret")]
    pub messenger_app_secret: String,
    #[serde(default, rename = "messengerPageAccessToken")]
    pub messenger_page_access_token: String,
    #[serde(default, rename = "messengerVerifyToken")]
    pub messenger_verify_token: String,
    #[serde(default, rename = "microsoftAppId")]
    pub microsoft_app_id: String,
    #[serde(default, rename = "microsoftAppPassword")]
    pub microsoft_app_password: String,
    #[serde(default, rename = "dashbotGenericKey", skip_serializing_if = "Option::is_none")]
    pub dashbot_generic_key: Option<String>,
    #[serde(default, rename = "dashbotFacebookKey", skip_serializing_if = "Option::is_none")]
    pub dashbot_facebook_key: Option<String>,
}

// Secrets are redacted from Debug output so request logging can't leak them.
impl fmt::Debug for BotSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(value: &str) -> &'static str {
            if value.is_empty() { "<unset>" } else { "<redacted>" }
        }
        f.debug_struct("BotSettings")
            .field("messenger_app_secret", &redact(&self.messenger_app_secret))
            .field(
                "messenger_page_access_token",
                &redact(&self.messenger_page_access_token),
            )
            .field("messenger_verify_token", &redact(&self.messenger_verify_token))
            .field("microsoft_app_id", &self.microsoft_app_id)
            .field("microsoft_app_password", &redact(&self.microsoft_app_password))
            .field("dashbot_generic_key", &self.dashbot_generic_key.is_some())
            .field("dashbot_facebook_key", &self.dashbot_facebook_key.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Delay before the typing-indicator race fires, in seconds.
    #[serde(default = "default_typing_delay", rename = "typingIndicatorDelaySecs")]
    pub typing_indicator_delay_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_typing_delay() -> u64 {
    4
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            typing_indicator_delay_secs: default_typing_delay(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Bots seeded into the in-memory store at startup.
    #[serde(default)]
    pub bots: Vec<BotParams>,
}
