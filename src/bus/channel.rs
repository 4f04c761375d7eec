use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delimiter for composite keys (`publisherId::conversationId`,
/// `botId::conversationId`) and for messenger conversation ids
/// (`pageId::senderId`). `decompose_keys` splits on the first occurrence, so
/// the right-hand part may itself contain the delimiter.
const KEY_DELIMITER: &str = "::";

pub fn compose_keys(left: &str, right: &str) -> String {
    format!("{}{}{}", left, KEY_DELIMITER, right)
}

pub fn decompose_keys(composite: &str) -> Option<(&str, &str)> {
    composite.split_once(KEY_DELIMITER)
}

/// Every chat platform a conversation can live on. Relay channels are reached
/// through the shared bot-framework intermediary rather than a direct API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Messenger,
    CiscoSpark,
    Web,
    Skype,
    Slack,
    Telegram,
    Webchat,
    MsTeams,
    Email,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Messenger => "messenger",
            Self::CiscoSpark => "ciscospark",
            Self::Web => "web",
            Self::Skype => "skype",
            Self::Slack => "slack",
            Self::Telegram => "telegram",
            Self::Webchat => "webchat",
            Self::MsTeams => "msteams",
            Self::Email => "email",
        }
    }

    /// Channels reached through the generic bot-framework relay.
    pub fn is_relay(self) -> bool {
        matches!(
            self,
            Self::Skype | Self::Slack | Self::Telegram | Self::Webchat | Self::MsTeams
        )
    }

    /// Relay channels whose clients render hero cards and carousels. The
    /// rest get the plain-text degradation.
    pub fn supports_rich_cards(self) -> bool {
        matches!(
            self,
            Self::Telegram | Self::Skype | Self::Slack | Self::MsTeams | Self::Webchat
        )
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messenger" => Ok(Self::Messenger),
            "ciscospark" => Ok(Self::CiscoSpark),
            "web" => Ok(Self::Web),
            "skype" => Ok(Self::Skype),
            "slack" => Ok(Self::Slack),
            "telegram" => Ok(Self::Telegram),
            "webchat" => Ok(Self::Webchat),
            "msteams" => Ok(Self::MsTeams),
            "email" => Ok(Self::Email),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}
