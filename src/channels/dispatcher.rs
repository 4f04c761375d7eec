use crate::bus::{Channel, OutboundMessage};
use crate::channels::base::ChannelSender;
use crate::channels::messenger::MessengerChannel;
use crate::channels::relay::RelayChannel;
use crate::channels::web::WebChannel;
use crate::config::BotParams;
use crate::errors::GatewayError;
use crate::store::Conversation;
use std::sync::Arc;

/// Routes an outbound message to the send strategy for the conversation's
/// stored channel. Every cold and broadcast send goes through here, so
/// channel-specific rendering is applied exactly once, in one place.
pub struct Dispatcher {
    messenger: Arc<MessengerChannel>,
    relay: Arc<RelayChannel>,
    web: Arc<WebChannel>,
}

impl Dispatcher {
    pub fn new(
        messenger: Arc<MessengerChannel>,
        relay: Arc<RelayChannel>,
        web: Arc<WebChannel>,
    ) -> Self {
        Self {
            messenger,
            relay,
            web,
        }
    }

    pub fn sender_for(&self, channel: Channel) -> Result<&dyn ChannelSender, GatewayError> {
        match channel {
            Channel::Messenger => Ok(self.messenger.as_ref()),
            Channel::Web => Ok(self.web.as_ref()),
            channel if channel.is_relay() => Ok(self.relay.as_ref()),
            other => Err(GatewayError::UnsupportedChannel(other.to_string())),
        }
    }

    pub async fn send(
        &self,
        bot: &BotParams,
        conversation: &Conversation,
        message: &OutboundMessage,
    ) -> Result<(), GatewayError> {
        self.sender_for(conversation.channel)?
            .send(bot, conversation, message)
            .await
    }
}
