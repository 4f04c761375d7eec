use crate::bus::{InboundMessage, OutboundMessage};
use crate::config::BotParams;
use crate::errors::GatewayError;
use crate::store::RelayAddress;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// The bound per-conversation sender handed to the engine. Every invocation
/// renders one canonical outbound message on the conversation's channel.
pub type SendFn =
    Arc<dyn Fn(OutboundMessage) -> BoxFuture<'static, Result<(), GatewayError>> + Send + Sync>;

/// Adapt an async closure into a [`SendFn`].
pub fn boxed_send<F, Fut>(f: F) -> SendFn
where
    F: Fn(OutboundMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), GatewayError>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// The conversational/NLU collaborator. It decides what to reply; this crate
/// only normalizes what goes in and renders what comes out.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Handle one inbound message, invoking `send` zero or more times.
    /// `extra` carries channel-specific routing context (the relay reply
    /// address) needed only for that channel's cold-send path.
    async fn respond(
        &self,
        message: &InboundMessage,
        bot: &BotParams,
        send: SendFn,
        extra: Option<&RelayAddress>,
    ) -> Result<(), GatewayError>;
}

/// Minimal built-in engine so the binary runs without an external NLU
/// backend: echoes the inbound text back.
pub struct EchoEngine;

#[async_trait]
impl Engine for EchoEngine {
    async fn respond(
        &self,
        message: &InboundMessage,
        _bot: &BotParams,
        send: SendFn,
        _extra: Option<&RelayAddress>,
    ) -> Result<(), GatewayError> {
        if message.text.is_empty() {
            return Ok(());
        }
        send(OutboundMessage::text(message.text.clone())).await
    }
}
