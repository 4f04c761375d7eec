use crate::analytics::Tracker;
use crate::bus::{InboundMessage, decompose_keys};
use crate::channels::dispatcher::Dispatcher;
use crate::channels::messenger::{self, MessengerChannel};
use crate::channels::relay::{RelayActivity, RelayChannel, reply_address};
use crate::channels::typing::TypingRace;
use crate::channels::web::{ConnectionRegistry, WebChannel, WebEnvelope};
use crate::config::BotParams;
use crate::engine::{Engine, SendFn, boxed_send};
use crate::errors::GatewayError;
use crate::store::{ConversationStore, RelayAddress};
use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub engine: Arc<dyn Engine>,
    pub dispatcher: Arc<Dispatcher>,
    pub messenger: Arc<MessengerChannel>,
    pub relay: Arc<RelayChannel>,
    pub web: Arc<WebChannel>,
    pub registry: Arc<ConnectionRegistry>,
    pub tracker: Tracker,
    pub typing_delay: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/webhooks/{publisher_id}/{bot_id}/messenger",
            get(messenger_handshake).post(messenger_webhook),
        )
        .route("/webhooks/{publisher_id}/{bot_id}/relay", post(relay_webhook))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok", "version": crate::VERSION }))
}

// ---------------------------------------------------------------------------
// Messenger webhook

/// Subscription handshake: echo `hub.challenge` back when the verify token
/// matches, 403 otherwise.
async fn messenger_handshake(
    State(state): State<AppState>,
    Path((publisher_id, bot_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(bot) = lookup_bot(&state, &publisher_id, &bot_id).await else {
        return (StatusCode::NOT_FOUND, String::new());
    };

    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    if mode == Some("subscribe") && token == Some(bot.settings.messenger_verify_token.as_str()) {
        let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
        info!("messenger handshake accepted for {}/{}", publisher_id, bot_id);
        (StatusCode::OK, challenge)
    } else {
        warn!("messenger handshake rejected for {}/{}", publisher_id, bot_id);
        (StatusCode::FORBIDDEN, String::new())
    }
}

/// Signature check runs over the raw bytes before any parsing; processing is
/// spawned so the platform gets its ACK immediately.
async fn messenger_webhook(
    State(state): State<AppState>,
    Path((publisher_id, bot_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(bot) = lookup_bot(&state, &publisher_id, &bot_id).await else {
        return StatusCode::NOT_FOUND;
    };

    let signature = headers
        .get("x-hub-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !messenger::verify_signature(&bot.settings.messenger_app_secret, signature, &body) {
        warn!("messenger webhook signature rejected for {}/{}", publisher_id, bot_id);
        return StatusCode::FORBIDDEN;
    }

    let payload: messenger::WebhookBody = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("messenger webhook body unparseable: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    if payload.object != "page" {
        debug!("messenger webhook: ignoring object {:?}", payload.object);
        return StatusCode::OK;
    }

    // One task per event: the typing race keeps a task alive for the full
    // delay, so events must not queue behind each other.
    for entry in payload.entry {
        for event in entry.messaging {
            let state = state.clone();
            let bot = bot.clone();
            let entry_id = entry.id.clone();
            tokio::spawn(async move {
                process_messenger_event(&state, &bot, &entry_id, &event).await;
            });
        }
    }
    StatusCode::OK
}

async fn process_messenger_event(
    state: &AppState,
    bot: &BotParams,
    entry_id: &str,
    event: &messenger::MessagingEvent,
) {
    let Some(message) = state.messenger.normalize(bot, entry_id, event).await else {
        return;
    };
    state
        .tracker
        .log_incoming(bot, message.channel, &message.sender_id, &message.text);

    let Some((_publisher, conversation_id)) =
        decompose_keys(&message.publisher_id_conversation_id)
    else {
        return;
    };

    let send = {
        let messenger = state.messenger.clone();
        let bot = bot.clone();
        let conversation_id = conversation_id.to_string();
        boxed_send(move |outbound| {
            let messenger = messenger.clone();
            let bot = bot.clone();
            let conversation_id = conversation_id.clone();
            async move { messenger.send(&bot, &conversation_id, &outbound).await }
        })
    };
    let send_typing = {
        let messenger = state.messenger.clone();
        let bot = bot.clone();
        let conversation_id = conversation_id.to_string();
        move || async move { messenger.send_typing(&bot, &conversation_id).await }
    };

    drive_engine(state, bot, &message, None, send, send_typing).await;
}

// ---------------------------------------------------------------------------
// Relay webhook

/// Relay activities are authenticated upstream by the relay itself.
async fn relay_webhook(
    State(state): State<AppState>,
    Path((publisher_id, bot_id)): Path<(String, String)>,
    axum::Json(activity): axum::Json<RelayActivity>,
) -> impl IntoResponse {
    let Some(bot) = lookup_bot(&state, &publisher_id, &bot_id).await else {
        return StatusCode::NOT_FOUND;
    };

    tokio::spawn(async move {
        let Some(message) = state.relay.normalize(&bot, &activity) else {
            return;
        };
        state
            .tracker
            .log_incoming(&bot, message.channel, &message.sender_id, &message.text);

        let address = reply_address(&activity);
        let send = {
            let relay = state.relay.clone();
            let bot = bot.clone();
            let address = address.clone();
            boxed_send(move |outbound| {
                let relay = relay.clone();
                let bot = bot.clone();
                let address = address.clone();
                async move { relay.send_to_address(&bot, &address, &outbound).await }
            })
        };
        let send_typing = {
            let relay = state.relay.clone();
            let bot = bot.clone();
            let address = address.clone();
            move || async move {
                relay
                    .send_to_address(&bot, &address, &crate::bus::OutboundMessage::typing_on())
                    .await
            }
        };

        drive_engine(&state, &bot, &message, Some(&address), send, send_typing).await;
    });
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Web channel socket

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// One task per connection. The connection registers under the conversation
/// id of the first envelope it sends and is removed when the socket closes or
/// errors, so the registry only ever holds live connections.
async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut registered: Option<String> = None;
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let envelope: WebEnvelope = match serde_json::from_str(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!("web: dropping unparseable frame: {}", e);
                        continue;
                    }
                };
                if registered.as_deref() != Some(envelope.conversation_id.as_str()) {
                    if let Some(previous) = registered.replace(envelope.conversation_id.clone()) {
                        state.registry.remove(&previous);
                    }
                    state.registry.register(&envelope.conversation_id, tx.clone());
                }
                // Same per-event task rule as the webhooks: the socket loop
                // must keep reading while the typing race runs out.
                let state = state.clone();
                tokio::spawn(async move {
                    process_web_envelope(&state, &envelope).await;
                });
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(conversation_id) = registered {
        state.registry.remove(&conversation_id);
    }
    writer.abort();
}

async fn process_web_envelope(state: &AppState, envelope: &WebEnvelope) {
    let Some(bot) = lookup_bot(state, &envelope.publisher_id, &envelope.bot_id).await else {
        warn!(
            "web: no bot {}/{} for inbound frame",
            envelope.publisher_id, envelope.bot_id
        );
        return;
    };

    let message = state.web.normalize(&bot, envelope);
    state
        .tracker
        .log_incoming(&bot, message.channel, &message.sender_id, &message.text);

    let send = {
        let web = state.web.clone();
        let bot = bot.clone();
        let conversation_id = envelope.conversation_id.clone();
        boxed_send(move |outbound| {
            let web = web.clone();
            let bot = bot.clone();
            let conversation_id = conversation_id.clone();
            async move { web.send_to_conversation(&bot, &conversation_id, &outbound) }
        })
    };
    let send_typing = {
        let web = state.web.clone();
        let bot = bot.clone();
        let conversation_id = envelope.conversation_id.clone();
        move || async move {
            web.send_to_conversation(
                &bot,
                &conversation_id,
                &crate::bus::OutboundMessage::typing_on(),
            )
        }
    };

    drive_engine(state, &bot, &message, None, send, send_typing).await;
}

// ---------------------------------------------------------------------------
// Shared plumbing

async fn lookup_bot(state: &AppState, publisher_id: &str, bot_id: &str) -> Option<BotParams> {
    match state.store.get_bot(publisher_id, bot_id).await {
        Ok(bot) => bot,
        Err(e) => {
            warn!("bot lookup {}/{} failed: {}", publisher_id, bot_id, e);
            None
        }
    }
}

/// Run the engine against one inbound message with the typing race armed:
/// real responses are counted, and the race is always driven to completion so
/// a due indicator is never dropped.
async fn drive_engine<F, Fut>(
    state: &AppState,
    bot: &BotParams,
    message: &InboundMessage,
    extra: Option<&RelayAddress>,
    send: SendFn,
    send_typing: F,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
{
    let race = TypingRace::start(state.typing_delay, send_typing);
    let counter = race.counter();
    let counted_send: SendFn = Arc::new(move |outbound| {
        counter.note_response();
        send(outbound)
    });

    if let Err(e) = state
        .engine
        .respond(message, bot, counted_send, extra)
        .await
    {
        warn!(
            "engine failed for {}: {}",
            message.publisher_id_conversation_id, e
        );
    }
    race.finish().await;
}

#[cfg(test)]
mod tests;
