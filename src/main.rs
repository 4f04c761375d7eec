use anyhow::Context as _;
use chatgate::analytics::Tracker;
use chatgate::channels::dispatcher::Dispatcher;
use chatgate::channels::messenger::MessengerChannel;
use chatgate::channels::relay::RelayChannel;
use chatgate::channels::web::{ConnectionRegistry, WebChannel};
use chatgate::config::{Config, load_config};
use chatgate::engine::EchoEngine;
use chatgate::gateway::{AppState, router};
use chatgate::store::MemoryStore;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chatgate", version = chatgate::VERSION, about = "Multi-platform chat gateway")]
struct Args {
    /// Path to the TOML config file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatgate=info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    let port = args.port.unwrap_or(config.server.port);

    let client = reqwest::Client::new();
    let tracker = Tracker::new(client.clone());
    let registry = Arc::new(ConnectionRegistry::new());
    let messenger = Arc::new(MessengerChannel::new(client.clone(), tracker.clone()));
    let relay = Arc::new(RelayChannel::new(client.clone(), tracker.clone()));
    let web = Arc::new(WebChannel::new(registry.clone(), client, tracker.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        messenger.clone(),
        relay.clone(),
        web.clone(),
    ));

    let store = Arc::new(MemoryStore::new());
    for bot in &config.bots {
        info!("registering bot {}/{}", bot.publisher_id, bot.bot_id);
        store.insert_bot(bot.clone());
    }

    let state = AppState {
        store,
        engine: Arc::new(EchoEngine),
        dispatcher,
        messenger,
        relay,
        web,
        registry,
        tracker,
        typing_delay: Duration::from_secs(config.server.typing_indicator_delay_secs),
    };

    let addr = format!("{}:{}", config.server.host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("chatgate {} listening on {}", chatgate::VERSION, addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("ctrl-c handler failed: {}", e);
        return;
    }
    info!("shutting down");
}
