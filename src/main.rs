use anyhow::{Context, Result};
use clap::Parser;
use rsibot::broker::{Broker, InvestClient};
use rsibot::config::{BotConfig, StorageConfig};
use rsibot::engine::{DecisionEngine, EngineContext};
use rsibot::messaging::{ConfirmationGateway, Messenger, SessionId};
use rsibot::persistence::{
    split_store, FilePositionStore, PositionReader, PositionStore, RedisPositionStore,
};
use rsibot::telegram::{CommandHandler, TelegramClient, UpdateListener};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "rsibot")]
#[command(about = "RSI trading assistant with Telegram confirmation")]
#[command(version)]
struct Args {
    /// Path to configuration file (default: config/rsibot.toml, optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging();

    tracing::info!("🚀 RSI bot starting");

    let config = BotConfig::load(args.config.as_deref())?;
    log_config(&config);

    let (store, reader) = open_store(&config).await?;

    let broker: Arc<dyn Broker> = Arc::new(InvestClient::new(&config.broker)?);
    let telegram = TelegramClient::new(&config.telegram)?;
    let messenger: Arc<dyn Messenger> = Arc::new(telegram.clone());
    let gateway = Arc::new(ConfirmationGateway::new(messenger.clone()));
    let session = SessionId(config.telegram.chat_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The listener must be up before any tick, or confirmations could never be answered
    let listener_task = {
        let handler = CommandHandler::new(&config.instrument_id, broker.clone(), reader);
        let listener = UpdateListener::new(
            telegram,
            config.telegram.chat_id,
            config.telegram.long_poll_secs,
            handler,
            gateway.clone(),
        );
        let shutdown = wait_for_shutdown(shutdown_rx.clone());
        tokio::spawn(listener.run(shutdown))
    };

    let mut engine = DecisionEngine::new(
        &config.instrument_id,
        session,
        config.engine.clone(),
        EngineContext {
            broker,
            messenger,
            gateway,
            store,
        },
    )
    .await;

    if args.once {
        match engine.tick().await {
            Ok(outcome) => tracing::info!("✓ Tick finished: {:?}", outcome),
            Err(e) => tracing::error!("✗ Tick failed: {}", e),
        }
        let _ = shutdown_tx.send(true);
        let _ = listener_task.await;
        return Ok(());
    }

    let mut engine_task = tokio::spawn(engine.run(shutdown_rx));

    tracing::info!("✅ Engine and listener running");
    tracing::info!("\nPress Ctrl+C to stop...\n");

    let engine_finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
            false
        }
        result = &mut engine_task => {
            tracing::error!("Engine loop exited: {:?}", result);
            true
        }
    };

    let _ = shutdown_tx.send(true);
    if !engine_finished {
        // An order in flight is recorded before the engine stops
        if let Err(e) = engine_task.await {
            tracing::error!("Engine task failed: {}", e);
        }
    }
    let _ = listener_task.await;

    tracing::info!("👋 RSI bot stopped");
    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rsibot=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_config(config: &BotConfig) {
    let engine = &config.engine;
    tracing::info!("📋 Configuration:");
    tracing::info!("  Instrument: {}", config.instrument_id);
    tracing::info!(
        "  RSI window: {} over {} min, buy < {}, sell > {}",
        engine.rsi_window,
        engine.lookback_minutes,
        engine.buy_threshold,
        engine.sell_threshold
    );
    tracing::info!(
        "  Poll every {}s (retry {}s), confirm within {}s / {}s",
        engine.poll_interval_secs,
        engine.retry_interval_secs,
        engine.confirm_timeout_secs,
        engine.quantity_timeout_secs
    );
}

async fn open_store(
    config: &BotConfig,
) -> Result<(Arc<dyn PositionStore>, Arc<dyn PositionReader>)> {
    match &config.storage {
        StorageConfig::File { path } => {
            tracing::info!("💾 Position file: {}", path.display());
            Ok(split_store(FilePositionStore::new(path.clone())))
        }
        StorageConfig::Redis { url, key_prefix } => {
            let store = RedisPositionStore::new(url, key_prefix, &config.instrument_id)
                .await
                .context("Failed to connect to Redis")?;
            tracing::info!("✅ Connected to Redis");
            Ok(split_store(store))
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
