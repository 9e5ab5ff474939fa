//! Binary entry point (§10): wires the platform adapter, event bus, the
//! configured tracker variant and the Stream Downloader Facade together into
//! a runnable process, and tears everything down cleanly on Ctrl-C.

mod cli;
mod config;
mod finalizer;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use cli::CliArgs;
use config::{Config, TrackerMode};
use finalizer::{FileStorageFinalizer, LoggingErrorSink};
use stream_tracker::facade::StreamDownloaderFacade;
use stream_tracker::polling::PollingTracker;
use stream_tracker::webhook::WebhookTracker;
use tracker_core::error::Error;
use tracker_core::events::EventBus;
use twitch_api::{HelixApi, TwitchApi};

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let _log_guard = logging::init(args.log_level.as_deref());

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "twitch-capture exited with an error");
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let overrides = args.overrides();
    let config = Config::load_with_overrides(&args.config, &overrides)?;

    tokio::fs::create_dir_all(&config.temp_dir).await?;
    tokio::fs::create_dir_all(&config.output_dir).await?;

    let callback_base = config.webhook_callback_base_url.clone().unwrap_or_default();
    let api: Arc<dyn TwitchApi> = Arc::new(HelixApi::new(
        &config.twitch_client_id,
        &config.twitch_client_secret,
        &callback_base,
    )?);

    let bus = EventBus::new();

    let finalizer = Arc::new(FileStorageFinalizer::new(PathBuf::from(&config.output_dir)));
    let error_sink = Arc::new(LoggingErrorSink);
    let facade = StreamDownloaderFacade::new(
        api.clone(),
        bus.clone(),
        finalizer,
        error_sink,
        PathBuf::from(&config.temp_dir),
        config.quality.clone(),
        config.stream_type()?,
        config.fetch_options(),
        config.live_period(),
    );
    facade.subscribe();

    info!(
        channels = ?config.channels,
        mode = ?config.tracker_mode,
        quality = %config.quality,
        "starting twitch-capture"
    );

    match config.tracker_mode {
        TrackerMode::Polling => run_polling(config, api, bus).await,
        TrackerMode::Webhook => run_webhook(config, api, bus).await,
    }
}

/// The polling tracker has no externally-visible state to tear down, so a
/// Ctrl-C simply cancels its loop in place (§5 "In-flight downloads are not
/// forcibly aborted by tracker stop; they conclude naturally").
async fn run_polling(config: Config, api: Arc<dyn TwitchApi>, bus: EventBus) -> anyhow::Result<()> {
    let mut tracker = PollingTracker::new(config.channels.clone(), api, bus, config.poll_period());

    tokio::select! {
        res = tracker.run() => res.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, stopping polling tracker");
            tracker.stop();
            Ok(())
        }
    }
}

/// The webhook tracker holds a live subscription with the upstream hub, so
/// shutdown must run `unsubscribe` for every still-subscribed channel before
/// the process exits (§4.6 `stop()`); the server is driven from a background
/// task so the stop signal can be delivered while `run()` finishes its
/// teardown.
async fn run_webhook(config: Config, api: Arc<dyn TwitchApi>, bus: EventBus) -> anyhow::Result<()> {
    let callback_base = config
        .webhook_callback_base_url
        .clone()
        .ok_or_else(|| Error::config_missing("webhook_callback_base_url"))?;
    let bind_addr = format!("{}:{}", config.webhook_bind, config.webhook_port);

    let tracker = Arc::new(WebhookTracker::new(
        config.channels.clone(),
        api,
        bus,
        bind_addr,
        callback_base,
        config.webhook_lease_seconds,
    ));

    let server = tracker.clone();
    let handle = tokio::spawn(async move { server.run().await });

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, unsubscribing and shutting down webhook tracker");
    tracker.stop();

    handle.await??;
    Ok(())
}
