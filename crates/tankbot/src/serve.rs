//! `tankbot run`: wire config, feed, Telegram and the monitor together.

use std::sync::Arc;

use anyhow::{Context, Result};
use tankconf::TankConfig;
use tankwatch::{LightstreamerConfig, LightstreamerTransport, Monitor, MonitorConfig, SubscriberRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::health;
use crate::poller::Poller;
use crate::telegram::TelegramClient;

pub async fn run(config: TankConfig) -> Result<()> {
    let monitor_config = MonitorConfig::try_from(&config).context("Invalid configuration")?;
    let token = config.telegram_token().context("Telegram bot token not configured")?;

    let subscribers_file = config.paths.subscribers_file();
    let registry = SubscriberRegistry::with_file(&subscribers_file)
        .with_context(|| format!("Failed to load subscribers from {}", subscribers_file.display()))?;

    let telegram = Arc::new(
        TelegramClient::new(&config.telegram.api_base, token).context("Failed to build Telegram client")?,
    );
    let bot_username = match telegram.get_me().await {
        Ok(me) => {
            info!("Bot identity: @{}", me.username.as_deref().unwrap_or(&me.first_name));
            me.username
        }
        Err(e) => {
            warn!("getMe failed, accepting commands for any bot name: {}", e);
            None
        }
    };

    let transport = LightstreamerTransport::new(LightstreamerConfig::from(&config.feed))
        .context("Failed to build feed transport")?;

    info!("🚽 tankbot starting");
    info!("   Feed: {} item {}", config.feed.server, config.feed.item);
    info!("   Threshold: {}", monitor_config.threshold);
    info!("   Subscribers: {} ({})", registry.len(), subscribers_file.display());

    let monitor = Arc::new(Monitor::new(
        monitor_config,
        Arc::new(transport),
        telegram.clone(),
        Arc::new(registry),
    ));
    monitor.start()?;

    let cancel = CancellationToken::new();

    let poller = Poller::new(
        Arc::clone(&telegram),
        Arc::clone(&monitor),
        bot_username,
        config.telegram.poll_timeout_secs,
    )
    .spawn(cancel.clone());

    let health_server = config.bind.health_port.map(|port| {
        let monitor = Arc::clone(&monitor);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, monitor, cancel).await {
                error!("{:#}", e);
            }
        })
    });

    info!("🚽 tankbot ready");
    shutdown_signal().await;

    cancel.cancel();
    monitor.shutdown().await;
    if let Err(e) = poller.await {
        warn!("Poller ended abnormally: {}", e);
    }
    if let Some(handle) = health_server {
        if let Err(e) = handle.await {
            warn!("Health server ended abnormally: {}", e);
        }
    }

    let registry = Arc::clone(monitor.registry());
    match tokio::task::spawn_blocking(move || registry.save()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Final subscriber save failed: {}", e),
        Err(e) => warn!("Final subscriber save task failed: {}", e),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
