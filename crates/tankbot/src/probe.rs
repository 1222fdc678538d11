//! `tankbot probe`: talk to the feed directly and print what arrives.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tankconf::TankConfig;
use tankwatch::{FeedEvent, FeedTransport, LightstreamerConfig, LightstreamerTransport};
use tokio::sync::mpsc;

pub async fn run(config: &TankConfig, count: usize, timeout: Duration) -> Result<()> {
    let transport = LightstreamerTransport::new(LightstreamerConfig::from(&config.feed))
        .context("Failed to build feed transport")?;
    println!("Connecting to {}", transport.describe());

    let (tx, mut rx) = mpsc::channel(16);
    let connection = tokio::spawn(async move { transport.run(tx).await });

    let mut seen = 0;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while seen < count {
        let event = tokio::select! {
            _ = &mut deadline => bail!("No data within {:?} ({} of {} updates)", timeout, seen, count),
            event = rx.recv() => event,
        };

        match event {
            Some(FeedEvent::Connected) => println!("Session established"),
            Some(FeedEvent::Update(update)) => {
                seen += 1;
                println!(
                    "#{} value={} timestamp={} status={}",
                    update.sequence,
                    update.value.as_deref().unwrap_or("-"),
                    update.timestamp.as_deref().unwrap_or("-"),
                    update.status.as_deref().unwrap_or("-"),
                );
            }
            None => {
                let outcome = connection.await.context("Feed task panicked")?;
                match outcome {
                    Ok(()) => bail!("Feed closed after {} of {} updates", seen, count),
                    Err(e) => bail!("Feed failed after {} of {} updates: {}", seen, count, e),
                }
            }
        }
    }

    connection.abort();
    Ok(())
}
