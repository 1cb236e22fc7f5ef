//! Watch command — keep the registry live and report configuration changes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use libreg::tracker::{DirectoryWatcher, TrackedDirectory};
use libreg::{ChangeSource, FileEvent, RegistryConfig};

use super::common::open_registry;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_SUMMARY_SECS: u64 = 30 * 24 * 3600;

/// Parse interval string like "1h", "30m", "15m", "60s" into seconds.
pub fn parse_interval(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();
    if let Some(hours) = s.strip_suffix('h') {
        let n: u64 = hours.parse().with_context(|| "Invalid hours value")?;
        n.checked_mul(3600).context("Interval too large")
    } else if let Some(mins) = s.strip_suffix('m') {
        let n: u64 = mins.parse().with_context(|| "Invalid minutes value")?;
        n.checked_mul(60).context("Interval too large")
    } else if let Some(secs) = s.strip_suffix('s') {
        let n: u64 = secs.parse().with_context(|| "Invalid seconds value")?;
        Ok(n)
    } else {
        s.parse::<u64>()
            .with_context(|| "Invalid interval. Use formats like 1h, 30m, or 60s")
    }
}

/// The watcher (or poller) is the only consumer of the change source, so
/// every applied change gets printed.
fn watch_config(config: &RegistryConfig) -> RegistryConfig {
    RegistryConfig {
        check_on_read: false,
        ..config.clone()
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

pub(crate) async fn cmd_watch(config: &RegistryConfig, summary: Option<String>) -> Result<()> {
    let summary_secs = match summary.as_deref() {
        Some(interval) => Some(parse_interval(interval)?.clamp(1, MAX_SUMMARY_SECS)),
        None => None,
    };

    std::fs::create_dir_all(&config.etc_dir).with_context(|| {
        format!(
            "Failed to create configuration directory: {}",
            config.etc_dir.display()
        )
    })?;

    let config = &watch_config(config);
    let (registry, tracked) = open_registry(config).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut poller = None;
    let _watcher = if config.watch {
        Some(
            DirectoryWatcher::start(tracked, tx)
                .with_context(|| "Failed to start configuration watcher")?,
        )
    } else {
        poller = Some(spawn_poller(tracked, tx));
        None
    };

    println!(
        "Watching: {} ({})",
        config.etc_dir.display(),
        if config.watch { "notify" } else { "polling" }
    );
    println!("Libraries: {}", registry.len().await);
    if let Some(secs) = summary_secs {
        println!("Summary every {}s", secs);
    }
    println!();
    println!("Press Ctrl+C to stop.");
    println!();

    // Only polled when a summary interval was requested
    let mut ticker = tokio::time::interval(Duration::from_secs(summary_secs.unwrap_or(3600)));
    ticker.tick().await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                registry.on_file_event(event.reason, &event.path).await;
                println!(
                    "[{}] {} {} ({} libraries)",
                    timestamp(),
                    event.reason,
                    event.path.display(),
                    registry.len().await
                );
            }
            _ = ticker.tick(), if summary_secs.is_some() => {
                let libraries = registry.list_libraries().await;
                println!("[{}] {} libraries", timestamp(), libraries.len());
                for (name, type_tag) in &libraries {
                    println!("  {} ({})", name, type_tag);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("[{}] Stopping", timestamp());
                break;
            }
        }
    }

    if let Some(poller) = poller {
        poller.abort();
    }
    registry.close().await;
    Ok(())
}

/// Poll the directory when filesystem notifications are disabled.
fn spawn_poller(
    tracked: Arc<TrackedDirectory>,
    tx: mpsc::UnboundedSender<FileEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;
            let source = Arc::clone(&tracked);
            let events = match tokio::task::spawn_blocking(move || source.check()).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, "Directory poll failed");
                    continue;
                }
            };
            for event in events {
                if tx.send(event).is_err() {
                    return;
                }
            }
        }
    })
}
