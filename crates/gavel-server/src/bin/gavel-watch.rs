// Spectator for a running gavel auction.
//
// Usage: gavel-watch [ws://host:port]
// Without an argument the server address comes from config/gavel.toml.

use anyhow::Context;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::info;

use gavel_core::config;
use gavel_server::observer::{self, ObserverSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let config = config::load_config().context("failed to load configuration")?;
    let mut settings = ObserverSettings::from_config(&config);
    if let Some(url) = std::env::args().nth(1) {
        settings.url = url;
    }
    info!("Watching {}", settings.url);

    let (tx, mut rx) = mpsc::channel(64);
    let watcher = tokio::spawn(observer::watch(settings, tx));

    loop {
        tokio::select! {
            update = rx.recv() => {
                let Some(view) = update else { break };
                match view.state() {
                    Some(state) => println!("[{}] {}", view.status(), observer::summarize(state, Utc::now())),
                    None => println!("[{}] no auction yet", view.status()),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    watcher.abort();
    Ok(())
}

/// Log to stderr; stdout carries the auction summaries.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gavel_server=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
