// gavel auction server entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file)
// 2. Load config
// 3. Open the state store
// 4. Recover the stored auction, if any
// 5. Start the command processor
// 6. Import the lot catalog into a fresh auction
// 7. Spawn the WebSocket server task
// 8. Wait for Ctrl+C
// 9. Cleanup on exit

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};

use gavel_core::auction::lot::load_lots_csv;
use gavel_core::config;
use gavel_core::feed::ChangeFeed;
use gavel_core::store::{SharedStore, SqliteStore};
use gavel_server::app::{self, ProcessorSettings};
use gavel_server::ws_server::{self, ServerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing (log to file)
    init_tracing()?;
    info!("gavel starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: {}s bidding window, default budget {}, record '{}'",
        config.auction.bidding_window_secs,
        config.auction.default_budget,
        config.auction.record_name
    );

    // 3. Open the state store
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }
    let store: SharedStore = Arc::new(
        SqliteStore::open(&config.db_path).context("failed to open database")?,
    );
    info!("Database opened at {}", config.db_path.display());

    // 4. Recover the stored auction
    let state = app::recover(store.as_ref(), &config.auction.record_name)
        .await
        .context("crash recovery failed")?;

    // 5. Start the command processor
    let feed = ChangeFeed::default();
    let (handle, processor) = app::start(
        state,
        store.clone(),
        feed,
        ProcessorSettings::from_config(&config),
    );

    // 6. Import the lot catalog into a fresh auction
    if let Some(path) = &config.catalog.lots_csv {
        let lots = load_lots_csv(path).context("failed to load lot catalog")?;
        app::seed_catalog(&handle, lots)
            .await
            .context("failed to import lot catalog")?;
    }

    // 7. Spawn WebSocket server task
    let addr = config.server.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind WebSocket server on {addr}"))?;
    let ctx = ServerContext {
        handle,
        store,
        record_name: config.auction.record_name.clone(),
        quick_bids: config.auction.quick_bids.clone(),
        bidding_window_secs: config.auction.bidding_window_secs,
    };
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(listener, ctx).await {
            error!("WebSocket server error: {}", e);
        }
    });
    info!("Auction ready. WebSocket server listening on {}", addr);

    // 8. Wait for Ctrl+C
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown requested");

    // 9. Cleanup. Each command is committed atomically, so stopping the
    // processor between commands loses nothing that was acknowledged.
    ws_handle.abort();
    processor.abort();

    info!("gavel shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to `logs/gavel.log`.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("gavel.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gavel=info,gavel_core=info,gavel_server=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
