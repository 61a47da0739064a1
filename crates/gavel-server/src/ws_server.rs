// WebSocket server for operator consoles and spectators.

use std::sync::Arc;

use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use gavel_core::auction::AuctionState;
use gavel_core::feed::{FeedEvent, Subscription};
use gavel_core::protocol::{ClientMessage, CommandOutcome, ServerMessage};
use gavel_core::store::{load_state, SharedStore};

use crate::app::AuctionHandle;

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 64;

/// What every connection needs to serve requests.
#[derive(Clone)]
pub struct ServerContext {
    pub handle: AuctionHandle,
    pub store: SharedStore,
    pub record_name: String,
    pub quick_bids: Vec<u32>,
    pub bidding_window_secs: u64,
}

impl ServerContext {
    fn welcome(&self) -> ServerMessage {
        ServerMessage::Welcome {
            quick_bids: self.quick_bids.clone(),
            bidding_window_secs: self.bidding_window_secs,
        }
    }
}

/// Accept connections forever, serving each one on its own task.
pub async fn run(listener: TcpListener, ctx: ServerContext) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!("WebSocket server listening on {local_addr}");
    let ctx = Arc::new(ctx);

    loop {
        let (stream, addr) = listener.accept().await?;
        let addr = addr.to_string();
        info!("Accepted TCP connection from {addr}");

        let ctx = ctx.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => serve_connection(ws, &ctx, &addr).await,
                Err(e) => warn!("WebSocket handshake failed for {addr}: {e}"),
            }
        });
    }
}

/// Serve one client until either side hangs up.
pub async fn serve_connection<S>(ws: WebSocketStream<S>, ctx: &ServerContext, addr: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (write, read) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);

    // Subscribe before the first snapshot so nothing committed in between
    // is missed; a duplicate is harmless to a versioned projection.
    let feed = ctx.handle.subscribe();
    let greeting = [
        ctx.welcome(),
        snapshot_message(&ctx.handle.snapshot()),
    ];
    for msg in greeting {
        if out_tx.send(msg).await.is_err() {
            return;
        }
    }

    tokio::select! {
        _ = process_message_stream(read, ctx, &out_tx, addr) => {}
        _ = forward_outbound(write, out_rx, feed, addr) => {}
    }
    info!("Client {addr} disconnected");
}

/// Handle incoming client messages, queueing each reply on `out`. Returns
/// `Err(())` if the outbound queue is closed, signalling the caller to stop.
///
/// Generic over the stream so it can be tested without opening TCP ports.
pub async fn process_message_stream<St>(
    mut stream: St,
    ctx: &ServerContext,
    out: &mpsc::Sender<ServerMessage>,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let reply = handle_client_text(ctx, text.as_str()).await;
                if out.send(reply).await.is_err() {
                    return Err(());
                }
            }
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
    Ok(())
}

/// Answer one client message.
pub async fn handle_client_text(ctx: &ServerContext, text: &str) -> ServerMessage {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Malformed client message: {e}");
            return ServerMessage::Error {
                message: format!("invalid message: {e}"),
            };
        }
    };

    match msg {
        ClientMessage::Command {
            request_id,
            expected_version,
            command,
        } => {
            let result = ctx.handle.submit(command, expected_version).await;
            let state = result
                .as_ref()
                .ok()
                .map(|commit| AuctionState::clone(&commit.state));
            ServerMessage::CommandResult {
                request_id,
                outcome: CommandOutcome::from_result(&result.map(|commit| commit.version)),
                state,
            }
        }
        ClientMessage::Fetch => match load_state(ctx.store.as_ref(), &ctx.record_name).await {
            Ok(Some(state)) => ServerMessage::Snapshot { state },
            Ok(None) => ServerMessage::Snapshot {
                state: AuctionState::default(),
            },
            Err(e) => {
                warn!("Fetch of '{}' failed: {}", ctx.record_name, e);
                ServerMessage::Error {
                    message: format!("fetch failed: {e}"),
                }
            }
        },
    }
}

/// Write replies and feed events to the socket until it fails or both
/// sources are exhausted.
async fn forward_outbound<Si>(
    mut sink: Si,
    mut replies: mpsc::Receiver<ServerMessage>,
    mut feed: Subscription,
    addr: &str,
) where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let msg = tokio::select! {
            reply = replies.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
            event = feed.recv() => match event {
                Some(event) => feed_message(event),
                None => break,
            },
        };

        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode message for {addr}: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            debug!("Write to {addr} failed: {e}");
            break;
        }
    }
}

fn snapshot_message(state: &Arc<AuctionState>) -> ServerMessage {
    ServerMessage::Snapshot {
        state: AuctionState::clone(state),
    }
}

/// Translate a feed event into its wire form.
pub fn feed_message(event: FeedEvent) -> ServerMessage {
    match event {
        FeedEvent::Snapshot(state) => snapshot_message(&state),
        FeedEvent::Countdown {
            version,
            remaining_ms,
        } => ServerMessage::Countdown {
            version,
            remaining_ms,
        },
    }
}
