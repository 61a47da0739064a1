// Spectator client: follows a running auction over WebSocket.
//
// Pushed snapshots are the primary source of truth. A periodic FETCH backs
// them up when pushes stall, and a heartbeat marks the feed as timed out
// when the server goes quiet. Every state change is handed to the caller
// as a fresh copy of the local projection.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use gavel_core::auction::{AuctionState, Phase};
use gavel_core::config::Config;
use gavel_core::feed::{FeedStatus, Projection};
use gavel_core::protocol::{ClientMessage, ServerMessage};

/// Pause between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ObserverSettings {
    pub url: String,
    pub poll_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl ObserverSettings {
    pub fn from_config(config: &Config) -> Self {
        ObserverSettings {
            url: format!("ws://{}", config.server.addr()),
            poll_interval: config.feed.poll_interval(),
            heartbeat_timeout: config.feed.heartbeat_timeout(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server closed the connection or the stream ended.
    Closed,
    /// A read or write failed.
    Failed(String),
    /// Nobody is listening for updates any more.
    Abandoned,
}

/// Follow the auction at `settings.url` until `updates` is dropped,
/// reconnecting after every lost connection.
pub async fn watch(settings: ObserverSettings, updates: mpsc::Sender<Projection>) {
    let mut view = Projection::new();

    loop {
        if !set_status(&mut view, FeedStatus::Connecting, &updates).await {
            return;
        }
        info!("Connecting to {}", settings.url);

        let end = match tokio_tungstenite::connect_async(settings.url.as_str()).await {
            Ok((ws, _response)) => {
                let (mut write, read) = ws.split();
                run_session(read, &mut write, &mut view, &settings, &updates).await
            }
            Err(e) => SessionEnd::Failed(e.to_string()),
        };

        let status = match end {
            SessionEnd::Abandoned => return,
            SessionEnd::Closed => FeedStatus::Closed,
            SessionEnd::Failed(reason) => FeedStatus::Error(reason),
        };
        warn!("Feed lost ({}), reconnecting in {:?}", status, settings.reconnect_delay);
        if !set_status(&mut view, status, &updates).await {
            return;
        }
        tokio::time::sleep(settings.reconnect_delay).await;
    }
}

/// Drive one connection: apply pushed messages, poll, and watch for silence.
pub async fn run_session<St, Si>(
    mut read: St,
    write: &mut Si,
    view: &mut Projection,
    settings: &ObserverSettings,
    updates: &mpsc::Sender<Projection>,
) -> SessionEnd
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut poll = tokio::time::interval(settings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Consume the immediate first tick; the server greets with a snapshot.
    poll.tick().await;

    let heartbeat_check = (settings.heartbeat_timeout / 3).max(Duration::from_millis(100));
    let mut heartbeat = tokio::time::interval(heartbeat_check);
    heartbeat.tick().await;

    let mut last_message = Instant::now();
    // The server may have restarted on another record, so the first
    // snapshot of a session replaces whatever we held before.
    let mut resync = true;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_message = Instant::now();
                        let mut changed = false;
                        if *view.status() != FeedStatus::Connected {
                            view.set_status(FeedStatus::Connected);
                            changed = true;
                        }
                        if let Some(msg) = parse_server_text(text.as_str()) {
                            if resync && matches!(msg, ServerMessage::Snapshot { .. }) {
                                view.clear();
                                resync = false;
                            }
                            changed |= apply_server_message(view, msg);
                        }
                        if changed && updates.send(view.clone()).await.is_err() {
                            return SessionEnd::Abandoned;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    Some(Ok(_)) => {
                        // Ignore Binary, Ping, Pong, Frame variants.
                    }
                }
            }

            _ = poll.tick() => {
                let fetch = match serde_json::to_string(&ClientMessage::Fetch) {
                    Ok(json) => json,
                    Err(e) => return SessionEnd::Failed(e.to_string()),
                };
                if let Err(e) = write.send(Message::Text(fetch.into())).await {
                    return SessionEnd::Failed(e.to_string());
                }
            }

            _ = heartbeat.tick() => {
                let silent = last_message.elapsed();
                if *view.status() == FeedStatus::Connected && silent > settings.heartbeat_timeout {
                    warn!("No message from server for {:?}, marking feed as timed out", silent);
                    view.set_status(FeedStatus::TimedOut);
                    if updates.send(view.clone()).await.is_err() {
                        return SessionEnd::Abandoned;
                    }
                }
            }
        }
    }
}

/// Apply one server message to the projection. Returns whether the view
/// changed.
pub fn apply_server_text(view: &mut Projection, text: &str) -> bool {
    match parse_server_text(text) {
        Some(msg) => apply_server_message(view, msg),
        None => false,
    }
}

fn parse_server_text(text: &str) -> Option<ServerMessage> {
    match serde_json::from_str(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!("Ignoring malformed server message: {e}");
            None
        }
    }
}

fn apply_server_message(view: &mut Projection, msg: ServerMessage) -> bool {
    match msg {
        ServerMessage::Welcome {
            quick_bids,
            bidding_window_secs,
        } => {
            info!(
                "Server greeting: {}s bidding window, quick bids {:?}",
                bidding_window_secs, quick_bids
            );
            false
        }
        ServerMessage::Snapshot { state } => {
            let version = state.version;
            let applied = view.apply(Arc::new(state), Utc::now());
            if !applied {
                debug!("Ignoring snapshot at version {}", version);
            }
            applied
        }
        ServerMessage::Countdown {
            version,
            remaining_ms,
        } => view.apply_countdown(version, remaining_ms),
        ServerMessage::CommandResult { request_id, .. } => {
            debug!("Unexpected command result {}", request_id);
            false
        }
        ServerMessage::Error { message } => {
            warn!("Server error: {}", message);
            false
        }
    }
}

async fn set_status(
    view: &mut Projection,
    status: FeedStatus,
    updates: &mpsc::Sender<Projection>,
) -> bool {
    view.set_status(status);
    updates.send(view.clone()).await.is_ok()
}

/// One-line summary of the auction for terminal output.
pub fn summarize(state: &AuctionState, now: chrono::DateTime<Utc>) -> String {
    match state.phase {
        Phase::Setup => format!(
            "v{} setup: {} teams, {} lots",
            state.version,
            state.teams.len(),
            state.lots.len()
        ),
        Phase::Auction => {
            let (position, total) = state.progress();
            let round = if state.is_resale_round { "resale" } else { "main" };
            let lot = state
                .current_lot()
                .map(|l| format!("{} [{}]", l.name, l.tier))
                .unwrap_or_else(|| "-".into());
            let bid = match &state.current_bidder {
                Some(team) => format!("{} by {}", state.current_bid, team),
                None => "no bids".into(),
            };
            let clock = match state.remaining(now) {
                Some(left) => format!("{:.1}s left", left.num_milliseconds() as f64 / 1000.0),
                None => "waiting to open".into(),
            };
            format!(
                "v{} {} round {}/{}: {}, {}, {}",
                state.version, round, position, total, lot, bid, clock
            )
        }
        Phase::Complete => {
            let teams: Vec<String> = state
                .standings()
                .iter()
                .map(|t| format!("{} spent {} on {} lots", t.name, t.spent, t.lots.len()))
                .collect();
            format!(
                "v{} complete: {}; {} unsold",
                state.version,
                teams.join(", "),
                state.unsold_queue.len()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use gavel_core::auction::{AuctionEngine, AuctionRules, NewLot};

    fn settings() -> ObserverSettings {
        ObserverSettings {
            url: "ws://127.0.0.1:0".into(),
            poll_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(2),
        }
    }

    fn snapshot_text(version: u64) -> Message {
        let msg = ServerMessage::Snapshot {
            state: AuctionState {
                version,
                ..AuctionState::default()
            },
        };
        Message::Text(serde_json::to_string(&msg).unwrap().into())
    }

    #[test]
    fn older_snapshot_is_ignored() {
        let mut view = Projection::new();
        let newer = serde_json::to_string(&ServerMessage::Snapshot {
            state: AuctionState {
                version: 4,
                ..AuctionState::default()
            },
        })
        .unwrap();
        let older = newer.replace("\"version\":4", "\"version\":2");
        assert!(apply_server_text(&mut view, &newer));
        assert!(!apply_server_text(&mut view, &older));
        assert_eq!(view.version(), Some(4));
    }

    #[test]
    fn malformed_and_error_messages_change_nothing() {
        let mut view = Projection::new();
        assert!(!apply_server_text(&mut view, "nope"));
        assert!(!apply_server_text(
            &mut view,
            r#"{"type":"ERROR","message":"boom"}"#
        ));
        assert!(view.state().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn session_applies_snapshots_then_reports_close() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut view = Projection::new();
        let mut sink = futures_util::sink::drain();
        let read = stream::iter(vec![
            Ok(snapshot_text(1)),
            Ok(snapshot_text(1)),
            Ok(snapshot_text(2)),
        ]);

        let end = run_session(read, &mut sink, &mut view, &settings(), &tx).await;
        assert_eq!(end, SessionEnd::Closed);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status(), &FeedStatus::Connected);
        assert_eq!(first.version(), Some(1));
        // The duplicate produced no update.
        assert_eq!(rx.recv().await.unwrap().version(), Some(2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_takes_greeting_from_restarted_server() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut view = Projection::new();
        let mut sink = futures_util::sink::drain();

        let first = stream::iter(vec![Ok(snapshot_text(17))]);
        run_session(first, &mut sink, &mut view, &settings(), &tx).await;
        assert_eq!(view.version(), Some(17));

        // The server came back on a fresh record.
        let second = stream::iter(vec![
            Ok(snapshot_text(1)),
            Ok(snapshot_text(0)),
            Ok(snapshot_text(2)),
        ]);
        let end = run_session(second, &mut sink, &mut view, &settings(), &tx).await;
        assert_eq!(end, SessionEnd::Closed);
        assert_eq!(view.version(), Some(2));

        let versions: Vec<Option<u64>> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|p| p.version())
            .collect();
        // Within a session older snapshots are still dropped.
        assert_eq!(versions, vec![Some(17), Some(1), Some(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_marks_feed_timed_out() {
        let (tx, mut rx) = mpsc::channel(16);
        let read = stream::iter(vec![Ok(snapshot_text(1))]).chain(stream::pending());

        let session = tokio::spawn(async move {
            let mut view = Projection::new();
            let mut sink = futures_util::sink::drain();
            run_session(read, &mut sink, &mut view, &settings(), &tx).await
        });

        assert_eq!(rx.recv().await.unwrap().status(), &FeedStatus::Connected);
        let started = Instant::now();
        let timed_out = rx.recv().await.unwrap();
        assert_eq!(timed_out.status(), &FeedStatus::TimedOut);
        assert!(started.elapsed() > Duration::from_secs(15));
        // The last known state is kept while the feed is down.
        assert_eq!(timed_out.version(), Some(1));

        drop(rx);
        session.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_ends_session() {
        let (tx, _rx) = mpsc::channel(16);
        let mut view = Projection::new();
        let mut sink = futures_util::sink::drain();
        let read = stream::iter(vec![Err(WsError::ConnectionClosed)]);
        let end = run_session(read, &mut sink, &mut view, &settings(), &tx).await;
        assert!(matches!(end, SessionEnd::Failed(_)));
    }

    #[test]
    fn summary_follows_phase() {
        let now = Utc::now();
        let mut engine = AuctionEngine::new(AuctionRules::default());
        engine.add_team("A", None).unwrap();
        engine.add_lot(NewLot::new("P1", "Gold")).unwrap();
        assert_eq!(summarize(engine.state(), now), "v0 setup: 1 teams, 1 lots");

        engine.start_auction().unwrap();
        assert_eq!(
            summarize(engine.state(), now),
            "v0 main round 1/1: P1 [Gold], no bids, waiting to open"
        );

        engine.open_bidding(now).unwrap();
        engine.place_bid("A", 100, now).unwrap();
        assert_eq!(
            summarize(engine.state(), now),
            "v0 main round 1/1: P1 [Gold], 100 by A, 15.0s left"
        );

        engine.force_resolve().unwrap();
        assert_eq!(
            summarize(engine.state(), now),
            "v0 complete: A spent 100 on 1 lots; 0 unsold"
        );
    }
}
