// Change feed: fan-out of committed state to every connected observer.
//
// Observers never receive deltas. Each event carries the full committed
// aggregate (or a countdown hint), so a subscriber that drops events only
// needs the newest one to be correct again.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::auction::AuctionState;

/// Default capacity of the broadcast ring.
pub const DEFAULT_FEED_CAPACITY: usize = 64;

/// Something observers should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A newly committed state.
    Snapshot(Arc<AuctionState>),
    /// Countdown update for the open bidding window at `version`.
    Countdown { version: u64, remaining_ms: u64 },
}

/// Connection health of an observer's feed. Informational only; it never
/// gates whether state is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Connecting,
    Connected,
    Error(String),
    TimedOut,
    Closed,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedStatus::Connecting => f.write_str("connecting"),
            FeedStatus::Connected => f.write_str("connected"),
            FeedStatus::Error(reason) => write!(f, "error: {reason}"),
            FeedStatus::TimedOut => f.write_str("timed out"),
            FeedStatus::Closed => f.write_str("closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher side
// ---------------------------------------------------------------------------

/// Broadcast channel of [`FeedEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<FeedEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        ChangeFeed { tx }
    }

    /// Publish a committed state. Having no subscribers is not an error.
    pub fn publish(&self, state: Arc<AuctionState>) {
        let version = state.version;
        let receivers = self.tx.send(FeedEvent::Snapshot(state)).unwrap_or(0);
        debug!("Published version {} to {} subscribers", version, receivers);
    }

    pub fn publish_countdown(&self, version: u64, remaining: std::time::Duration) {
        let _ = self.tx.send(FeedEvent::Countdown {
            version,
            remaining_ms: remaining.as_millis() as u64,
        });
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

/// Receiving end of a [`ChangeFeed`].
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<FeedEvent>,
}

impl Subscription {
    /// Next event, or `None` once the feed is gone. A subscriber that fell
    /// behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Feed subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Observer side
// ---------------------------------------------------------------------------

/// Read-only local view of the auction, replaced wholesale by each newer
/// snapshot.
#[derive(Debug, Clone)]
pub struct Projection {
    state: Option<Arc<AuctionState>>,
    status: FeedStatus,
    last_update: Option<DateTime<Utc>>,
    countdown_ms: Option<u64>,
}

impl Default for Projection {
    fn default() -> Self {
        Projection {
            state: None,
            status: FeedStatus::Connecting,
            last_update: None,
            countdown_ms: None,
        }
    }
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `snapshot` if it is newer than what we hold. Returns whether it
    /// was applied; duplicates and out-of-order deliveries are dropped.
    pub fn apply(&mut self, snapshot: Arc<AuctionState>, received_at: DateTime<Utc>) -> bool {
        if let Some(current) = &self.state {
            if snapshot.version <= current.version {
                return false;
            }
        }
        self.state = Some(snapshot);
        self.last_update = Some(received_at);
        self.countdown_ms = None;
        true
    }

    /// Take a countdown hint if it refers to the version we hold.
    pub fn apply_countdown(&mut self, version: u64, remaining_ms: u64) -> bool {
        if self.version() != Some(version) {
            return false;
        }
        self.countdown_ms = Some(remaining_ms);
        true
    }

    pub fn handle(&mut self, event: FeedEvent, received_at: DateTime<Utc>) -> bool {
        match event {
            FeedEvent::Snapshot(state) => self.apply(state, received_at),
            FeedEvent::Countdown {
                version,
                remaining_ms,
            } => self.apply_countdown(version, remaining_ms),
        }
    }

    /// Forget everything, e.g. before a reconnect to a different server.
    pub fn clear(&mut self) {
        self.state = None;
        self.last_update = None;
        self.countdown_ms = None;
    }

    pub fn state(&self) -> Option<&AuctionState> {
        self.state.as_deref()
    }

    pub fn version(&self) -> Option<u64> {
        self.state.as_ref().map(|s| s.version)
    }

    pub fn status(&self) -> &FeedStatus {
        &self.status
    }

    pub fn set_status(&mut self, status: FeedStatus) {
        self.status = status;
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Time left on the bidding window, computed from the stored deadline
    /// so it stays right even when no countdown hints arrive.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.state.as_ref()?.remaining(now)
    }

    /// Last countdown hint from the server for the held version.
    pub fn countdown_ms(&self) -> Option<u64> {
        self.countdown_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::Phase;

    fn snapshot(version: u64) -> Arc<AuctionState> {
        Arc::new(AuctionState {
            version,
            ..AuctionState::default()
        })
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let feed = ChangeFeed::default();
        assert_eq!(feed.subscriber_count(), 0);
        feed.publish(snapshot(1));
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_snapshot() {
        let feed = ChangeFeed::default();
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();
        feed.publish(snapshot(3));

        for sub in [&mut a, &mut b] {
            match sub.recv().await {
                Some(FeedEvent::Snapshot(state)) => assert_eq!(state.version, 3),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_newest() {
        let feed = ChangeFeed::new(2);
        let mut sub = feed.subscribe();
        for v in 1..=5 {
            feed.publish(snapshot(v));
        }
        match sub.recv().await {
            Some(FeedEvent::Snapshot(state)) => assert_eq!(state.version, 4),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn recv_returns_none_when_feed_dropped() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe();
        drop(feed);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn projection_ignores_older_and_duplicate_versions() {
        let now = Utc::now();
        let mut view = Projection::new();
        assert!(view.apply(snapshot(2), now));
        assert!(!view.apply(snapshot(2), now));
        assert!(!view.apply(snapshot(1), now));
        assert_eq!(view.version(), Some(2));
        assert!(view.apply(snapshot(5), now));
        assert_eq!(view.version(), Some(5));
    }

    #[test]
    fn projection_replaces_state_wholesale() {
        let now = Utc::now();
        let mut view = Projection::new();
        view.apply(snapshot(1), now);
        let live = Arc::new(AuctionState {
            version: 2,
            phase: Phase::Auction,
            ..AuctionState::default()
        });
        view.apply(live, now);
        assert_eq!(view.state().map(|s| s.phase), Some(Phase::Auction));
        assert_eq!(view.last_update(), Some(now));
    }

    #[test]
    fn countdown_only_for_held_version() {
        let now = Utc::now();
        let mut view = Projection::new();
        assert!(!view.apply_countdown(1, 500));
        view.apply(snapshot(1), now);
        assert!(view.handle(
            FeedEvent::Countdown {
                version: 1,
                remaining_ms: 500
            },
            now
        ));
        assert_eq!(view.countdown_ms(), Some(500));
        view.apply(snapshot(2), now);
        assert_eq!(view.countdown_ms(), None);
    }

    #[test]
    fn remaining_is_derived_from_deadline() {
        let now = Utc::now();
        let mut view = Projection::new();
        let state = Arc::new(AuctionState {
            version: 1,
            bid_deadline: Some(now + Duration::seconds(15)),
            timer_armed: true,
            ..AuctionState::default()
        });
        view.apply(state, now);
        assert_eq!(
            view.remaining(now + Duration::seconds(6)),
            Some(Duration::seconds(9))
        );
    }

    #[test]
    fn clear_drops_state_but_keeps_status() {
        let mut view = Projection::new();
        view.set_status(FeedStatus::Connected);
        view.apply(snapshot(4), Utc::now());
        view.clear();
        assert!(view.state().is_none());
        assert_eq!(view.status(), &FeedStatus::Connected);
        assert!(view.apply(snapshot(1), Utc::now()));
    }

    #[test]
    fn status_display() {
        assert_eq!(FeedStatus::TimedOut.to_string(), "timed out");
        assert_eq!(
            FeedStatus::Error("refused".into()).to_string(),
            "error: refused"
        );
    }
}
