// Auction command processor and its client handle.
//
// One task owns the committed auction state. Every command, from any
// connection, and every deadline expiry is funnelled through its event loop,
// applied to a copy of the state, written to the store with a conditional
// write, and only then made visible to observers. Commands are therefore
// totally ordered, and a failed write leaves the previous state in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use gavel_core::auction::{
    AuctionEngine, AuctionRules, AuctionState, Command, Direction, NewLot, Outcome, Phase,
};
use gavel_core::config::Config;
use gavel_core::error::{CommandError, Rejection, StoreError};
use gavel_core::feed::{ChangeFeed, Subscription};
use gavel_core::store::{load_state, save_state, SharedStore, StateStore};
use gavel_core::timer::{DeadlineTimer, TimerEvent};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Queue depth of pending commands.
pub const COMMAND_QUEUE: usize = 64;

/// Delay before re-attempting a lot resolution whose write failed.
pub const EXPIRY_RETRY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Processor tunables taken from the configuration.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub rules: AuctionRules,
    pub record_name: String,
    /// Countdown notification interval; `None` publishes expiry only.
    pub countdown_tick: Option<Duration>,
}

impl ProcessorSettings {
    pub fn from_config(config: &Config) -> Self {
        ProcessorSettings {
            rules: config.auction.rules(),
            record_name: config.auction.record_name.clone(),
            countdown_tick: config.feed.countdown_tick(),
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        ProcessorSettings {
            rules: AuctionRules::default(),
            record_name: "auction-state".into(),
            countdown_tick: None,
        }
    }
}

/// A committed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Version of the state the command produced.
    pub version: u64,
    pub outcome: Outcome,
    /// The state as committed.
    pub state: Arc<AuctionState>,
}

struct CommandRequest {
    command: Command,
    expected_version: Option<u64>,
    reply: oneshot::Sender<Result<Commit, CommandError>>,
}

// ---------------------------------------------------------------------------
// Client handle
// ---------------------------------------------------------------------------

/// Cloneable command surface of a running processor.
#[derive(Clone)]
pub struct AuctionHandle {
    tx: mpsc::Sender<CommandRequest>,
    current: watch::Receiver<Arc<AuctionState>>,
    feed: ChangeFeed,
}

impl AuctionHandle {
    /// Submit a command. With `expected_version`, the command is rejected as
    /// stale unless the auction is still at that version.
    pub async fn submit(
        &self,
        command: Command,
        expected_version: Option<u64>,
    ) -> Result<Commit, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CommandRequest {
                command,
                expected_version,
                reply,
            })
            .await
            .map_err(|_| CommandError::Closed)?;
        rx.await.map_err(|_| CommandError::Closed)?
    }

    /// Latest committed state.
    pub fn snapshot(&self) -> Arc<AuctionState> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.feed.subscribe()
    }

    pub async fn add_team(&self, name: &str, budget: Option<u32>) -> Result<Commit, CommandError> {
        self.submit(
            Command::AddTeam {
                name: name.to_string(),
                budget,
            },
            None,
        )
        .await
    }

    pub async fn remove_team(&self, index: usize) -> Result<Commit, CommandError> {
        self.submit(Command::RemoveTeam { index }, None).await
    }

    /// The new lot's identity is in the commit's `Outcome::LotAdded`.
    pub async fn add_lot(&self, lot: NewLot) -> Result<Commit, CommandError> {
        self.submit(Command::AddLot { lot }, None).await
    }

    pub async fn remove_lot(&self, index: usize) -> Result<Commit, CommandError> {
        self.submit(Command::RemoveLot { index }, None).await
    }

    pub async fn reorder_lot(
        &self,
        index: usize,
        direction: Direction,
    ) -> Result<Commit, CommandError> {
        self.submit(Command::ReorderLot { index, direction }, None)
            .await
    }

    pub async fn start_auction(&self) -> Result<Commit, CommandError> {
        self.submit(Command::StartAuction, None).await
    }

    pub async fn open_bidding(&self) -> Result<Commit, CommandError> {
        self.submit(Command::OpenBidding, None).await
    }

    pub async fn place_bid(&self, team: &str, amount: u32) -> Result<Commit, CommandError> {
        self.submit(
            Command::PlaceBid {
                team: team.to_string(),
                amount,
            },
            None,
        )
        .await
    }

    pub async fn force_resolve(&self) -> Result<Commit, CommandError> {
        self.submit(Command::ForceResolve, None).await
    }

    pub async fn reset(&self) -> Result<Commit, CommandError> {
        self.submit(Command::Reset, None).await
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

struct Processor {
    state: Arc<AuctionState>,
    settings: ProcessorSettings,
    store: SharedStore,
    feed: ChangeFeed,
    timer: DeadlineTimer,
    current: watch::Sender<Arc<AuctionState>>,
}

/// Spawn the processor over `state` (normally the result of [`recover`]).
///
/// A countdown that was running when `state` was stored is re-armed from
/// its stored deadline; one that already ran out resolves immediately.
pub fn start(
    state: AuctionState,
    store: SharedStore,
    feed: ChangeFeed,
    settings: ProcessorSettings,
) -> (AuctionHandle, JoinHandle<()>) {
    let state = Arc::new(state);
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let (current_tx, current_rx) = watch::channel(state.clone());

    let mut processor = Processor {
        state,
        timer: DeadlineTimer::new(settings.countdown_tick),
        settings,
        store,
        feed: feed.clone(),
        current: current_tx,
    };
    processor.resync_timer(Utc::now());

    let task = tokio::spawn(processor.run(rx));
    let handle = AuctionHandle {
        tx,
        current: current_rx,
        feed,
    };
    (handle, task)
}

impl Processor {
    /// Event loop. Exits once every [`AuctionHandle`] is gone.
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<CommandRequest>) {
        info!(
            "Auction processor started at version {} ({})",
            self.state.version, self.state.phase
        );

        loop {
            tokio::select! {
                request = cmd_rx.recv() => {
                    match request {
                        Some(request) => self.handle_request(request).await,
                        None => {
                            info!("Command channel closed, shutting down");
                            break;
                        }
                    }
                }

                event = self.timer.next_event() => {
                    self.handle_timer(event).await;
                }
            }
        }

        info!("Auction processor exiting");
    }

    async fn handle_request(&mut self, request: CommandRequest) {
        let name = request.command.name();
        let result = self
            .execute(request.command, request.expected_version)
            .await;
        match &result {
            Ok(commit) => debug!("Command {} committed at version {}", name, commit.version),
            Err(CommandError::Rejected(reason)) => info!("Command {} rejected: {}", name, reason),
            Err(e) => warn!("Command {} failed: {}", name, e),
        }
        // The caller may have given up waiting; nothing to do then.
        let _ = request.reply.send(result);
    }

    async fn execute(
        &mut self,
        command: Command,
        expected_version: Option<u64>,
    ) -> Result<Commit, CommandError> {
        let actual = self.state.version;
        if let Some(expected) = expected_version {
            if expected != actual {
                return Err(Rejection::Stale { expected, actual }.into());
            }
        }

        let now = Utc::now();
        let mut engine = self.engine();
        let outcome = engine.apply(command, now)?;
        let version = self.commit(engine.into_state(), now).await?;
        Ok(Commit {
            version,
            outcome,
            state: self.state.clone(),
        })
    }

    async fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Tick { token, remaining } => {
                if token == self.state.timer_token {
                    self.feed.publish_countdown(self.state.version, remaining);
                }
            }
            TimerEvent::Expired { token } => {
                let mut engine = self.engine();
                let (resolution, advance) = match engine.expire(token) {
                    Ok(resolved) => resolved,
                    Err(reason) => {
                        debug!("Ignoring expiry: {}", reason);
                        return;
                    }
                };
                match self.commit(engine.into_state(), Utc::now()).await {
                    Ok(version) => debug!(
                        "Countdown {} resolved at version {}: {:?}, {:?}",
                        token, version, resolution, advance
                    ),
                    // A conflict may have adopted a newer record, which
                    // already re-armed the timer for its own countdown.
                    Err(e) if self.timer.is_armed() || !self.owns_countdown(token) => {
                        warn!(
                            "Resolution of countdown {} not stored ({}); following version {}",
                            token, e, self.state.version
                        );
                    }
                    Err(e) => {
                        error!(
                            "Failed to store resolution of countdown {}: {}; retrying in {:?}",
                            token, e, EXPIRY_RETRY
                        );
                        self.timer.arm(token, Instant::now() + EXPIRY_RETRY);
                    }
                }
            }
        }
    }

    fn owns_countdown(&self, token: u64) -> bool {
        self.state.timer_armed && self.state.timer_token == token
    }

    fn engine(&self) -> AuctionEngine {
        AuctionEngine::with_state((*self.state).clone(), self.settings.rules.clone())
    }

    /// Persist `next` as the successor of the current state, then adopt and
    /// publish it. Nothing changes in memory unless the write succeeds.
    async fn commit(&mut self, mut next: AuctionState, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let previous = self.state.version;
        next.version = previous + 1;
        next.updated_at = Some(now);

        let name = self.settings.record_name.clone();
        match save_state(self.store.as_ref(), &name, &next, Some(previous)).await {
            Ok(_) => {}
            Err(e @ StoreError::Conflict { .. }) => {
                warn!("Stored record moved past version {}: {}", previous, e);
                self.reload().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        let version = next.version;
        self.adopt(Arc::new(next), now);
        Ok(version)
    }

    /// Adopt a newer record written by someone else.
    async fn reload(&mut self) {
        match load_state(self.store.as_ref(), &self.settings.record_name).await {
            Ok(Some(stored)) if stored.version > self.state.version => {
                info!("Adopting stored state at version {}", stored.version);
                self.adopt(Arc::new(stored), Utc::now());
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to reload stored state: {}", e),
        }
    }

    fn adopt(&mut self, state: Arc<AuctionState>, now: DateTime<Utc>) {
        self.state = state.clone();
        self.resync_timer(now);
        self.current.send_replace(state.clone());
        self.feed.publish(state);
    }

    /// Make the countdown match the state: armed with the state's token and
    /// deadline, or not at all.
    fn resync_timer(&mut self, now: DateTime<Utc>) {
        let s = &self.state;
        match s.bid_deadline {
            Some(deadline) if s.timer_armed && s.phase == Phase::Auction => {
                if self.timer.token() != Some(s.timer_token) {
                    self.timer.arm_at(s.timer_token, deadline, now);
                    debug!("Countdown {} armed until {}", s.timer_token, deadline);
                }
            }
            _ => {
                if let Some(token) = self.timer.cancel() {
                    debug!("Countdown {} cancelled", token);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

/// Load the stored auction, or the initial aggregate if there is none.
pub async fn recover(store: &dyn StateStore, record_name: &str) -> Result<AuctionState, StoreError> {
    match load_state(store, record_name).await? {
        Some(state) => {
            info!(
                "Auction restored from previous session: version {}, phase {}, {} lots, {} teams",
                state.version,
                state.phase,
                state.lots.len(),
                state.teams.len()
            );
            Ok(state)
        }
        None => {
            info!("No stored auction under '{}', starting fresh", record_name);
            Ok(AuctionState::default())
        }
    }
}

/// Add catalog lots to an auction still in setup with no lots. Teams may
/// already exist. Returns how many lots were added.
pub async fn seed_catalog(handle: &AuctionHandle, lots: Vec<NewLot>) -> Result<usize, CommandError> {
    let current = handle.snapshot();
    if current.phase != Phase::Setup || !current.lots.is_empty() {
        info!("Auction already has lots or has started, skipping catalog import");
        return Ok(0);
    }
    let mut added = 0;
    for lot in lots {
        match handle.add_lot(lot).await {
            Ok(_) => added += 1,
            Err(CommandError::Rejected(reason)) => warn!("Skipping catalog lot: {}", reason),
            Err(e) => return Err(e),
        }
    }
    info!("Imported {} catalog lots", added);
    Ok(added)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
