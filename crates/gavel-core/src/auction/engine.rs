// Auction engine: the deterministic state machine behind every command.
//
// Every operation validates fully before touching state, so a rejected
// command leaves the aggregate exactly as it was. Wall-clock time is passed
// in explicitly; the engine never reads the clock itself.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::command::Command;
use super::lot::{LotId, NewLot};
use super::state::{AuctionState, Direction, Phase};
use super::team::Team;
use crate::error::Rejection;

/// Default length of the bidding window.
pub const DEFAULT_BIDDING_WINDOW_SECS: i64 = 15;

/// Default budget for a team added without an explicit one.
pub const DEFAULT_TEAM_BUDGET: u32 = 1000;

// ---------------------------------------------------------------------------
// Rules and outcomes
// ---------------------------------------------------------------------------

/// Tunables that are configuration rather than state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuctionRules {
    /// Length of the bidding window, restarted by every accepted bid.
    pub bidding_window: Duration,
    /// Budget for `addTeam` calls that do not name one.
    pub default_budget: u32,
}

impl Default for AuctionRules {
    fn default() -> Self {
        AuctionRules {
            bidding_window: Duration::seconds(DEFAULT_BIDDING_WINDOW_SECS),
            default_budget: DEFAULT_TEAM_BUDGET,
        }
    }
}

/// How the lot on the block was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    Sold {
        lot: LotId,
        name: String,
        team: String,
        price: u32,
    },
    Unsold {
        lot: LotId,
        name: String,
    },
}

/// Where the auction went after a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advance {
    /// Moved to the next lot; bidding is not opened automatically.
    NextLot { index: usize },
    /// Main pass exhausted; unsold lots re-enter for a single resale pass.
    ResaleRound { lots: usize },
    Complete,
}

/// Result of a successfully applied command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    LotAdded(LotId),
    BiddingOpened {
        token: u64,
        deadline: DateTime<Utc>,
    },
    BidAccepted {
        token: u64,
        deadline: DateTime<Utc>,
    },
    Resolved {
        resolution: Resolution,
        advance: Advance,
    },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns an [`AuctionState`] and applies commands to it.
#[derive(Debug, Clone)]
pub struct AuctionEngine {
    state: AuctionState,
    rules: AuctionRules,
}

impl AuctionEngine {
    /// Engine over the initial `setup` aggregate.
    pub fn new(rules: AuctionRules) -> Self {
        Self::with_state(AuctionState::default(), rules)
    }

    /// Engine resuming from a previously stored state.
    pub fn with_state(state: AuctionState, rules: AuctionRules) -> Self {
        AuctionEngine { state, rules }
    }

    pub fn state(&self) -> &AuctionState {
        &self.state
    }

    pub fn into_state(self) -> AuctionState {
        self.state
    }

    pub fn rules(&self) -> &AuctionRules {
        &self.rules
    }

    /// Dispatch a [`Command`].
    pub fn apply(&mut self, command: Command, now: DateTime<Utc>) -> Result<Outcome, Rejection> {
        match command {
            Command::AddTeam { name, budget } => {
                self.add_team(&name, budget)?;
                Ok(Outcome::Applied)
            }
            Command::RemoveTeam { index } => {
                self.remove_team(index)?;
                Ok(Outcome::Applied)
            }
            Command::AddLot { lot } => self.add_lot(lot).map(Outcome::LotAdded),
            Command::RemoveLot { index } => {
                self.remove_lot(index)?;
                Ok(Outcome::Applied)
            }
            Command::ReorderLot { index, direction } => {
                self.reorder_lot(index, direction)?;
                Ok(Outcome::Applied)
            }
            Command::StartAuction => {
                self.start_auction()?;
                Ok(Outcome::Applied)
            }
            Command::OpenBidding => {
                let deadline = self.open_bidding(now)?;
                Ok(Outcome::BiddingOpened {
                    token: self.state.timer_token,
                    deadline,
                })
            }
            Command::PlaceBid { team, amount } => {
                let deadline = self.place_bid(&team, amount, now)?;
                Ok(Outcome::BidAccepted {
                    token: self.state.timer_token,
                    deadline,
                })
            }
            Command::ForceResolve => {
                let (resolution, advance) = self.force_resolve()?;
                Ok(Outcome::Resolved {
                    resolution,
                    advance,
                })
            }
            Command::Reset => {
                self.reset();
                Ok(Outcome::Applied)
            }
        }
    }

    // -- setup ------------------------------------------------------------

    pub fn add_team(&mut self, name: &str, budget: Option<u32>) -> Result<(), Rejection> {
        self.require_phase(Phase::Setup)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Rejection::BlankField {
                field: "name".into(),
            });
        }
        let budget = budget.unwrap_or(self.rules.default_budget);
        self.state.teams.push(Team::new(name, budget));
        debug!("Added team '{}' with budget {}", name, budget);
        Ok(())
    }

    pub fn remove_team(&mut self, index: usize) -> Result<(), Rejection> {
        self.require_phase(Phase::Setup)?;
        check_index(index, self.state.teams.len())?;
        let team = self.state.teams.remove(index);
        debug!("Removed team '{}'", team.name);
        Ok(())
    }

    pub fn add_lot(&mut self, lot: NewLot) -> Result<LotId, Rejection> {
        self.require_phase(Phase::Setup)?;
        let id = LotId(self.state.next_lot_id);
        let lot = lot.into_lot(id)?;
        debug!("Added lot {} '{}'", id, lot.name);
        self.state.lots.push(lot);
        self.state.next_lot_id += 1;
        Ok(id)
    }

    pub fn remove_lot(&mut self, index: usize) -> Result<(), Rejection> {
        self.require_phase(Phase::Setup)?;
        check_index(index, self.state.lots.len())?;
        let lot = self.state.lots.remove(index);
        debug!("Removed lot {} '{}'", lot.id, lot.name);
        Ok(())
    }

    /// Swap the lot at `index` with its neighbour in `direction`.
    pub fn reorder_lot(&mut self, index: usize, direction: Direction) -> Result<(), Rejection> {
        self.require_phase(Phase::Setup)?;
        let len = self.state.lots.len();
        check_index(index, len)?;
        let target = match direction {
            Direction::Up => index.checked_sub(1),
            Direction::Down => Some(index + 1).filter(|&i| i < len),
        };
        let Some(target) = target else {
            return Err(Rejection::AtBoundary { index, direction });
        };
        self.state.lots.swap(index, target);
        Ok(())
    }

    // -- live auction -------------------------------------------------------

    pub fn start_auction(&mut self) -> Result<(), Rejection> {
        self.require_phase(Phase::Setup)?;
        if self.state.teams.is_empty() || self.state.lots.is_empty() {
            return Err(Rejection::NothingToAuction);
        }
        let s = &mut self.state;
        s.phase = Phase::Auction;
        s.current_lot_index = 0;
        s.unsold_queue.clear();
        s.is_resale_round = false;
        self.clear_bid();
        info!(
            "Auction started: {} lots, {} teams",
            self.state.lots.len(),
            self.state.teams.len()
        );
        Ok(())
    }

    /// Arm the bidding window on the current lot. Returns the deadline.
    pub fn open_bidding(&mut self, now: DateTime<Utc>) -> Result<DateTime<Utc>, Rejection> {
        self.require_phase(Phase::Auction)?;
        if self.state.timer_armed {
            return Err(Rejection::BiddingAlreadyOpen);
        }
        let deadline = self.arm(now);
        if let Some(lot) = self.state.current_lot() {
            info!("Bidding opened on lot {} '{}' until {}", lot.id, lot.name, deadline);
        }
        Ok(deadline)
    }

    /// Accept a bid and restart the window from `now`. Returns the new deadline.
    pub fn place_bid(
        &mut self,
        team: &str,
        amount: u32,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, Rejection> {
        self.require_phase(Phase::Auction)?;
        if !self.state.timer_armed {
            return Err(Rejection::BiddingClosed);
        }
        if let Some(deadline) = self.state.bid_deadline {
            if now >= deadline {
                return Err(Rejection::DeadlinePassed { deadline });
            }
        }
        let Some(bidder) = self.state.team(team) else {
            return Err(Rejection::UnknownTeam {
                team: team.to_string(),
            });
        };
        if amount <= self.state.current_bid {
            return Err(Rejection::BidTooLow {
                amount,
                current: self.state.current_bid,
            });
        }
        if !bidder.can_afford(amount) {
            return Err(Rejection::InsufficientBudget {
                team: bidder.name.clone(),
                budget: bidder.budget,
                amount,
            });
        }

        self.state.current_bid = amount;
        self.state.current_bidder = Some(team.to_string());
        let deadline = self.arm(now);
        debug!("Bid accepted: '{}' {} (window until {})", team, amount, deadline);
        Ok(deadline)
    }

    /// Deadline expiry for the countdown identified by `token`.
    ///
    /// Only the currently armed countdown may resolve a lot. A token from a
    /// cancelled or superseded countdown is rejected without side effects.
    pub fn expire(&mut self, token: u64) -> Result<(Resolution, Advance), Rejection> {
        if self.state.phase != Phase::Auction
            || !self.state.timer_armed
            || token != self.state.timer_token
        {
            return Err(Rejection::StaleTimer { token });
        }
        Ok(self.resolve())
    }

    /// Resolve the current lot now, as if its deadline had fired.
    pub fn force_resolve(&mut self) -> Result<(Resolution, Advance), Rejection> {
        self.require_phase(Phase::Auction)?;
        Ok(self.resolve())
    }

    /// Back to the initial `setup` aggregate. The monotonic counters are
    /// kept so stale timers and observers can still tell old from new.
    pub fn reset(&mut self) {
        let s = &self.state;
        self.state = AuctionState {
            version: s.version,
            updated_at: s.updated_at,
            timer_token: s.timer_token,
            next_lot_id: s.next_lot_id,
            ..AuctionState::default()
        };
        info!("Auction reset");
    }

    // -- internals ---------------------------------------------------------

    fn require_phase(&self, expected: Phase) -> Result<(), Rejection> {
        if self.state.phase != expected {
            return Err(Rejection::WrongPhase {
                expected,
                actual: self.state.phase,
            });
        }
        Ok(())
    }

    fn arm(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let deadline = now + self.rules.bidding_window;
        self.state.bid_deadline = Some(deadline);
        self.state.timer_armed = true;
        self.state.timer_token += 1;
        deadline
    }

    fn disarm(&mut self) {
        self.state.bid_deadline = None;
        self.state.timer_armed = false;
    }

    fn clear_bid(&mut self) {
        self.state.current_bid = 0;
        self.state.current_bidder = None;
        self.disarm();
    }

    fn resolve(&mut self) -> (Resolution, Advance) {
        let resolution = match self.state.current_bidder.clone() {
            Some(bidder) => self.resolve_sold(&bidder),
            None => self.resolve_unsold(),
        };
        let advance = self.advance();
        (resolution, advance)
    }

    fn resolve_sold(&mut self, bidder: &str) -> Resolution {
        let index = self.state.current_lot_index;
        let price = self.state.current_bid;
        let mut sold = self.state.lots[index].clone();
        sold.mark_sold(bidder, price);

        let awarded = match self.state.team_mut(bidder) {
            Some(team) => team.award(sold.clone(), price),
            None => {
                warn!("Winning team '{}' no longer exists", bidder);
                false
            }
        };
        if !awarded {
            return self.resolve_unsold();
        }

        info!("Lot {} '{}' sold to '{}' for {}", sold.id, sold.name, bidder, price);
        let resolution = Resolution::Sold {
            lot: sold.id,
            name: sold.name.clone(),
            team: bidder.to_string(),
            price,
        };
        self.state.lots[index] = sold;
        self.disarm();
        resolution
    }

    fn resolve_unsold(&mut self) -> Resolution {
        let lot = self.state.lots[self.state.current_lot_index].clone();
        info!("Lot {} '{}' went unsold", lot.id, lot.name);
        let resolution = Resolution::Unsold {
            lot: lot.id,
            name: lot.name.clone(),
        };
        self.state.unsold_queue.push(lot);
        self.disarm();
        resolution
    }

    fn advance(&mut self) -> Advance {
        self.clear_bid();
        let s = &mut self.state;
        if s.current_lot_index + 1 < s.lots.len() {
            s.current_lot_index += 1;
            return Advance::NextLot {
                index: s.current_lot_index,
            };
        }
        if !s.unsold_queue.is_empty() && !s.is_resale_round {
            s.lots = std::mem::take(&mut s.unsold_queue);
            s.current_lot_index = 0;
            s.is_resale_round = true;
            info!("Resale round started with {} lots", s.lots.len());
            return Advance::ResaleRound { lots: s.lots.len() };
        }
        s.phase = Phase::Complete;
        info!(
            "Auction complete, {} lots finally unsold",
            s.unsold_queue.len()
        );
        Advance::Complete
    }
}

fn check_index(index: usize, len: usize) -> Result<(), Rejection> {
    if index >= len {
        return Err(Rejection::IndexOutOfRange { index, len });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
