// Auction state: the single root aggregate every client converges to.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::lot::Lot;
use super::team::Team;

/// Top-level stage of the auction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Setup,
    Auction,
    Complete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Setup => "setup",
            Phase::Auction => "auction",
            Phase::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Direction for `reorderLot`: towards the front (`Up`) or back (`Down`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// The complete auction state. Read and written as a whole; there are no
/// partial-field updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionState {
    /// Sequence number, bumped on every successful mutation.
    pub version: u64,
    /// When the state was last written.
    pub updated_at: Option<DateTime<Utc>>,
    pub phase: Phase,
    pub lots: Vec<Lot>,
    pub teams: Vec<Team>,
    /// Index into `lots`; valid while `phase == Auction`.
    pub current_lot_index: usize,
    /// 0 until the first accepted bid on the current lot.
    pub current_bid: u32,
    /// Set iff `current_bid > 0`.
    pub current_bidder: Option<String>,
    /// Absolute wall-clock deadline of the bidding window.
    pub bid_deadline: Option<DateTime<Utc>>,
    /// True iff `bid_deadline` is set.
    pub timer_armed: bool,
    /// Identity of the armed countdown. Bumped on every arm and every
    /// accepted bid; an expiry carrying an older token is ignored.
    pub timer_token: u64,
    /// Lots that received no bid, in the order they went unsold.
    pub unsold_queue: Vec<Lot>,
    pub is_resale_round: bool,
    /// Next identity handed out by `addLot`.
    pub next_lot_id: u64,
}

/// Per-team summary for the completion view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamStanding {
    pub name: String,
    pub budget: u32,
    pub spent: u32,
    pub lots: Vec<WonLot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WonLot {
    pub name: String,
    pub tier: String,
    pub price: u32,
}

impl AuctionState {
    /// The lot currently on the block, if the auction is live.
    pub fn current_lot(&self) -> Option<&Lot> {
        if self.phase != Phase::Auction {
            return None;
        }
        self.lots.get(self.current_lot_index)
    }

    pub fn team(&self, name: &str) -> Option<&Team> {
        self.teams.iter().find(|t| t.name == name)
    }

    pub(crate) fn team_mut(&mut self, name: &str) -> Option<&mut Team> {
        self.teams.iter_mut().find(|t| t.name == name)
    }

    /// Time left in the bidding window at `now`, clamped at zero.
    /// `None` when no window is armed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let deadline = self.bid_deadline?;
        Some((deadline - now).max(Duration::zero()))
    }

    /// Whether the armed window has already run out at `now`. Computed from
    /// the stored deadline, so an observer that missed every tick still gets
    /// the right answer.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.bid_deadline {
            Some(deadline) => self.timer_armed && now >= deadline,
            None => false,
        }
    }

    /// `(position, total)` of the current lot, 1-based.
    pub fn progress(&self) -> (usize, usize) {
        (self.current_lot_index + 1, self.lots.len())
    }

    /// True if every content field matches the initial aggregate. The
    /// monotonic counters (`version`, `timer_token`, `next_lot_id`) and
    /// `updated_at` are bookkeeping and are not compared.
    pub fn is_pristine(&self) -> bool {
        let baseline = AuctionState {
            version: self.version,
            updated_at: self.updated_at,
            timer_token: self.timer_token,
            next_lot_id: self.next_lot_id,
            ..AuctionState::default()
        };
        *self == baseline
    }

    pub fn standings(&self) -> Vec<TeamStanding> {
        self.teams
            .iter()
            .map(|t| TeamStanding {
                name: t.name.clone(),
                budget: t.budget,
                spent: t.spent(),
                lots: t
                    .won
                    .iter()
                    .map(|l| WonLot {
                        name: l.name.clone(),
                        tier: l.tier.clone(),
                        price: l.price,
                    })
                    .collect(),
            })
            .collect()
    }
}
