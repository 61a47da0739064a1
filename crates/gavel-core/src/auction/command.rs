// Commands accepted by the auction engine.

use serde::{Deserialize, Serialize};

use super::lot::NewLot;
use super::state::Direction;

/// Every mutation the presentation layer can request.
///
/// Deadline expiry is not a command: it is driven by the timer service
/// through [`super::engine::AuctionEngine::expire`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    AddTeam {
        name: String,
        /// Falls back to the configured per-team budget.
        #[serde(default)]
        budget: Option<u32>,
    },
    RemoveTeam {
        index: usize,
    },
    AddLot {
        lot: NewLot,
    },
    RemoveLot {
        index: usize,
    },
    ReorderLot {
        index: usize,
        direction: Direction,
    },
    StartAuction,
    OpenBidding,
    PlaceBid {
        team: String,
        amount: u32,
    },
    ForceResolve,
    Reset,
}

impl Command {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddTeam { .. } => "add_team",
            Command::RemoveTeam { .. } => "remove_team",
            Command::AddLot { .. } => "add_lot",
            Command::RemoveLot { .. } => "remove_lot",
            Command::ReorderLot { .. } => "reorder_lot",
            Command::StartAuction => "start_auction",
            Command::OpenBidding => "open_bidding",
            Command::PlaceBid { .. } => "place_bid",
            Command::ForceResolve => "force_resolve",
            Command::Reset => "reset",
        }
    }
}
