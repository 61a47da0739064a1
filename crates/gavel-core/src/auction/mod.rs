// Auction domain: catalog entries, teams, the root aggregate and the engine.

pub mod command;
pub mod engine;
pub mod lot;
pub mod state;
pub mod team;

pub use command::Command;
pub use engine::{Advance, AuctionEngine, AuctionRules, Outcome, Resolution};
pub use lot::{Lot, LotId, NewLot};
pub use state::{AuctionState, Direction, Phase, TeamStanding, WonLot};
pub use team::Team;
