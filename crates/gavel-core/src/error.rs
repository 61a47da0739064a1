// Error types shared across the auction engine, storage and command surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auction::state::{Direction, Phase};

// ---------------------------------------------------------------------------
// Validation rejections
// ---------------------------------------------------------------------------

/// Why a command was refused. A rejected command never mutates state.
///
/// Serialized with a `reason` tag so clients can render a localized message
/// without parsing the English `Display` text.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("`{field}` must not be blank")]
    BlankField { field: String },

    #[error("a lot may carry at most {max} specialties, got {got}")]
    TooManySpecialties { max: usize, got: usize },

    #[error("command requires the {expected} phase, auction is in {actual}")]
    WrongPhase { expected: Phase, actual: Phase },

    #[error("index {index} is out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("lot {index} cannot move {direction} any further")]
    AtBoundary { index: usize, direction: Direction },

    #[error("at least one team and one lot are required to start the auction")]
    NothingToAuction,

    #[error("bidding is already open on the current lot")]
    BiddingAlreadyOpen,

    #[error("bidding is not open on the current lot")]
    BiddingClosed,

    #[error("bidding window closed at {deadline}")]
    DeadlinePassed { deadline: DateTime<Utc> },

    #[error("unknown team `{team}`")]
    UnknownTeam { team: String },

    #[error("bid of {amount} does not beat the current bid of {current}")]
    BidTooLow { amount: u32, current: u32 },

    #[error("team `{team}` has {budget} left and cannot bid {amount}")]
    InsufficientBudget {
        team: String,
        budget: u32,
        amount: u32,
    },

    #[error("timer {token} is no longer the armed timer for the current lot")]
    StaleTimer { token: u64 },

    #[error("auction moved on (expected version {expected}, now {actual}); refresh and retry")]
    Stale { expected: u64, actual: u64 },
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("record `{name}` changed underneath us (expected version {expected}, found {found:?})")]
    Conflict {
        name: String,
        expected: u64,
        found: Option<u64>,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode or decode record `{name}`: {source}")]
    Codec {
        name: String,
        source: serde_json::Error,
    },

    #[error("invalid timestamp in record: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

// ---------------------------------------------------------------------------
// Command errors
// ---------------------------------------------------------------------------

/// Failure of a command submitted to the auction processor.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("auction processor is not running")]
    Closed,
}

impl CommandError {
    /// The validation reason, if this is a plain rejection.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            CommandError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}
