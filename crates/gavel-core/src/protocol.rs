// WebSocket JSON protocol between the auction server and its clients.

use serde::{Deserialize, Serialize};

use crate::auction::{AuctionState, Command};
use crate::error::{CommandError, Rejection};

/// Messages sent by a client (operator console or spectator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Submit a command. With `expected_version` the command only applies
    /// if the auction is still at that version.
    Command {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_version: Option<u64>,
        command: Command,
    },
    /// Ask for the stored record; the poll fallback when pushes stall.
    Fetch,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// First message on every connection.
    Welcome {
        quick_bids: Vec<u32>,
        bidding_window_secs: u64,
    },
    Snapshot {
        state: AuctionState,
    },
    CommandResult {
        request_id: u64,
        outcome: CommandOutcome,
        /// The committed state, present when the command applied.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<AuctionState>,
    },
    Countdown {
        version: u64,
        remaining_ms: u64,
    },
    Error {
        message: String,
    },
}

/// Result of a [`ClientMessage::Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Committed; the auction is now at `version`.
    Applied { version: u64 },
    /// Refused by validation. Nothing changed.
    Rejected {
        rejection: Rejection,
        message: String,
    },
    /// Could not be committed (storage outage, processor gone).
    Failed { message: String },
}

impl CommandOutcome {
    pub fn from_result(result: &Result<u64, CommandError>) -> Self {
        match result {
            Ok(version) => CommandOutcome::Applied { version: *version },
            Err(CommandError::Rejected(rejection)) => CommandOutcome::Rejected {
                message: rejection.to_string(),
                rejection: rejection.clone(),
            },
            Err(e) => CommandOutcome::Failed {
                message: e.to_string(),
            },
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, CommandOutcome::Applied { .. })
    }
}
