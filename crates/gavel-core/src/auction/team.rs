// Bidding teams and their budget accounting.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::lot::Lot;

/// A bidding party with a depleting budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    /// Display name; expected to be unique but not enforced.
    pub name: String,
    /// Remaining budget. Never negative, never increases during an auction.
    pub budget: u32,
    /// Budget the team was created with.
    pub starting_budget: u32,
    /// Lots won, in the order they were sold.
    #[serde(default)]
    pub won: Vec<Lot>,
}

impl Team {
    pub fn new(name: impl Into<String>, budget: u32) -> Self {
        Team {
            name: name.into(),
            budget,
            starting_budget: budget,
            won: Vec::new(),
        }
    }

    /// Whether the team could pay `amount` out of its remaining budget.
    /// Bidding the entire remaining budget is allowed.
    pub fn can_afford(&self, amount: u32) -> bool {
        self.budget >= amount
    }

    /// Total spent so far.
    pub fn spent(&self) -> u32 {
        self.starting_budget.saturating_sub(self.budget)
    }

    /// Debit `price` and append `lot` to the roster.
    ///
    /// Applied at most once per lot identity: a lot already on the roster is
    /// not debited again. Returns `false` (and changes nothing) if the lot was
    /// already awarded or the team cannot cover the price.
    pub(crate) fn award(&mut self, lot: Lot, price: u32) -> bool {
        if self.won.iter().any(|w| w.id == lot.id) {
            warn!(
                "Lot {} already on the roster of '{}', ignoring duplicate award",
                lot.id, self.name
            );
            return false;
        }
        let Some(remaining) = self.budget.checked_sub(price) else {
            warn!(
                "Team '{}' cannot cover {} with {} remaining",
                self.name, price, self.budget
            );
            return false;
        };
        self.budget = remaining;
        self.won.push(lot);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::lot::{LotId, NewLot};

    fn lot(id: u64) -> Lot {
        NewLot::new(format!("P{id}"), "Gold")
            .into_lot(LotId(id))
            .unwrap()
    }

    #[test]
    fn new_team_has_full_budget() {
        let team = Team::new("A", 1000);
        assert_eq!(team.budget, 1000);
        assert_eq!(team.spent(), 0);
        assert!(team.won.is_empty());
    }

    #[test]
    fn can_afford_includes_entire_budget() {
        let team = Team::new("A", 300);
        assert!(team.can_afford(300));
        assert!(!team.can_afford(301));
    }

    #[test]
    fn award_debits_and_appends() {
        let mut team = Team::new("A", 1000);
        assert!(team.award(lot(1), 200));
        assert_eq!(team.budget, 800);
        assert_eq!(team.spent(), 200);
        assert_eq!(team.won.len(), 1);
    }

    #[test]
    fn award_is_idempotent_by_lot_id() {
        let mut team = Team::new("A", 1000);
        assert!(team.award(lot(1), 200));
        assert!(!team.award(lot(1), 200));
        assert_eq!(team.budget, 800);
        assert_eq!(team.won.len(), 1);
    }

    #[test]
    fn award_never_drives_budget_negative() {
        let mut team = Team::new("A", 100);
        assert!(!team.award(lot(1), 101));
        assert_eq!(team.budget, 100);
        assert!(team.won.is_empty());
    }
}
