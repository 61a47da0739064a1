// Integration tests for gavel-core.
//
// These drive a whole auction through the public API: catalog import, the
// engine's main and resale rounds, and persistence of every step through
// the SQLite store.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use gavel_core::auction::lot::load_lots_csv;
use gavel_core::auction::{Advance, AuctionEngine, AuctionRules, Phase, Resolution};
use gavel_core::error::{Rejection, StoreError};
use gavel_core::store::{load_state, save_state, SqliteStore, StateStore};

// ===========================================================================
// Test helpers
// ===========================================================================

const KEY: &str = "auction-state";

fn fixtures() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures"))
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Engine with the fixture catalog loaded and three teams.
fn catalog_engine() -> AuctionEngine {
    let mut engine = AuctionEngine::new(AuctionRules::default());
    let lots = load_lots_csv(&fixtures().join("lots.csv")).unwrap();
    for lot in lots {
        // The fixture holds one row with a blank name.
        let _ = engine.add_lot(lot);
    }
    engine.add_team("Red", None).unwrap();
    engine.add_team("Blue", Some(600)).unwrap();
    engine.add_team("Green", Some(50)).unwrap();
    engine
}

// ===========================================================================
// Catalog import
// ===========================================================================

#[test]
fn catalog_csv_imports_valid_rows() {
    let lots = load_lots_csv(&fixtures().join("lots.csv")).unwrap();
    assert_eq!(lots.len(), 5);
    assert_eq!(lots[0].specialties, vec!["Sova", "KAY/O"]);
    assert_eq!(lots[0].remark, "IGL");
    assert_eq!(lots[4].specialties.len(), 3);

    let engine = catalog_engine();
    let names: Vec<&str> = engine.state().lots.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["Sova Main", "Jett Diff", "Smokes Only", "Flex Pick"]);
}

#[test]
fn missing_catalog_is_an_error() {
    assert!(load_lots_csv(&fixtures().join("no-such-file.csv")).is_err());
}

// ===========================================================================
// Full auction
// ===========================================================================

#[test]
fn full_auction_with_resale_round() {
    let mut engine = catalog_engine();
    engine.start_auction().unwrap();
    let mut now = t0();

    // Lot 1: contested, Blue wins at 550.
    engine.open_bidding(now).unwrap();
    engine.place_bid("Red", 100, now).unwrap();
    now += Duration::seconds(14);
    engine.place_bid("Blue", 550, now).unwrap();
    assert_eq!(
        engine.place_bid("Green", 600, now),
        Err(Rejection::InsufficientBudget {
            team: "Green".into(),
            budget: 50,
            amount: 600
        })
    );
    let token = engine.state().timer_token;
    let (resolution, advance) = engine.expire(token).unwrap();
    assert!(matches!(resolution, Resolution::Sold { ref team, price: 550, .. } if team == "Blue"));
    assert_eq!(advance, Advance::NextLot { index: 1 });

    // Lots 2 and 3: nobody bids.
    for expected in [Advance::NextLot { index: 2 }, Advance::NextLot { index: 3 }] {
        engine.open_bidding(now).unwrap();
        let token = engine.state().timer_token;
        let (resolution, advance) = engine.expire(token).unwrap();
        assert!(matches!(resolution, Resolution::Unsold { .. }));
        assert_eq!(advance, expected);
    }

    // Lot 4: Red buys it, main pass ends, two lots go to resale.
    engine.open_bidding(now).unwrap();
    engine.place_bid("Red", 1000, now).unwrap();
    let (_, advance) = engine.force_resolve().unwrap();
    assert_eq!(advance, Advance::ResaleRound { lots: 2 });
    assert!(engine.state().is_resale_round);
    assert_eq!(engine.state().lots[0].name, "Jett Diff");

    // Resale: Green picks up Jett Diff, Smokes Only stays unsold.
    engine.open_bidding(now).unwrap();
    engine.place_bid("Green", 50, now).unwrap();
    engine.force_resolve().unwrap();
    let (_, advance) = engine.force_resolve().unwrap();
    assert_eq!(advance, Advance::Complete);

    let state = engine.state();
    assert_eq!(state.phase, Phase::Complete);
    assert_eq!(state.unsold_queue.len(), 1);
    assert_eq!(state.unsold_queue[0].name, "Smokes Only");

    let standings = state.standings();
    let spent: Vec<(&str, u32)> = standings.iter().map(|t| (t.name.as_str(), t.spent)).collect();
    assert_eq!(spent, vec![("Red", 1000), ("Blue", 550), ("Green", 50)]);
    assert!(state.teams.iter().all(|t| t.budget == 0 || t.name == "Blue"));
    assert_eq!(state.team("Blue").unwrap().budget, 50);
}

// ===========================================================================
// Persistence
// ===========================================================================

#[tokio::test]
async fn every_step_survives_a_reopen() {
    let path = std::env::temp_dir().join("gavel_core_reopen.db");
    let _ = std::fs::remove_file(&path);

    let mut engine = catalog_engine();
    engine.start_auction().unwrap();
    engine.open_bidding(t0()).unwrap();
    engine.place_bid("Red", 300, t0()).unwrap();
    let mut state = engine.into_state();
    state.version = 1;

    {
        let store = SqliteStore::open(&path).unwrap();
        save_state(&store, KEY, &state, Some(0)).await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let loaded = load_state(&store, KEY).await.unwrap().unwrap();
    assert_eq!(loaded, state);
    assert_eq!(loaded.bid_deadline, Some(t0() + Duration::seconds(15)));

    // A writer holding the old version loses.
    let err = save_state(&store, KEY, &state, Some(0)).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { found: Some(1), .. }));
    assert_eq!(store.read(KEY).await.unwrap().unwrap().version, 1);

    drop(store);
    let _ = std::fs::remove_file(&path);
}
