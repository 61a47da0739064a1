// Core of the gavel live auction: engine, storage, timer and change feed.

pub mod auction;
pub mod config;
pub mod error;
pub mod feed;
pub mod protocol;
pub mod store;
pub mod timer;
