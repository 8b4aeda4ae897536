//! OFFERKEEPER: jackpot trade-offer agent with ledger reconciliation.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod platforms;
pub mod storage;
pub mod engine;
pub mod server;
