//! Persistence layer.
//!
//! The ledger records in-flight deposits (`pending`), sent but unsettled
//! payouts (`winning`), per-participant trade metadata (`users`), the
//! processing `queue`, and the poll checkpoint. Every state transition the
//! reconciler performs is a single atomic ledger call, so a duplicate
//! notification can never apply twice.

pub mod memory;
pub mod sqlite;

#[cfg(test)]
pub mod flaky;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::{LedgerBackend, LedgerConfig};
use crate::types::{LedgerError, Participant, PendingOffer, PollData, QueueEntry, WinningOffer};

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

/// Keyed store behind the reconciler.
///
/// An offer id lives in at most one of pending/winning; inserts that would
/// break this return [`LedgerError::Conflict`].
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Write `pending/{id}` and point the depositor's record at it, atomically.
    async fn record_deposit(
        &self,
        offer: &PendingOffer,
        protection_code: &str,
    ) -> Result<(), LedgerError>;

    async fn get_pending(&self, offer_id: &str) -> Result<Option<PendingOffer>, LedgerError>;

    /// Remove `pending/{id}` and append it to the queue in one step.
    /// Returns `None` when the offer is not pending.
    async fn promote_pending(&self, offer_id: &str) -> Result<Option<QueueEntry>, LedgerError>;

    /// Remove `pending/{id}` and clear the depositor's active trade fields
    /// (only if they still reference this offer) in one step.
    async fn cancel_pending(&self, offer_id: &str) -> Result<Option<PendingOffer>, LedgerError>;

    async fn insert_winning(&self, offer: &WinningOffer) -> Result<(), LedgerError>;

    async fn get_winning(&self, offer_id: &str) -> Result<Option<WinningOffer>, LedgerError>;

    /// Remove and return `winning/{id}`.
    async fn take_winning(&self, offer_id: &str) -> Result<Option<WinningOffer>, LedgerError>;

    async fn get_participant(&self, id: &str) -> Result<Option<Participant>, LedgerError>;

    /// Upsert the participant's error flag.
    async fn set_error_flag(&self, id: &str, error: bool) -> Result<(), LedgerError>;

    /// All queue entries in append order.
    async fn queue(&self) -> Result<Vec<QueueEntry>, LedgerError>;

    async fn save_poll_data(&self, data: &PollData) -> Result<(), LedgerError>;

    async fn load_poll_data(&self) -> Result<Option<PollData>, LedgerError>;
}

/// Open the configured ledger backend.
pub async fn open(cfg: &LedgerConfig) -> Result<Arc<dyn Ledger>> {
    match cfg.backend {
        LedgerBackend::Sqlite => {
            let ledger = SqliteLedger::connect(&cfg.database_url)
                .await
                .with_context(|| format!("Failed to open ledger at {}", cfg.database_url))?;
            info!(url = %cfg.database_url, "SQLite ledger ready");
            Ok(Arc::new(ledger))
        }
        LedgerBackend::Memory => {
            info!("Using in-memory ledger (state is lost on exit)");
            Ok(Arc::new(MemoryLedger::new()))
        }
    }
}
