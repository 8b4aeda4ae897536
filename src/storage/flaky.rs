//! Test ledger that fails chosen operations a set number of times.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{Ledger, MemoryLedger};
use crate::types::{LedgerError, Participant, PendingOffer, PollData, QueueEntry, WinningOffer};

#[derive(Default)]
pub struct FlakyLedger {
    inner: MemoryLedger,
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls to `op` fail.
    pub fn fail(&self, op: &'static str, times: u32) {
        self.failures.lock().unwrap().insert(op, times);
    }

    fn trip(&self, op: &'static str) -> Result<(), LedgerError> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(LedgerError::Database(sqlx::Error::PoolTimedOut))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn record_deposit(
        &self,
        offer: &PendingOffer,
        protection_code: &str,
    ) -> Result<(), LedgerError> {
        self.trip("record_deposit")?;
        self.inner.record_deposit(offer, protection_code).await
    }

    async fn get_pending(&self, offer_id: &str) -> Result<Option<PendingOffer>, LedgerError> {
        self.trip("get_pending")?;
        self.inner.get_pending(offer_id).await
    }

    async fn promote_pending(&self, offer_id: &str) -> Result<Option<QueueEntry>, LedgerError> {
        self.trip("promote_pending")?;
        self.inner.promote_pending(offer_id).await
    }

    async fn cancel_pending(&self, offer_id: &str) -> Result<Option<PendingOffer>, LedgerError> {
        self.trip("cancel_pending")?;
        self.inner.cancel_pending(offer_id).await
    }

    async fn insert_winning(&self, offer: &WinningOffer) -> Result<(), LedgerError> {
        self.trip("insert_winning")?;
        self.inner.insert_winning(offer).await
    }

    async fn get_winning(&self, offer_id: &str) -> Result<Option<WinningOffer>, LedgerError> {
        self.trip("get_winning")?;
        self.inner.get_winning(offer_id).await
    }

    async fn take_winning(&self, offer_id: &str) -> Result<Option<WinningOffer>, LedgerError> {
        self.trip("take_winning")?;
        self.inner.take_winning(offer_id).await
    }

    async fn get_participant(&self, id: &str) -> Result<Option<Participant>, LedgerError> {
        self.trip("get_participant")?;
        self.inner.get_participant(id).await
    }

    async fn set_error_flag(&self, id: &str, error: bool) -> Result<(), LedgerError> {
        self.trip("set_error_flag")?;
        self.inner.set_error_flag(id, error).await
    }

    async fn queue(&self) -> Result<Vec<QueueEntry>, LedgerError> {
        self.trip("queue")?;
        self.inner.queue().await
    }

    async fn save_poll_data(&self, data: &PollData) -> Result<(), LedgerError> {
        self.trip("save_poll_data")?;
        self.inner.save_poll_data(data).await
    }

    async fn load_poll_data(&self) -> Result<Option<PollData>, LedgerError> {
        self.trip("load_poll_data")?;
        self.inner.load_poll_data().await
    }
}
