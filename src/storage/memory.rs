//! In-memory ledger.
//!
//! Same semantics as the SQLite ledger, with every operation running under
//! one mutex. Used by tests and by `backend = "memory"` dry runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::Ledger;
use crate::types::{LedgerError, Participant, PendingOffer, PollData, QueueEntry, WinningOffer};

#[derive(Default)]
struct State {
    pending: HashMap<String, PendingOffer>,
    winning: HashMap<String, WinningOffer>,
    users: HashMap<String, Participant>,
    queue: Vec<QueueEntry>,
    poll_data: Option<PollData>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain maps behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record_deposit(
        &self,
        offer: &PendingOffer,
        protection_code: &str,
    ) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if state.winning.contains_key(&offer.offer_id) {
            return Err(LedgerError::Conflict(offer.offer_id.clone()));
        }
        state.pending.insert(offer.offer_id.clone(), offer.clone());
        let user = state
            .users
            .entry(offer.participant_id.clone())
            .or_insert_with(|| Participant::new(&offer.participant_id));
        user.trade_id = offer.offer_id.clone();
        user.protection_code = protection_code.to_string();
        Ok(())
    }

    async fn get_pending(&self, offer_id: &str) -> Result<Option<PendingOffer>, LedgerError> {
        Ok(self.lock().pending.get(offer_id).cloned())
    }

    async fn promote_pending(&self, offer_id: &str) -> Result<Option<QueueEntry>, LedgerError> {
        let mut state = self.lock();
        let Some(pending) = state.pending.remove(offer_id) else {
            return Ok(None);
        };
        let entry = QueueEntry::from_pending(pending);
        state.queue.push(entry.clone());
        Ok(Some(entry))
    }

    async fn cancel_pending(&self, offer_id: &str) -> Result<Option<PendingOffer>, LedgerError> {
        let mut state = self.lock();
        let Some(pending) = state.pending.remove(offer_id) else {
            return Ok(None);
        };
        if !pending.participant_id.is_empty() {
            if let Some(user) = state.users.get_mut(&pending.participant_id) {
                if user.trade_id == offer_id {
                    user.trade_id.clear();
                    user.protection_code.clear();
                }
            }
        }
        Ok(Some(pending))
    }

    async fn insert_winning(&self, offer: &WinningOffer) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if state.pending.contains_key(&offer.offer_id) {
            return Err(LedgerError::Conflict(offer.offer_id.clone()));
        }
        state.winning.insert(offer.offer_id.clone(), offer.clone());
        Ok(())
    }

    async fn get_winning(&self, offer_id: &str) -> Result<Option<WinningOffer>, LedgerError> {
        Ok(self.lock().winning.get(offer_id).cloned())
    }

    async fn take_winning(&self, offer_id: &str) -> Result<Option<WinningOffer>, LedgerError> {
        Ok(self.lock().winning.remove(offer_id))
    }

    async fn get_participant(&self, id: &str) -> Result<Option<Participant>, LedgerError> {
        Ok(self.lock().users.get(id).cloned())
    }

    async fn set_error_flag(&self, id: &str, error: bool) -> Result<(), LedgerError> {
        let mut state = self.lock();
        state
            .users
            .entry(id.to_string())
            .or_insert_with(|| Participant::new(id))
            .error = error;
        Ok(())
    }

    async fn queue(&self) -> Result<Vec<QueueEntry>, LedgerError> {
        Ok(self.lock().queue.clone())
    }

    async fn save_poll_data(&self, data: &PollData) -> Result<(), LedgerError> {
        self.lock().poll_data = Some(data.clone());
        Ok(())
    }

    async fn load_poll_data(&self) -> Result<Option<PollData>, LedgerError> {
        Ok(self.lock().poll_data.clone())
    }
}
