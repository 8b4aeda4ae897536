//! Mock platform for integration testing.
//!
//! Provides a deterministic `TradePlatform` implementation that issues
//! sequential offer ids, serves a fixed inventory, and reports whatever
//! offer states the test sets. Send failures can be scripted up front.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use offerkeeper::platforms::TradePlatform;
use offerkeeper::types::*;

#[derive(Default)]
struct State {
    next_id: u64,
    inventory: Vec<InventoryItem>,
    sent: Vec<(String, OutgoingOffer)>,
    /// Offer id -> (partner, state, updated_at), as polls report them.
    sent_states: BTreeMap<String, (String, OfferState, i64)>,
    received: BTreeMap<String, (String, OfferState, i64)>,
    send_failures: VecDeque<PlatformError>,
    declined: Vec<String>,
    session_refreshes: u32,
}

/// A mock trade platform. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<State>>,
}

impl MockPlatform {
    pub fn new(inventory: Vec<InventoryItem>) -> Self {
        let platform = Self::default();
        {
            let mut state = platform.state.lock().unwrap();
            state.next_id = 1000;
            state.inventory = inventory;
        }
        platform
    }

    /// Make the next `send_offer` call fail with `err`.
    pub fn fail_next_send(&self, err: PlatformError) {
        self.state.lock().unwrap().send_failures.push_back(err);
    }

    /// Report a new state for one of our sent offers on the next poll.
    pub fn set_state(&self, offer_id: &str, offer_state: OfferState, updated_at: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.sent_states.get_mut(offer_id) {
            entry.1 = offer_state;
            entry.2 = updated_at;
        }
    }

    /// Simulate a counterparty opening an offer to us.
    pub fn receive_offer(&self, offer_id: &str, partner: &str, updated_at: i64) {
        self.state.lock().unwrap().received.insert(
            offer_id.to_string(),
            (partner.to_string(), OfferState::Active, updated_at),
        );
    }

    pub fn sent(&self) -> Vec<(String, OutgoingOffer)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn last_sent_id(&self) -> Option<String> {
        self.state.lock().unwrap().sent.last().map(|(id, _)| id.clone())
    }

    pub fn declined(&self) -> Vec<String> {
        self.state.lock().unwrap().declined.clone()
    }

    pub fn session_refreshes(&self) -> u32 {
        self.state.lock().unwrap().session_refreshes
    }
}

fn summaries(map: &BTreeMap<String, (String, OfferState, i64)>, cutoff: i64) -> Vec<OfferSummary> {
    map.iter()
        .filter(|(_, (_, state, updated_at))| !state.is_terminal() || *updated_at >= cutoff)
        .map(|(id, (partner, state, updated_at))| OfferSummary {
            id: id.clone(),
            partner: partner.clone(),
            state: *state,
            updated_at: *updated_at,
        })
        .collect()
}

#[async_trait]
impl TradePlatform for MockPlatform {
    async fn send_offer(&self, offer: &OutgoingOffer) -> Result<SentOffer, PlatformError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }

        state.next_id += 1;
        let id = state.next_id.to_string();
        state.sent.push((id.clone(), offer.clone()));
        state
            .sent_states
            .insert(id.clone(), (offer.partner.clone(), OfferState::Active, 0));
        Ok(SentOffer {
            id,
            status: "sent".to_string(),
        })
    }

    async fn decline_offer(&self, offer_id: &str) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        match state.received.get_mut(offer_id) {
            Some(entry) => {
                entry.1 = OfferState::Declined;
                state.declined.push(offer_id.to_string());
                Ok(())
            }
            None => Err(PlatformError::Rejected(format!("no such offer {offer_id}"))),
        }
    }

    async fn load_inventory(
        &self,
        app_id: u32,
        context_id: u64,
        tradable_only: bool,
    ) -> Result<Vec<InventoryItem>, PlatformError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .inventory
            .iter()
            .filter(|item| item.appid == app_id && item.contextid == context_id.to_string())
            .filter(|item| !tradable_only || item.tradable)
            .cloned()
            .collect())
    }

    async fn poll_offers(&self, cutoff: i64) -> Result<OfferSnapshot, PlatformError> {
        let state = self.state.lock().unwrap();
        Ok(OfferSnapshot {
            sent: summaries(&state.sent_states, cutoff),
            received: summaries(&state.received, cutoff),
        })
    }

    async fn refresh_session(&self) -> Result<(), PlatformError> {
        self.state.lock().unwrap().session_refreshes += 1;
        Ok(())
    }

    async fn account_limitations(&self) -> Result<AccountLimitations, PlatformError> {
        Ok(AccountLimitations {
            can_invite_friends: true,
            ..AccountLimitations::default()
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// A tradable CS:GO inventory item.
pub fn held(assetid: &str, name: &str) -> InventoryItem {
    InventoryItem {
        assetid: assetid.to_string(),
        appid: CSGO_APP_ID,
        contextid: CSGO_CONTEXT_ID.to_string(),
        amount: 1,
        market_hash_name: name.to_string(),
        tradable: true,
    }
}
