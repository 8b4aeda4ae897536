//! Offer poller.
//!
//! Polls the platform for offer changes since the checkpoint cutoff, diffs
//! them against the last known states and hands each poll's events to the
//! reconciler together with the advanced checkpoint. The reconciler
//! persists the checkpoint only after the events are applied, so a restart
//! replays anything that was not.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::platforms::TradePlatform;
use crate::storage::Ledger;
use crate::types::{
    LedgerError, OfferRecord, OfferState, OfferSummary, PlatformError, PlatformEvent, PollBatch,
    PollData,
};

pub struct OfferPoller {
    platform: Arc<dyn TradePlatform>,
    config: PollerConfig,
    poll_data: PollData,
}

impl OfferPoller {
    pub fn new(platform: Arc<dyn TradePlatform>, config: PollerConfig, poll_data: PollData) -> Self {
        Self {
            platform,
            config,
            poll_data,
        }
    }

    /// Build a poller from the persisted checkpoint, or start a fresh one
    /// looking back `initial_lookback_secs`.
    pub async fn restore(
        platform: Arc<dyn TradePlatform>,
        ledger: &dyn Ledger,
        config: PollerConfig,
    ) -> Result<Self, LedgerError> {
        let poll_data = match ledger.load_poll_data().await? {
            Some(data) => {
                info!(
                    cutoff = data.cutoff,
                    sent = data.sent.len(),
                    received = data.received.len(),
                    "Restored poll checkpoint"
                );
                data
            }
            None => {
                let cutoff = chrono::Utc::now().timestamp() - config.initial_lookback_secs;
                info!(cutoff, "No poll checkpoint, starting fresh");
                PollData {
                    cutoff,
                    ..PollData::default()
                }
            }
        };
        Ok(Self::new(platform, config, poll_data))
    }

    pub fn poll_data(&self) -> &PollData {
        &self.poll_data
    }

    /// One poll: fetch, diff, advance the checkpoint. Persisting it is left
    /// to whoever applies the events.
    pub async fn poll_once(&mut self) -> Result<PollBatch, PlatformError> {
        let snapshot = self.platform.poll_offers(self.poll_data.cutoff).await?;
        let mut events = Vec::new();

        for offer in &snapshot.sent {
            if let Some(event) = diff_sent(&self.poll_data.sent, offer) {
                events.push(event);
            }
            self.poll_data.sent.insert(offer.id.clone(), record(offer));
        }

        for offer in &snapshot.received {
            let known = self.poll_data.received.contains_key(&offer.id);
            if !known && offer.state == OfferState::Active {
                events.push(PlatformEvent::NewOffer {
                    offer_id: offer.id.clone(),
                    partner: offer.partner.clone(),
                });
            }
            self.poll_data.received.insert(offer.id.clone(), record(offer));
        }

        let latest = snapshot
            .sent
            .iter()
            .chain(snapshot.received.iter())
            .map(|offer| offer.updated_at)
            .max();
        if let Some(latest) = latest {
            self.poll_data.cutoff = self.poll_data.cutoff.max(latest);
        }

        let horizon = self.poll_data.cutoff - self.config.initial_lookback_secs;
        prune(&mut self.poll_data.sent, horizon);
        prune(&mut self.poll_data.received, horizon);

        debug!(
            sent = snapshot.sent.len(),
            received = snapshot.received.len(),
            events = events.len(),
            cutoff = self.poll_data.cutoff,
            "Poll complete"
        );
        Ok(PollBatch {
            events,
            checkpoint: self.poll_data.clone(),
        })
    }

    /// Poll on an interval until `shutdown` flips or the reconciler is gone.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<PollBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval_secs, "Offer poller started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let batch = match self.poll_once().await {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(error = %e, "Offer poll failed");
                            continue;
                        }
                    };
                    if tx.send(batch).await.is_err() {
                        info!("Reconciler channel closed, poller stopping");
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    info!("Offer poller shutting down");
                    return;
                }
            }
        }
    }
}

fn record(offer: &OfferSummary) -> OfferRecord {
    OfferRecord {
        state: offer.state,
        updated_at: offer.updated_at,
    }
}

/// Event for a sent offer whose state differs from the checkpoint.
///
/// Offers missing from the checkpoint only produce an event once they are
/// terminal; open ones are recorded silently.
fn diff_sent(known: &BTreeMap<String, OfferRecord>, offer: &OfferSummary) -> Option<PlatformEvent> {
    let prior = known.get(&offer.id).map(|r| r.state);
    let changed = match prior {
        Some(state) => state != offer.state,
        None => offer.state.is_terminal(),
    };
    changed.then(|| PlatformEvent::SentOfferChanged {
        offer_id: offer.id.clone(),
        state: offer.state,
        prior,
    })
}

/// Forget terminal offers last updated before `horizon`.
fn prune(records: &mut BTreeMap<String, OfferRecord>, horizon: i64) {
    records.retain(|_, r| !r.state.is_terminal() || r.updated_at >= horizon);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
