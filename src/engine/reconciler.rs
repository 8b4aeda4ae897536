//! Reconciler.
//!
//! Consumes offer state changes from the poller and drives the ledger:
//! accepted deposits move to the processing queue, accepted payouts are
//! settled, payouts whose items vanished are reissued, and dead deposits
//! release the participant. Every ledger transition is one atomic call, so
//! a duplicate notification lands as a miss.
//!
//! An event whose ledger transition fails is held back and retried with the
//! next poll. The poll checkpoint is only saved while nothing is held back,
//! so a restart replays whatever was not applied.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::issuer::OfferIssuer;
use crate::platforms::TradePlatform;
use crate::storage::Ledger;
use crate::types::{LedgerError, OfferState, PlatformEvent, PollBatch, PollData};

/// Where one of our sent offers is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferPhase {
    /// Sent, no state change seen yet.
    Issued,
    /// Still open on the platform (active, awaiting confirmation, escrow).
    PendingConfirmation,
    Accepted,
    /// Items became unavailable; a fresh payout was issued.
    Reissued,
    /// Declined, expired, canceled or otherwise dead.
    Cleared,
}

impl OfferPhase {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OfferPhase::Accepted | OfferPhase::Reissued | OfferPhase::Cleared
        )
    }

    /// Next phase after the platform reports `state`. Final phases stick.
    pub fn advance(self, state: OfferState) -> OfferPhase {
        if self.is_final() {
            return self;
        }
        match state {
            OfferState::Accepted => OfferPhase::Accepted,
            OfferState::InvalidItems => OfferPhase::Reissued,
            s if !s.is_terminal() => OfferPhase::PendingConfirmation,
            _ => OfferPhase::Cleared,
        }
    }
}

/// What handling one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted deposit moved to the processing queue under `key`.
    Queued { key: String },
    /// Accepted payout removed from the winning table.
    Settled,
    /// Payout with unavailable items handed back to the issuer.
    Reissued,
    /// Dead deposit removed and its participant released.
    Cleared,
    /// Id found in neither table.
    Miss,
    /// Offer still open; nothing to do yet.
    Pending,
    Declined,
    DeclineFailed,
}

pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    platform: Arc<dyn TradePlatform>,
    issuer: Arc<OfferIssuer>,
    phases: HashMap<String, OfferPhase>,
    /// Events whose ledger transition failed, oldest first.
    backlog: VecDeque<PlatformEvent>,
    reissues: JoinSet<()>,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        platform: Arc<dyn TradePlatform>,
        issuer: Arc<OfferIssuer>,
    ) -> Self {
        Self {
            ledger,
            platform,
            issuer,
            phases: HashMap::new(),
            backlog: VecDeque::new(),
            reissues: JoinSet::new(),
        }
    }

    /// Current phase of an offer still being tracked.
    pub fn phase(&self, offer_id: &str) -> Option<OfferPhase> {
        self.phases.get(offer_id).copied()
    }

    /// Events waiting for their ledger transition to be retried.
    pub fn held_back(&self) -> usize {
        self.backlog.len()
    }

    /// Reissues spawned and not yet finished.
    pub fn reissues_in_flight(&self) -> usize {
        self.reissues.len()
    }

    /// Apply one poll: retry held-back events, apply the new ones, then save
    /// the checkpoint unless something is still held back.
    pub async fn process(&mut self, batch: PollBatch) -> Vec<Outcome> {
        let PollBatch { events, checkpoint } = batch;
        let held = std::mem::take(&mut self.backlog);
        let mut outcomes = Vec::with_capacity(held.len() + events.len());

        for event in held.into_iter().chain(events) {
            match self.handle(event.clone()).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(?event, error = %e, "Ledger transition failed, holding event for the next poll");
                    self.backlog.push_back(event);
                }
            }
        }

        self.forget_untracked(&checkpoint);

        if self.backlog.is_empty() {
            if let Err(e) = self.ledger.save_poll_data(&checkpoint).await {
                warn!(error = %e, "Failed to persist poll checkpoint");
            }
        } else {
            warn!(
                held = self.backlog.len(),
                "Poll checkpoint not saved while events are held back"
            );
        }
        outcomes
    }

    /// Drop phases for offers the checkpoint no longer tracks.
    fn forget_untracked(&mut self, checkpoint: &PollData) {
        let before = self.phases.len();
        self.phases.retain(|id, _| checkpoint.sent.contains_key(id));
        let dropped = before - self.phases.len();
        if dropped > 0 {
            debug!(dropped, "Forgot phases of offers no longer polled");
        }
    }

    pub async fn handle(&mut self, event: PlatformEvent) -> Result<Outcome, LedgerError> {
        match event {
            PlatformEvent::SentOfferChanged {
                offer_id,
                state,
                prior,
            } => {
                debug!(offer_id = %offer_id, %state, prior = ?prior, "Sent offer changed");
                let phase = self
                    .phases
                    .get(&offer_id)
                    .copied()
                    .unwrap_or(OfferPhase::Issued)
                    .advance(state);

                let outcome = self.apply(&offer_id, state).await?;

                // Final offers never change again; stop tracking them.
                if phase.is_final() {
                    self.phases.remove(&offer_id);
                } else {
                    self.phases.insert(offer_id, phase);
                }
                Ok(outcome)
            }
            PlatformEvent::NewOffer { offer_id, partner } => {
                Ok(self.decline_inbound(&offer_id, &partner).await)
            }
        }
    }

    async fn apply(&mut self, offer_id: &str, state: OfferState) -> Result<Outcome, LedgerError> {
        match state {
            OfferState::Accepted => self.on_accepted(offer_id).await,
            OfferState::InvalidItems => self.on_items_unavailable(offer_id).await,
            s if !s.is_terminal() => Ok(Outcome::Pending),
            _ => self.on_dead(offer_id, state).await,
        }
    }

    async fn on_accepted(&self, offer_id: &str) -> Result<Outcome, LedgerError> {
        if let Some(entry) = self.ledger.promote_pending(offer_id).await? {
            info!(
                offer_id,
                participant = %entry.deposit.participant_id,
                key = %entry.key,
                items = entry.deposit.items.len(),
                "Deposit accepted, queued for processing"
            );
            return Ok(Outcome::Queued { key: entry.key });
        }

        if let Some(winning) = self.ledger.take_winning(offer_id).await? {
            info!(
                offer_id,
                winner = %winning.request.winner.id,
                jackpot = %winning.request.jackpot_value,
                "Payout accepted, settled"
            );
            return Ok(Outcome::Settled);
        }

        warn!(offer_id, "Accepted offer not found in pending or winning");
        Ok(Outcome::Miss)
    }

    async fn on_items_unavailable(&mut self, offer_id: &str) -> Result<Outcome, LedgerError> {
        let Some(winning) = self.ledger.take_winning(offer_id).await? else {
            debug!(offer_id, "Items unavailable on an offer with no payout, ignoring");
            return Ok(Outcome::Miss);
        };

        warn!(
            offer_id,
            winner = %winning.request.winner.id,
            "Payout items unavailable, reissuing"
        );

        let issuer = Arc::clone(&self.issuer);
        let old_id = offer_id.to_string();
        let request = winning.request;
        self.reissues.spawn(async move {
            match issuer.withdraw(request).await {
                Ok(receipt) => info!(
                    old_offer = %old_id,
                    new_offer = %receipt.offer_id,
                    rake = %receipt.rake,
                    "Payout reissued"
                ),
                Err(e) => error!(old_offer = %old_id, error = %e, "Payout reissue failed"),
            }
        });

        Ok(Outcome::Reissued)
    }

    async fn on_dead(&self, offer_id: &str, state: OfferState) -> Result<Outcome, LedgerError> {
        match self.ledger.cancel_pending(offer_id).await? {
            Some(pending) => {
                info!(
                    offer_id,
                    %state,
                    participant = %pending.participant_id,
                    "Deposit offer ended, participant released"
                );
                Ok(Outcome::Cleared)
            }
            None => {
                debug!(offer_id, %state, "Ended offer not pending, no action");
                Ok(Outcome::Miss)
            }
        }
    }

    async fn decline_inbound(&self, offer_id: &str, partner: &str) -> Outcome {
        match self.platform.decline_offer(offer_id).await {
            Ok(()) => {
                info!(offer_id, partner, "Declined unsolicited offer");
                Outcome::Declined
            }
            Err(e) => {
                warn!(offer_id, partner, error = %e, "Failed to decline offer");
                Outcome::DeclineFailed
            }
        }
    }

    /// Process polls until the channel closes, then wait for reissues.
    pub async fn run(mut self, mut rx: mpsc::Receiver<PollBatch>) {
        info!("Reconciler started");

        loop {
            let batch = tokio::select! {
                batch = rx.recv() => batch,
                Some(joined) = self.reissues.join_next(), if !self.reissues.is_empty() => {
                    log_reissue_exit(joined);
                    continue;
                }
            };

            let Some(batch) = batch else {
                break;
            };
            self.process(batch).await;
        }

        if !self.backlog.is_empty() {
            error!(
                held = self.backlog.len(),
                "Stopping with unapplied events; they replay from the saved checkpoint"
            );
        }
        self.drain().await;
        info!("Reconciler stopped");
    }

    /// Wait for every spawned reissue to finish.
    pub async fn drain(&mut self) {
        if !self.reissues.is_empty() {
            info!(count = self.reissues.len(), "Waiting for in-flight reissues");
        }
        while let Some(joined) = self.reissues.join_next().await {
            log_reissue_exit(joined);
        }
    }
}

fn log_reissue_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Reissue task panicked or was aborted");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
