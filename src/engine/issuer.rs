//! Offer issuer.
//!
//! Builds and sends deposit and payout offers, records them in the ledger,
//! and drives the retry policy when the platform fails. The returned future
//! resolves once the offer is recorded or the policy gives up. HTTP callers
//! go through [`super::dispatch`] so a retry outlives the request.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::retry::{RetryDecision, RetryPolicy};
use super::selector::{select_payout, sort_by_price_desc};
use crate::platforms::TradePlatform;
use crate::storage::Ledger;
use crate::types::{
    DepositRequest, IssueError, Item, LedgerError, OutgoingOffer, PendingOffer, PlatformError,
    WinningOffer, WithdrawalRequest,
};

const PROTECTION_CODE_LEN: usize = 7;

/// Ledger writes for a live offer are retried this many times in total.
const RECORD_ATTEMPTS: u32 = 3;
const RECORD_BACKOFF: Duration = Duration::from_secs(1);

/// Static inputs for building offers.
#[derive(Debug, Clone)]
pub struct IssuerSettings {
    pub site_name: String,
    pub app_id: u32,
    pub context_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositReceipt {
    pub offer_id: String,
    pub status: String,
    pub protection_code: String,
}

impl DepositReceipt {
    /// The status string returned to the site.
    pub fn status_line(&self) -> String {
        format!(
            "Trade offer status: {}, protection code: {} trade ID: {}",
            self.status, self.protection_code, self.offer_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalReceipt {
    pub offer_id: String,
    pub status: String,
    pub rake: String,
    pub items_sent: usize,
}

impl WithdrawalReceipt {
    pub fn status_line(&self) -> String {
        format!(
            "Trade offer status: {}, trade ID: {}, rake: {}",
            self.status, self.offer_id, self.rake
        )
    }
}

/// Which path an attempt belongs to, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferPath {
    Deposit,
    Withdrawal,
}

/// Failure of a single attempt.
enum AttemptError {
    /// Goes through the retry policy.
    Platform(PlatformError),
    /// Ends the request immediately.
    Abort(IssueError),
}

impl From<PlatformError> for AttemptError {
    fn from(err: PlatformError) -> Self {
        AttemptError::Platform(err)
    }
}

/// Random 7-character uppercase code shown to the depositor.
pub fn protection_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PROTECTION_CODE_LEN)
        .map(char::from)
        .collect::<String>()
        .to_uppercase()
}

fn trade_token(token: &str) -> Option<String> {
    (!token.is_empty()).then(|| token.to_string())
}

pub struct OfferIssuer {
    platform: Arc<dyn TradePlatform>,
    ledger: Arc<dyn Ledger>,
    retry: RetryPolicy,
    settings: IssuerSettings,
}

impl OfferIssuer {
    pub fn new(
        platform: Arc<dyn TradePlatform>,
        ledger: Arc<dyn Ledger>,
        retry: RetryPolicy,
        settings: IssuerSettings,
    ) -> Self {
        Self {
            platform,
            ledger,
            retry,
            settings,
        }
    }

    /// Request the participant's items into the jackpot.
    pub async fn deposit(&self, request: DepositRequest) -> Result<DepositReceipt, IssueError> {
        if request.id.is_empty() {
            return Err(IssueError::InvalidRequest("missing participant id".into()));
        }
        if request.items.is_empty() {
            return Err(IssueError::InvalidRequest(format!(
                "deposit from {} has no items",
                request.id
            )));
        }

        self.with_retry(OfferPath::Deposit, &request.id, || self.try_deposit(&request))
            .await
    }

    /// Pay the jackpot out to the winner, keeping the rake item.
    pub async fn withdraw(
        &self,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalReceipt, IssueError> {
        if request.winner.id.is_empty() {
            return Err(IssueError::InvalidRequest("missing winner id".into()));
        }

        self.with_retry(OfferPath::Withdrawal, &request.winner.id, || {
            self.try_withdraw(&request)
        })
        .await
    }

    async fn try_deposit(&self, request: &DepositRequest) -> Result<DepositReceipt, AttemptError> {
        let code = protection_code();
        let offer = OutgoingOffer {
            partner: request.id.clone(),
            my_items: Vec::new(),
            their_items: request.items.iter().map(Item::to_asset).collect(),
            message: format!(
                "Deposit for {} jackpot, seems like a lucky one! Protection Code: {code}",
                self.settings.site_name
            ),
            trade_token: trade_token(&request.trade_token),
        };

        let sent = self.platform.send_offer(&offer).await?;

        let pending = PendingOffer::from_deposit(&sent.id, request);
        self.record(&sent.id, &request.id, || {
            self.ledger.record_deposit(&pending, &code)
        })
        .await?;

        info!(
            offer_id = %sent.id,
            participant = %request.id,
            items = request.items.len(),
            status = %sent.status,
            "Deposit offer recorded as pending"
        );

        Ok(DepositReceipt {
            offer_id: sent.id,
            status: sent.status,
            protection_code: code,
        })
    }

    async fn try_withdraw(
        &self,
        request: &WithdrawalRequest,
    ) -> Result<WithdrawalReceipt, AttemptError> {
        let mut wanted = request.items.clone();
        sort_by_price_desc(&mut wanted);

        let inventory = self
            .platform
            .load_inventory(self.settings.app_id, self.settings.context_id, true)
            .await?;
        let selection = select_payout(&wanted, inventory, request.jackpot_value);

        if selection.items.is_empty() {
            return Err(AttemptError::Abort(IssueError::NothingToSend(
                request.winner.id.clone(),
            )));
        }

        let offer = OutgoingOffer {
            partner: request.winner.id.clone(),
            my_items: selection.items.iter().map(|item| item.to_asset()).collect(),
            their_items: Vec::new(),
            message: format!(
                "Thanks for playing, here are your winnings! Our rake was: {} Still feeling lucky? Play again!",
                selection.rake
            ),
            trade_token: trade_token(&request.trade_token),
        };

        let sent = self.platform.send_offer(&offer).await?;

        let winning = WinningOffer {
            offer_id: sent.id.clone(),
            request: request.clone(),
            created_at: chrono::Utc::now(),
        };
        self.record(&sent.id, &request.winner.id, || {
            self.ledger.insert_winning(&winning)
        })
        .await?;

        info!(
            offer_id = %sent.id,
            winner = %request.winner.id,
            items = selection.items.len(),
            rake = %selection.rake,
            jackpot = %request.jackpot_value,
            "Payout offer recorded as winning"
        );

        Ok(WithdrawalReceipt {
            offer_id: sent.id,
            status: sent.status,
            rake: selection.rake,
            items_sent: selection.items.len(),
        })
    }

    /// Run `attempt` until it succeeds or the policy stops it.
    async fn with_retry<T, F, Fut>(
        &self,
        path: OfferPath,
        participant: &str,
        mut attempt: F,
    ) -> Result<T, IssueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut attempts = 1;

        loop {
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Abort(err)) => {
                    error!(?path, participant, error = %err, "Offer issuance aborted");
                    if matches!(
                        err,
                        IssueError::NothingToSend(_) | IssueError::Unrecorded { .. }
                    ) {
                        self.flag_error(participant).await;
                    }
                    return Err(err);
                }
                Err(AttemptError::Platform(err)) => err,
            };

            match self.retry.decide(&err.to_string(), attempts) {
                RetryDecision::Retry {
                    delay,
                    refresh_session,
                } => {
                    warn!(
                        ?path,
                        participant,
                        attempt = attempts,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "Offer send failed, retrying"
                    );
                    if refresh_session {
                        if let Err(e) = self.platform.refresh_session().await {
                            warn!(error = %e, "Session refresh failed, retrying anyway");
                        }
                    }
                    tokio::time::sleep(delay).await;
                    attempts += 1;
                }
                RetryDecision::GiveUp => {
                    error!(?path, participant, error = %err, "Offer send failed permanently");
                    self.flag_error(participant).await;
                    return Err(IssueError::Rejected(err));
                }
                RetryDecision::Exhausted => {
                    error!(?path, participant, attempts, error = %err, "Offer send retries exhausted");
                    self.flag_error(participant).await;
                    return Err(IssueError::Exhausted {
                        attempts,
                        last: err,
                    });
                }
            }
        }
    }

    /// Write the ledger entry for an offer that is already live.
    ///
    /// The write is an upsert keyed by offer id, so it is retried here
    /// rather than resending the offer.
    async fn record<F, Fut>(
        &self,
        offer_id: &str,
        participant: &str,
        mut write: F,
    ) -> Result<(), AttemptError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), LedgerError>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < RECORD_ATTEMPTS => {
                    warn!(offer_id, participant, attempt, error = %e, "Ledger write failed, retrying");
                    tokio::time::sleep(RECORD_BACKOFF * 2u32.pow(attempt - 1)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        offer_id,
                        participant,
                        error = %e,
                        "Offer is live on the platform but missing from the ledger"
                    );
                    return Err(AttemptError::Abort(IssueError::Unrecorded {
                        offer_id: offer_id.to_string(),
                        source: e,
                    }));
                }
            }
        }
    }

    async fn flag_error(&self, participant: &str) {
        if let Err(e) = self.ledger.set_error_flag(participant, true).await {
            error!(participant, error = %e, "Failed to set participant error flag");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
