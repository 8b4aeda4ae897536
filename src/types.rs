//! Shared types for the OFFERKEEPER agent.
//!
//! These types form the data model used across all modules: the request
//! bodies accepted over HTTP, the ledger records, the platform-facing offer
//! shapes, and the domain error enums.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Steam app id for CS:GO items.
pub const CSGO_APP_ID: u32 = 730;

/// Inventory context holding tradable CS:GO items.
pub const CSGO_CONTEXT_ID: u64 = 2;

// ---------------------------------------------------------------------------
// Offer state
// ---------------------------------------------------------------------------

/// Trade offer state as reported by the platform (`ETradeOfferState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfferState {
    Invalid,
    Active,
    Accepted,
    Countered,
    Expired,
    Canceled,
    Declined,
    InvalidItems,
    CreatedNeedsConfirmation,
    CanceledBySecondFactor,
    InEscrow,
}

impl OfferState {
    /// Map the platform's numeric state code.
    pub fn from_code(code: u8) -> Option<Self> {
        let state = match code {
            1 => OfferState::Invalid,
            2 => OfferState::Active,
            3 => OfferState::Accepted,
            4 => OfferState::Countered,
            5 => OfferState::Expired,
            6 => OfferState::Canceled,
            7 => OfferState::Declined,
            8 => OfferState::InvalidItems,
            9 => OfferState::CreatedNeedsConfirmation,
            10 => OfferState::CanceledBySecondFactor,
            11 => OfferState::InEscrow,
            _ => return None,
        };
        Some(state)
    }

    /// Whether the offer can still change state.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            OfferState::Active | OfferState::CreatedNeedsConfirmation | OfferState::InEscrow
        )
    }
}

impl fmt::Display for OfferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OfferState::Invalid => "Invalid",
            OfferState::Active => "Active",
            OfferState::Accepted => "Accepted",
            OfferState::Countered => "Countered",
            OfferState::Expired => "Expired",
            OfferState::Canceled => "Canceled",
            OfferState::Declined => "Declined",
            OfferState::InvalidItems => "InvalidItems",
            OfferState::CreatedNeedsConfirmation => "CreatedNeedsConfirmation",
            OfferState::CanceledBySecondFactor => "CanceledBySecondFactor",
            OfferState::InEscrow => "InEscrow",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

fn default_app_id() -> u32 {
    CSGO_APP_ID
}

fn default_context_id() -> String {
    CSGO_CONTEXT_ID.to_string()
}

fn default_amount() -> u32 {
    1
}

/// Accepts `"2"` or `2` for id-like fields; front-ends send both.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// An item as sent by the site front-end (deposit or withdrawal body).
///
/// Unknown fields (icon urls, rarity colours, ...) are carried in `extra`
/// so the record written to the ledger matches what the caller sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default = "default_app_id")]
    pub appid: u32,
    #[serde(default = "default_context_id", deserialize_with = "string_or_number")]
    pub contextid: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub assetid: String,
    #[serde(default = "default_amount")]
    pub amount: u32,
    #[serde(default)]
    pub market_hash_name: String,
    /// Market price in USD. Absent prices never qualify as rake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_price: Option<Decimal>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Item {
    /// Drop client-only bookkeeping keys (`$$hashKey` and friends).
    pub fn strip_client_fields(&mut self) {
        self.extra.retain(|key, _| !key.starts_with("$$"));
    }

    pub fn to_asset(&self) -> AssetRef {
        AssetRef {
            appid: self.appid,
            contextid: self.contextid.clone(),
            assetid: self.assetid.clone(),
            amount: self.amount,
        }
    }
}

/// Asset reference as embedded in an outgoing trade offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub appid: u32,
    pub contextid: String,
    pub assetid: String,
    pub amount: u32,
}

/// An item held in the agent's own inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub assetid: String,
    pub appid: u32,
    pub contextid: String,
    pub amount: u32,
    pub market_hash_name: String,
    pub tradable: bool,
}

impl InventoryItem {
    pub fn to_asset(&self) -> AssetRef {
        AssetRef {
            appid: self.appid,
            contextid: self.contextid.clone(),
            assetid: self.assetid.clone(),
            amount: self.amount,
        }
    }
}

impl fmt::Display for InventoryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (asset {})", self.market_hash_name, self.assetid)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Body of `POST /user-deposit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub id: String,
    pub trade_token: String,
    pub items: Vec<Item>,
    #[serde(default)]
    pub avatar: String,
    #[serde(default, rename = "full_avatar")]
    pub full_avatar: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub items_count: u32,
    #[serde(default)]
    pub items_value: Decimal,
}

/// The payout recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Winner {
    pub id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Body of `POST /user-withdraw`. Stored verbatim in the winning table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub winner: Winner,
    pub jackpot_value: Decimal,
    pub trade_token: String,
    pub items: Vec<Item>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

/// Per-participant trade metadata (`users/{id}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    /// Offer id of the outstanding deposit; empty when none.
    pub trade_id: String,
    /// Empty when none.
    pub protection_code: String,
    pub error: bool,
}

impl Participant {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            trade_id: String::new(),
            protection_code: String::new(),
            error: false,
        }
    }

    pub fn has_active_trade(&self) -> bool {
        !self.trade_id.is_empty()
    }
}

/// A deposit awaiting confirmation (`pending/{offerId}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOffer {
    pub offer_id: String,
    /// Depositor; serialised as `id` to match the deposit body.
    #[serde(rename = "id")]
    pub participant_id: String,
    pub items: Vec<Item>,
    pub items_count: u32,
    pub items_value: Decimal,
    pub avatar: String,
    #[serde(rename = "full_avatar")]
    pub full_avatar: String,
    pub display_name: String,
    pub trade_token: String,
    pub created_at: DateTime<Utc>,
}

impl PendingOffer {
    /// Build the ledger record for a deposit that was just sent.
    pub fn from_deposit(offer_id: &str, request: &DepositRequest) -> Self {
        let items = request
            .items
            .iter()
            .cloned()
            .map(|mut item| {
                item.strip_client_fields();
                item
            })
            .collect();

        Self {
            offer_id: offer_id.to_string(),
            participant_id: request.id.clone(),
            items,
            items_count: request.items_count,
            items_value: request.items_value,
            avatar: request.avatar.clone(),
            full_avatar: request.full_avatar.clone(),
            display_name: request.display_name.clone(),
            trade_token: request.trade_token.clone(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
impl PendingOffer {
    /// Helper to build a test deposit record with one item.
    pub fn sample(offer_id: &str, participant_id: &str) -> Self {
        let request = DepositRequest {
            id: participant_id.to_string(),
            trade_token: "tok".to_string(),
            items: vec![Item {
                appid: CSGO_APP_ID,
                contextid: "2".to_string(),
                assetid: "1001".to_string(),
                amount: 1,
                market_hash_name: "AK-47 | Redline (Field-Tested)".to_string(),
                market_price: Some(Decimal::new(842, 2)),
                extra: serde_json::Map::new(),
            }],
            avatar: "a.jpg".to_string(),
            full_avatar: "a_full.jpg".to_string(),
            display_name: "depositor".to_string(),
            items_count: 1,
            items_value: Decimal::new(842, 2),
        };
        Self::from_deposit(offer_id, &request)
    }
}

#[cfg(test)]
impl WinningOffer {
    /// Helper to build a test payout record.
    pub fn sample(offer_id: &str, winner_id: &str) -> Self {
        Self {
            offer_id: offer_id.to_string(),
            request: WithdrawalRequest {
                winner: Winner {
                    id: winner_id.to_string(),
                    extra: serde_json::Map::new(),
                },
                jackpot_value: Decimal::new(1000, 0),
                trade_token: "tok".to_string(),
                items: Vec::new(),
                extra: serde_json::Map::new(),
            },
            created_at: Utc::now(),
        }
    }
}

impl fmt::Display for PendingOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending #{} from {} ({} items, ${:.2})",
            self.offer_id, self.participant_id, self.items_count, self.items_value,
        )
    }
}

/// A sent payout not yet settled (`winning/{offerId}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinningOffer {
    pub offer_id: String,
    /// The original withdrawal request, replayed on reissue.
    #[serde(rename = "userInfo")]
    pub request: WithdrawalRequest,
    pub created_at: DateTime<Utc>,
}

/// A confirmed deposit handed to the jackpot processor (`queue`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub key: String,
    #[serde(flatten)]
    pub deposit: PendingOffer,
    pub queued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn from_pending(deposit: PendingOffer) -> Self {
        Self {
            key: uuid::Uuid::new_v4().to_string(),
            deposit,
            queued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Platform shapes
// ---------------------------------------------------------------------------

/// An offer about to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingOffer {
    /// Counterparty SteamID64.
    pub partner: String,
    pub my_items: Vec<AssetRef>,
    pub their_items: Vec<AssetRef>,
    pub message: String,
    pub trade_token: Option<String>,
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentOffer {
    pub id: String,
    /// "sent", or "pending" when mobile/email confirmation is required.
    pub status: String,
}

/// One offer as seen in a poll response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferSummary {
    pub id: String,
    pub partner: String,
    pub state: OfferState,
    /// Unix seconds of the last state change.
    pub updated_at: i64,
}

/// Sent and received offers returned by one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferSnapshot {
    pub sent: Vec<OfferSummary>,
    pub received: Vec<OfferSummary>,
}

/// Last known state of an offer inside the poll checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRecord {
    pub state: OfferState,
    pub updated_at: i64,
}

/// Poll checkpoint, persisted so a restart does not replay old changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollData {
    /// Unix seconds; offers unchanged since before this are not fetched.
    pub cutoff: i64,
    pub sent: BTreeMap<String, OfferRecord>,
    pub received: BTreeMap<String, OfferRecord>,
}

/// Account restrictions reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountLimitations {
    pub limited: bool,
    pub community_banned: bool,
    /// Trade-locked; the agent must not run.
    pub locked: bool,
    pub can_invite_friends: bool,
}

/// Notifications flowing from the poller to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// One of our sent offers changed state.
    SentOfferChanged {
        offer_id: String,
        state: OfferState,
        prior: Option<OfferState>,
    },
    /// A counterparty opened an offer to us.
    NewOffer { offer_id: String, partner: String },
}

/// One poll's events and the checkpoint to persist once they are handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollBatch {
    pub events: Vec<PlatformEvent>,
    pub checkpoint: PollData,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures reported by the trading platform client.
///
/// The retry policy classifies these by their rendered message, so the
/// status code must stay in the text.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    /// Non-success response. Only the status is displayed, so retry
    /// classification never sees page content.
    #[error("HTTP error {status}")]
    Http { status: u16, body: String },

    #[error("Offer rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed platform response: {0}")]
    Decode(String),

    #[error("Web session expired (401)")]
    SessionExpired,
}

impl From<reqwest::Error> for PlatformError {
    fn from(err: reqwest::Error) -> Self {
        // Request URLs carry query values such as `count=2000`.
        let err = err.without_url();
        match err.status() {
            Some(status) => PlatformError::Http {
                status: status.as_u16(),
                body: String::new(),
            },
            None if err.is_decode() => PlatformError::Decode(err.to_string()),
            None => PlatformError::Transport(err.to_string()),
        }
    }
}

/// Failures from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Offer {0} is already tracked in another table")]
    Conflict(String),
}

/// Terminal outcome of an issuance attempt, after retries.
#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No inventory items matched the withdrawal for {0}")]
    NothingToSend(String),

    #[error("Platform rejected offer: {0}")]
    Rejected(PlatformError),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: PlatformError },

    /// The offer is live on the platform but could not be written to the
    /// ledger.
    #[error("Offer {offer_id} sent but not recorded: {source}")]
    Unrecorded {
        offer_id: String,
        source: LedgerError,
    },

    #[error("Issuer is shutting down")]
    ShuttingDown,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
