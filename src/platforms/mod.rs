//! Platform integrations.
//!
//! Defines the `TradePlatform` trait and the Steam trade-offer client that
//! implements it. Everything the agent does on the platform goes through
//! this trait, so the engine can be driven by a mock in tests.

pub mod steam;

use async_trait::async_trait;

use crate::types::{
    AccountLimitations, InventoryItem, OfferSnapshot, OutgoingOffer, PlatformError, SentOffer,
};

/// Abstraction over a peer-to-peer trade offer platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradePlatform: Send + Sync {
    /// Send a new trade offer. Returns the platform-issued offer id.
    async fn send_offer(&self, offer: &OutgoingOffer) -> Result<SentOffer, PlatformError>;

    /// Decline an offer someone sent us.
    async fn decline_offer(&self, offer_id: &str) -> Result<(), PlatformError>;

    /// Load the agent's own inventory for one app/context.
    async fn load_inventory(
        &self,
        app_id: u32,
        context_id: u64,
        tradable_only: bool,
    ) -> Result<Vec<InventoryItem>, PlatformError>;

    /// Offers that are active or changed since `cutoff` (unix seconds).
    async fn poll_offers(&self, cutoff: i64) -> Result<OfferSnapshot, PlatformError>;

    /// Obtain a fresh web session (after a 401).
    async fn refresh_session(&self) -> Result<(), PlatformError>;

    async fn account_limitations(&self) -> Result<AccountLimitations, PlatformError>;

    /// Platform name for logging and identification.
    fn name(&self) -> &str;
}
