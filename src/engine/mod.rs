//! Core engine: issue offers, poll the platform, reconcile the ledger.

pub mod dispatch;
pub mod issuer;
pub mod poller;
pub mod reconciler;
pub mod retry;
pub mod selector;
