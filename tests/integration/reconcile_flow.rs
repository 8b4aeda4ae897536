//! End-to-end flows: issue offers, let the platform change their state,
//! poll, reconcile, and check what the ledger ends up holding.

use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_test::{assert_err, assert_ok};

use offerkeeper::config::{PollerConfig, RetryConfig};
use offerkeeper::engine::dispatch::issue_channel;
use offerkeeper::engine::issuer::{IssuerSettings, OfferIssuer};
use offerkeeper::engine::poller::OfferPoller;
use offerkeeper::engine::reconciler::{Outcome, Reconciler};
use offerkeeper::engine::retry::RetryPolicy;
use offerkeeper::platforms::TradePlatform;
use offerkeeper::storage::{Ledger, MemoryLedger, SqliteLedger};
use offerkeeper::types::*;

use crate::mock_platform::{held, MockPlatform};

struct Harness {
    platform: MockPlatform,
    ledger: Arc<dyn Ledger>,
    issuer: Arc<OfferIssuer>,
    poller: OfferPoller,
    reconciler: Reconciler,
}

impl Harness {
    fn new(platform: MockPlatform, ledger: Arc<dyn Ledger>) -> Self {
        let shared: Arc<dyn TradePlatform> = Arc::new(platform.clone());
        let issuer = Arc::new(OfferIssuer::new(
            shared.clone(),
            ledger.clone(),
            RetryPolicy::new(RetryConfig::default()),
            IssuerSettings {
                site_name: "SnipeGo".into(),
                app_id: CSGO_APP_ID,
                context_id: CSGO_CONTEXT_ID,
            },
        ));
        let poller = OfferPoller::new(
            shared.clone(),
            PollerConfig::default(),
            PollData {
                cutoff: 1_000,
                ..PollData::default()
            },
        );
        let reconciler = Reconciler::new(ledger.clone(), shared, issuer.clone());
        Self {
            platform,
            ledger,
            issuer,
            poller,
            reconciler,
        }
    }

    fn in_memory(platform: MockPlatform) -> Self {
        Self::new(platform, Arc::new(MemoryLedger::new()))
    }

    /// Poll once and hand the batch to the reconciler.
    async fn sync(&mut self) -> Vec<Outcome> {
        let batch = self.poller.poll_once().await.unwrap();
        self.reconciler.process(batch).await
    }
}

fn deposit_body(participant: &str) -> DepositRequest {
    serde_json::from_value(json!({
        "id": participant,
        "tradeToken": "tok",
        "items": [
            {"appid": 730, "contextid": "2", "assetid": "501", "market_hash_name": "AWP | Asiimov (Field-Tested)", "market_price": 45.10, "$$hashKey": "object:4"},
            {"appid": 730, "contextid": "2", "assetid": "502", "market_hash_name": "Glock-18 | Fade (Factory New)", "market_price": 310.00}
        ],
        "avatar": "a.jpg",
        "full_avatar": "a_full.jpg",
        "displayName": "alice",
        "itemsCount": 2,
        "itemsValue": 355.10
    }))
    .unwrap()
}

fn withdrawal_body(winner: &str) -> WithdrawalRequest {
    serde_json::from_value(json!({
        "winner": {"id": winner, "displayName": "lucky"},
        "jackpotValue": 1000,
        "tradeToken": "wintok",
        "items": [
            {"market_hash_name": "Pistol", "market_price": 20},
            {"market_hash_name": "Knife", "market_price": 95},
            {"market_hash_name": "Rifle", "market_price": 50}
        ],
        "roundId": 31
    }))
    .unwrap()
}

fn jackpot_inventory() -> Vec<InventoryItem> {
    vec![held("a", "Pistol"), held("b", "Knife"), held("c", "Rifle")]
}

async fn deposit_accepted_is_queued(ledger: Arc<dyn Ledger>) {
    let mut h = Harness::new(MockPlatform::new(Vec::new()), ledger);

    let receipt = assert_ok!(h.issuer.deposit(deposit_body("alice")).await);
    assert!(h.sync().await.is_empty());

    h.platform.set_state(&receipt.offer_id, OfferState::Accepted, 2_000);
    let outcomes = h.sync().await;
    assert!(matches!(&outcomes[..], [Outcome::Queued { .. }]));

    assert!(h.ledger.get_pending(&receipt.offer_id).await.unwrap().is_none());
    let queue = h.ledger.queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].deposit.participant_id, "alice");
    assert_eq!(queue[0].deposit.items.len(), 2);
    assert!(queue[0].deposit.items.iter().all(|i| i.extra.is_empty()));

    // The next poll sees no change, so nothing applies twice.
    assert!(h.sync().await.is_empty());
    assert_eq!(h.ledger.queue().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_deposit_accepted_is_queued_memory() {
    deposit_accepted_is_queued(Arc::new(MemoryLedger::new())).await;
}

#[tokio::test]
async fn test_deposit_accepted_is_queued_sqlite() {
    deposit_accepted_is_queued(Arc::new(SqliteLedger::in_memory().await.unwrap())).await;
}

#[tokio::test]
async fn test_payout_keeps_rake_and_settles() {
    let mut h = Harness::in_memory(MockPlatform::new(jackpot_inventory()));

    let receipt = assert_ok!(h.issuer.withdraw(withdrawal_body("bob")).await);
    assert_eq!(receipt.rake, "Knife");

    let (_, offer) = h.platform.sent().pop().unwrap();
    let assets: Vec<_> = offer.my_items.iter().map(|a| a.assetid.as_str()).collect();
    assert_eq!(assets, vec!["c", "a"]);
    assert_eq!(offer.trade_token.as_deref(), Some("wintok"));

    h.platform.set_state(&receipt.offer_id, OfferState::Accepted, 2_000);
    assert_eq!(h.sync().await, vec![Outcome::Settled]);
    assert!(h.ledger.get_winning(&receipt.offer_id).await.unwrap().is_none());
    assert!(h.ledger.queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_items_unavailable_reissues_same_request() {
    let mut h = Harness::new(
        MockPlatform::new(jackpot_inventory()),
        Arc::new(SqliteLedger::in_memory().await.unwrap()),
    );
    let request = withdrawal_body("carol");

    let first = assert_ok!(h.issuer.withdraw(request.clone()).await);
    h.platform.set_state(&first.offer_id, OfferState::InvalidItems, 2_000);
    assert_eq!(h.sync().await, vec![Outcome::Reissued]);
    h.reconciler.drain().await;

    let second_id = h.platform.last_sent_id().unwrap();
    assert_ne!(second_id, first.offer_id);
    assert!(h.ledger.get_winning(&first.offer_id).await.unwrap().is_none());

    let reissued = h.ledger.get_winning(&second_id).await.unwrap().unwrap();
    assert_eq!(reissued.request, request);
    assert_eq!(reissued.request.extra.get("roundId"), Some(&json!(31)));
}

#[tokio::test]
async fn test_declined_deposit_releases_participant() {
    let mut h = Harness::in_memory(MockPlatform::new(Vec::new()));

    let receipt = assert_ok!(h.issuer.deposit(deposit_body("dave")).await);
    let user = h.ledger.get_participant("dave").await.unwrap().unwrap();
    assert_eq!(user.trade_id, receipt.offer_id);

    h.platform.set_state(&receipt.offer_id, OfferState::Expired, 2_000);
    assert_eq!(h.sync().await, vec![Outcome::Cleared]);

    let user = h.ledger.get_participant("dave").await.unwrap().unwrap();
    assert!(!user.has_active_trade());
    assert!(user.protection_code.is_empty());

    // A replayed notification is a miss.
    let replay = PlatformEvent::SentOfferChanged {
        offer_id: receipt.offer_id.clone(),
        state: OfferState::Expired,
        prior: Some(OfferState::Active),
    };
    assert_eq!(h.reconciler.handle(replay).await.unwrap(), Outcome::Miss);
}

#[tokio::test]
async fn test_newer_deposit_survives_old_cancellation() {
    let mut h = Harness::in_memory(MockPlatform::new(Vec::new()));

    let old = assert_ok!(h.issuer.deposit(deposit_body("erin")).await);
    let new = assert_ok!(h.issuer.deposit(deposit_body("erin")).await);

    h.platform.set_state(&old.offer_id, OfferState::Canceled, 2_000);
    assert_eq!(h.sync().await, vec![Outcome::Cleared]);

    let user = h.ledger.get_participant("erin").await.unwrap().unwrap();
    assert_eq!(user.trade_id, new.offer_id);
    assert_eq!(user.protection_code, new.protection_code);
}

#[tokio::test]
async fn test_inbound_offers_are_declined() {
    let mut h = Harness::in_memory(MockPlatform::new(Vec::new()));
    h.platform.receive_offer("777", "76561198000000077", 1_500);

    assert_eq!(h.sync().await, vec![Outcome::Declined]);
    assert_eq!(h.platform.declined(), vec!["777".to_string()]);
    assert!(h.sync().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_platform_is_retried() {
    let h = Harness::in_memory(MockPlatform::new(Vec::new()));
    h.platform.fail_next_send(PlatformError::Http {
        status: 503,
        body: "Service Unavailable".into(),
    });

    let start = tokio::time::Instant::now();
    let receipt = assert_ok!(h.issuer.deposit(deposit_body("frank")).await);
    assert!(start.elapsed() >= Duration::from_secs(20));

    assert_eq!(h.platform.sent().len(), 1);
    assert!(h.ledger.get_pending(&receipt.offer_id).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_is_refreshed() {
    let h = Harness::in_memory(MockPlatform::new(Vec::new()));
    h.platform.fail_next_send(PlatformError::SessionExpired);

    assert_ok!(h.issuer.deposit(deposit_body("gina")).await);
    assert_eq!(h.platform.session_refreshes(), 1);
}

#[tokio::test]
async fn test_permanent_failure_reaches_caller() {
    let h = Harness::in_memory(MockPlatform::new(Vec::new()));
    h.platform
        .fail_next_send(PlatformError::Rejected("You cannot trade with this user (15)".into()));

    let err = assert_err!(h.issuer.deposit(deposit_body("hank")).await);
    assert!(matches!(err, IssueError::Rejected(_)));

    let user = h.ledger.get_participant("hank").await.unwrap().unwrap();
    assert!(user.error);
    assert!(!user.has_active_trade());
}

#[tokio::test]
async fn test_payout_with_nothing_in_inventory_fails() {
    let h = Harness::in_memory(MockPlatform::new(vec![held("z", "Something Else")]));

    let err = assert_err!(h.issuer.withdraw(withdrawal_body("ivan")).await);
    assert!(matches!(err, IssueError::NothingToSend(_)));
    assert!(h.platform.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_tasks_wired_through_channel() {
    let h = Harness::in_memory(MockPlatform::new(Vec::new()));
    let Harness {
        platform,
        ledger,
        issuer,
        poller,
        reconciler,
    } = h;

    let (event_tx, event_rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (queue, worker) = issue_channel(issuer, 8);
    let reconciler_task = tokio::spawn(reconciler.run(event_rx));
    let poller_task = tokio::spawn(poller.run(event_tx, stop_rx));
    let worker_task = tokio::spawn(worker.run());

    let receipt = assert_ok!(queue.deposit(deposit_body("judy")).await);
    platform.set_state(&receipt.offer_id, OfferState::Accepted, 2_000);

    for _ in 0..10 {
        if !ledger.queue().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
    assert_eq!(ledger.queue().await.unwrap().len(), 1);

    stop_tx.send(true).unwrap();
    drop(queue);
    poller_task.await.unwrap();
    reconciler_task.await.unwrap();
    worker_task.await.unwrap();

    let saved = ledger.load_poll_data().await.unwrap().unwrap();
    assert_eq!(saved.sent[&receipt.offer_id].state, OfferState::Accepted);
}

#[tokio::test(start_paused = true)]
async fn test_deposit_retry_survives_caller_hanging_up() {
    let h = Harness::in_memory(MockPlatform::new(Vec::new()));
    h.platform.fail_next_send(PlatformError::Http {
        status: 503,
        body: "<title>Error 503</title> Copyright 2024".into(),
    });
    let (queue, worker) = issue_channel(h.issuer.clone(), 8);
    let worker_task = tokio::spawn(worker.run());

    let hung_up =
        tokio::time::timeout(Duration::from_secs(5), queue.deposit(deposit_body("kate"))).await;
    assert!(hung_up.is_err());
    assert!(h.platform.sent().is_empty());

    drop(queue);
    worker_task.await.unwrap();

    let id = h.platform.last_sent_id().unwrap();
    assert!(h.ledger.get_pending(&id).await.unwrap().is_some());
    let user = h.ledger.get_participant("kate").await.unwrap().unwrap();
    assert_eq!(user.trade_id, id);
}

#[tokio::test]
async fn test_checkpoint_restores_after_reconcile_sqlite() {
    let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
    let mut h = Harness::new(MockPlatform::new(Vec::new()), ledger.clone());

    let receipt = assert_ok!(h.issuer.deposit(deposit_body("liam")).await);
    h.platform.set_state(&receipt.offer_id, OfferState::Accepted, 2_000);
    assert_eq!(h.sync().await.len(), 1);

    let shared: Arc<dyn TradePlatform> = Arc::new(h.platform.clone());
    let restored = assert_ok!(OfferPoller::restore(shared, &*ledger, PollerConfig::default()).await);
    assert_eq!(restored.poll_data().cutoff, 2_000);
    assert_eq!(
        restored.poll_data().sent[&receipt.offer_id].state,
        OfferState::Accepted
    );
}

#[test]
fn test_withdrawal_body_prices_are_exact() {
    let request = withdrawal_body("x");
    assert_eq!(request.items[1].market_price, Some(dec!(95)));
}
