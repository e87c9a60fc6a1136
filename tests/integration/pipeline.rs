//! End-to-end pipeline tests.
//!
//! Drive the poller and the sale feed consumer against the mock market
//! and check what gets bought, reserved and reported.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skinsniper::engine::balance::BalanceTracker;
use skinsniper::engine::executor::Executor;
use skinsniper::engine::poller::ListingPoller;
use skinsniper::engine::stream::SaleFeedConsumer;
use skinsniper::notify::{Notification, Notifier};
use skinsniper::platforms::{Exchange, FeedConnection, FeedTransport};
use skinsniper::pricing::{PriceSnapshot, ReferenceEntry, ReferencePriceStore};
use skinsniper::strategy::QualificationRule;
use skinsniper::types::{DmarketSegment, SniperError};

use crate::mock_market::{dmarket_listing, MockMarket, RecordingNotifier};

const REDLINE: &str = "AK-47 | Redline (Field-Tested)";
const DOPPLER: &str = "★ Karambit | Doppler (Factory New)";

fn prices() -> Arc<ReferencePriceStore> {
    let mut snapshot: PriceSnapshot = HashMap::new();
    snapshot.insert(
        REDLINE.into(),
        ReferenceEntry { base: Some(dec!(20)), variants: HashMap::new() },
    );
    snapshot.insert(
        DOPPLER.into(),
        ReferenceEntry {
            base: Some(dec!(600)),
            variants: HashMap::from([("Phase 2".to_string(), dec!(900))]),
        },
    );
    Arc::new(ReferencePriceStore::from_snapshot(snapshot))
}

fn rule() -> QualificationRule {
    QualificationRule {
        min_discount_pct: dec!(10),
        min_price: dec!(1),
        max_price: dec!(1000),
        restricted_marker: "StatTrak".into(),
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct Harness {
    market: Arc<MockMarket>,
    notifier: Arc<RecordingNotifier>,
    balance: Arc<BalanceTracker>,
    poller: ListingPoller,
}

async fn harness(initial_balance: rust_decimal::Decimal) -> Harness {
    let market = Arc::new(MockMarket::new(initial_balance));
    let notifier = Arc::new(RecordingNotifier::default());

    let exchange: Arc<dyn Exchange> = market.clone();
    let balance = Arc::new(BalanceTracker::new(Arc::clone(&exchange)));
    balance.refresh().await.unwrap();

    let dyn_notifier: Arc<dyn Notifier> = notifier.clone();
    let executor = Arc::new(Executor::new(
        exchange,
        Arc::clone(&dyn_notifier),
        Arc::clone(&balance),
    ));

    let poller = ListingPoller::new(
        market.clone(),
        DmarketSegment::P2p,
        rule(),
        prices(),
        Arc::clone(&balance),
        executor,
        dyn_notifier,
    );

    Harness { market, notifier, balance, poller }
}

// ---------------------------------------------------------------------------
// Polling pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_new_listing_is_bought_once() {
    let mut h = harness(dec!(100)).await;
    h.market.queue_snapshot(vec![dmarket_listing("1", REDLINE, 1500)]);
    h.market.queue_snapshot(vec![
        dmarket_listing("1", REDLINE, 1500),
        dmarket_listing("2", REDLINE, 1500),
        dmarket_listing("3", &format!("StatTrak™ {REDLINE}"), 500),
    ]);

    // Baseline: listing 1 would qualify but is never bought.
    let baseline = h.poller.poll_once().await.unwrap();
    assert!(baseline.dispatched.is_empty());

    let report = h.poller.poll_once().await.unwrap();
    assert_eq!(report.dispatched, vec!["2".to_string()]);

    // Same snapshot again: nothing new.
    let repeat = h.poller.poll_once().await.unwrap();
    assert!(repeat.dispatched.is_empty());

    // Startup refresh plus exactly one after the purchase.
    let market = Arc::clone(&h.market);
    wait_until(move || market.balance_calls() == 2).await;

    let bought: Vec<String> = h.market.purchases().into_iter().map(|l| l.id).collect();
    assert_eq!(bought, vec!["2".to_string()]);
    assert_eq!(h.balance.get(), dec!(85));

    let sent = h.notifier.sent();
    assert!(sent.iter().any(|n| matches!(
        n,
        Notification::Purchase { listing, discount, .. } if listing.id == "2" && *discount == dec!(25)
    )));
}

#[tokio::test]
async fn test_out_of_stock_reports_and_refreshes_balance() {
    let mut h = harness(dec!(100)).await;
    h.market
        .set_purchase_body(r#"{"status":"","dmOffersFailReason":{"code":"OfferNotFound"}}"#);
    h.market.queue_snapshot(Vec::new());
    h.market.queue_snapshot(vec![dmarket_listing("7", REDLINE, 1200)]);

    h.poller.poll_once().await.unwrap();
    h.poller.poll_once().await.unwrap();

    let market = Arc::clone(&h.market);
    wait_until(move || market.balance_calls() == 2).await;

    assert_eq!(h.balance.get(), dec!(100));
    let sent = h.notifier.sent();
    assert!(sent.iter().any(|n| matches!(n, Notification::Error(m) if m.contains("OOS"))));
    assert!(!sent.iter().any(|n| matches!(n, Notification::Purchase { .. })));
}

#[tokio::test]
async fn test_fetch_failure_skips_only_that_cycle() {
    let mut h = harness(dec!(100)).await;
    h.market.queue_snapshot(vec![dmarket_listing("1", REDLINE, 1500)]);
    h.poller.poll_once().await.unwrap();

    h.market.set_error("DMarket listing error 502");
    assert!(h.poller.poll_once().await.is_err());
    h.market.clear_error();

    h.market.queue_snapshot(vec![
        dmarket_listing("1", REDLINE, 1500),
        dmarket_listing("9", REDLINE, 1600),
    ]);
    let report = h.poller.poll_once().await.unwrap();
    assert_eq!(report.dispatched, vec!["9".to_string()]);
}

// ---------------------------------------------------------------------------
// Streaming pipeline
// ---------------------------------------------------------------------------

/// Serves one connection with fixed frames, then refuses.
struct OneShotFeed {
    frames: Mutex<Option<Vec<String>>>,
}

struct OneShotConnection {
    frames: VecDeque<String>,
}

#[async_trait]
impl FeedTransport for OneShotFeed {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>> {
        let frames = self
            .frames
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("refused"))?;
        Ok(Box::new(OneShotConnection { frames: frames.into() }))
    }
}

#[async_trait]
impl FeedConnection for OneShotConnection {
    async fn recv(&mut self) -> Result<String> {
        self.frames
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("closed"))
    }

    async fn send(&mut self, _frame: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}

#[tokio::test]
async fn test_sale_feed_reserves_qualifying_sales() {
    let sales = serde_json::json!(["saleFeed", {
        "eventType": "listed",
        "sales": [
            // Phase 2 reference is $900: 33% off.
            {"saleId": 1, "marketName": DOPPLER, "salePrice": 60000, "version": "Phase 2", "url": "karambit"},
            // Base reference is $600: 0% off.
            {"saleId": 2, "marketName": DOPPLER, "salePrice": 60000, "url": "karambit"},
            // No reference at all.
            {"saleId": 3, "marketName": "Sticker | Unknown", "salePrice": 100, "url": "sticker"}
        ]
    }]);
    let frames = vec![
        r#"0{"sid":"a"}"#.to_string(),
        r#"40{"sid":"b"}"#.to_string(),
        "ack".to_string(),
        "ack".to_string(),
        format!("42{sales}"),
    ];

    let market = Arc::new(MockMarket::new(dec!(0)));
    let notifier = Arc::new(RecordingNotifier::default());
    let mut consumer = SaleFeedConsumer::new(
        Arc::new(OneShotFeed { frames: Mutex::new(Some(frames)) }),
        rule(),
        prices(),
        market.clone(),
        notifier.clone(),
        2,
    );

    let err = consumer.run().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SniperError>(),
        Some(SniperError::ReconnectCeiling { failures: 2 })
    ));

    let reserved = Arc::clone(&market);
    wait_until(move || !reserved.reservations().is_empty()).await;
    let ids: Vec<String> = market.reservations().into_iter().map(|l| l.id).collect();
    assert_eq!(ids, vec!["1".to_string()]);

    let recorded = Arc::clone(&notifier);
    wait_until(move || {
        recorded
            .sent()
            .iter()
            .any(|n| matches!(n, Notification::Find { listing, .. } if listing.id == "1"))
    })
    .await;
}
