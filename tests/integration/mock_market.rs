//! Mock marketplace for integration testing.
//!
//! Provides a deterministic implementation of the marketplace seams
//! (`ListingSource`, `Exchange`, `Reserver`) plus a notifier that records
//! everything it is asked to deliver. All state is in-memory.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

use skinsniper::notify::{Notification, Notifier};
use skinsniper::platforms::{
    Exchange, ListingSource, PurchaseResponse, ReserveOutcome, Reserver,
};
use skinsniper::types::{DmarketSegment, Listing, Marketplace, PurchaseHandle};

/// A mock marketplace. Snapshots are served in the order they were queued;
/// the last one is repeated once the queue is drained.
pub struct MockMarket {
    snapshots: Mutex<VecDeque<Vec<Listing>>>,
    last_snapshot: Mutex<Vec<Listing>>,
    balance: Mutex<Decimal>,
    purchases: Mutex<Vec<Listing>>,
    reservations: Mutex<Vec<Listing>>,
    balance_calls: Mutex<usize>,
    /// If set, snapshot fetches fail with this error.
    force_error: Mutex<Option<String>>,
    /// Body the exchange answers purchases with; `None` generates a
    /// `TxSuccess` reply.
    purchase_body: Mutex<Option<String>>,
}

impl MockMarket {
    pub fn new(balance: Decimal) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::new()),
            last_snapshot: Mutex::new(Vec::new()),
            balance: Mutex::new(balance),
            purchases: Mutex::new(Vec::new()),
            reservations: Mutex::new(Vec::new()),
            balance_calls: Mutex::new(0),
            force_error: Mutex::new(None),
            purchase_body: Mutex::new(None),
        }
    }

    pub fn queue_snapshot(&self, listings: Vec<Listing>) {
        self.snapshots.lock().unwrap().push_back(listings);
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn set_purchase_body(&self, body: &str) {
        *self.purchase_body.lock().unwrap() = Some(body.to_string());
    }

    pub fn purchases(&self) -> Vec<Listing> {
        self.purchases.lock().unwrap().clone()
    }

    pub fn reservations(&self) -> Vec<Listing> {
        self.reservations.lock().unwrap().clone()
    }

    pub fn balance_calls(&self) -> usize {
        *self.balance_calls.lock().unwrap()
    }
}

#[async_trait]
impl ListingSource for MockMarket {
    async fn fetch_snapshot(&self, _segment: DmarketSegment) -> Result<Vec<Listing>> {
        if let Some(err) = self.force_error.lock().unwrap().as_ref() {
            return Err(anyhow!("{}", err));
        }
        let mut last = self.last_snapshot.lock().unwrap();
        if let Some(next) = self.snapshots.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[async_trait]
impl Exchange for MockMarket {
    async fn purchase(&self, listing: &Listing) -> Result<PurchaseResponse> {
        self.purchases.lock().unwrap().push(listing.clone());

        let body = match self.purchase_body.lock().unwrap().clone() {
            Some(body) => body,
            None => {
                let mut balance = self.balance.lock().unwrap();
                *balance -= listing.price();
                serde_json::json!({
                    "txId": Uuid::new_v4().to_string(),
                    "status": "TxSuccess",
                    "orderId": format!("MOCK-{}", Uuid::new_v4()),
                })
                .to_string()
            }
        };

        Ok(PurchaseResponse { status: 200, body })
    }

    async fn balance(&self) -> Result<Decimal> {
        *self.balance_calls.lock().unwrap() += 1;
        Ok(*self.balance.lock().unwrap())
    }
}

#[async_trait]
impl Reserver for MockMarket {
    async fn reserve(&self, listing: &Listing) -> Result<ReserveOutcome> {
        self.reservations.lock().unwrap().push(listing.clone());
        Ok(ReserveOutcome::Reserved)
    }
}

/// Notifier that keeps every notification in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// A DMarket P2P listing.
pub fn dmarket_listing(id: &str, title: &str, price_cents: u64) -> Listing {
    Listing {
        id: id.to_string(),
        marketplace: Marketplace::Dmarket,
        title: title.to_string(),
        price_cents,
        variant: None,
        handle: PurchaseHandle::DmarketOffer {
            offer_id: format!("offer-{id}"),
            segment: DmarketSegment::P2p,
        },
        image_url: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_mock_repeats_last_snapshot() {
        let market = MockMarket::new(dec!(10));
        market.queue_snapshot(vec![dmarket_listing("1", "A", 100)]);

        let first = market.fetch_snapshot(DmarketSegment::P2p).await.unwrap();
        let second = market.fetch_snapshot(DmarketSegment::P2p).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_mock_purchase_debits_balance() {
        let market = MockMarket::new(dec!(10));
        let response = market
            .purchase(&dmarket_listing("1", "A", 250))
            .await
            .unwrap();

        assert!(response.body.contains("TxSuccess"));
        assert_eq!(market.balance().await.unwrap(), dec!(7.50));
    }

    #[tokio::test]
    async fn test_mock_forced_error() {
        let market = MockMarket::new(dec!(10));
        market.set_error("HTTP 503");
        tokio_test::assert_err!(market.fetch_snapshot(DmarketSegment::P2p).await);
        market.clear_error();
        tokio_test::assert_ok!(market.fetch_snapshot(DmarketSegment::P2p).await);
    }
}
