//! Listing poller.
//!
//! Polls one DMarket segment on a fixed interval, diffs each snapshot
//! against the previous one and hands qualifying new listings to the
//! executor. Segments run as independent pollers and never share
//! snapshot state.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::balance::BalanceTracker;
use super::executor::Executor;
use crate::notify::{notify_detached, Notification, Notifier};
use crate::platforms::ListingSource;
use crate::pricing::ReferencePriceStore;
use crate::strategy::{FeedContext, QualificationRule, Verdict};
use crate::types::{DmarketSegment, Listing};

// ---------------------------------------------------------------------------
// Snapshot diff
// ---------------------------------------------------------------------------

/// Identifiers of the previous snapshot. `None` until the first snapshot
/// has been stored as the baseline.
#[derive(Debug, Default)]
pub struct SnapshotDiff {
    previous: Option<HashSet<String>>,
}

impl SnapshotDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// True until the first snapshot is stored.
    pub fn is_baseline(&self) -> bool {
        self.previous.is_none()
    }

    /// Store `current` and return the listings absent from the previous
    /// snapshot. The first call only stores the baseline.
    pub fn advance(&mut self, current: Vec<Listing>) -> Vec<Listing> {
        let ids: HashSet<String> = current.iter().map(|l| l.id.clone()).collect();

        let fresh = match &self.previous {
            None => Vec::new(),
            Some(prev) => {
                let mut emitted = HashSet::new();
                current
                    .into_iter()
                    .filter(|l| !prev.contains(&l.id) && emitted.insert(l.id.clone()))
                    .collect()
            }
        };

        self.previous = Some(ids);
        fresh
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub fresh: usize,
    /// Ids handed to the executor.
    pub dispatched: Vec<String>,
}

pub struct ListingPoller {
    source: Arc<dyn ListingSource>,
    segment: DmarketSegment,
    rule: QualificationRule,
    prices: Arc<ReferencePriceStore>,
    balance: Arc<BalanceTracker>,
    executor: Arc<Executor>,
    notifier: Arc<dyn Notifier>,
    diff: SnapshotDiff,
    /// Every id handed to the qualification rule during this run.
    ///
    /// Unbounded on purpose: a listing is evaluated at most once per run,
    /// so ids are never evicted. Do not turn this into an LRU.
    forwarded: HashSet<String>,
}

impl ListingPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn ListingSource>,
        segment: DmarketSegment,
        rule: QualificationRule,
        prices: Arc<ReferencePriceStore>,
        balance: Arc<BalanceTracker>,
        executor: Arc<Executor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            source,
            segment,
            rule,
            prices,
            balance,
            executor,
            notifier,
            diff: SnapshotDiff::new(),
            forwarded: HashSet::new(),
        }
    }

    /// Fetch, diff, evaluate and dispatch once. A fetch error aborts the
    /// cycle and leaves the stored snapshot untouched. A listing reaches
    /// the qualification rule at most once per run, even if it drops out
    /// of a snapshot and comes back.
    pub async fn poll_once(&mut self) -> Result<CycleReport> {
        let snapshot = self.source.fetch_snapshot(self.segment).await?;
        let baseline = self.diff.is_baseline();
        let fetched = snapshot.len();

        let fresh = self.diff.advance(snapshot);
        let mut report = CycleReport {
            fetched,
            fresh: fresh.len(),
            dispatched: Vec::new(),
        };

        if baseline {
            info!(
                platform = self.source.name(),
                segment = %self.segment,
                listings = fetched,
                "Baseline snapshot stored"
            );
            return Ok(report);
        }

        let balance = self.balance.get();
        for listing in fresh {
            if !self.forwarded.insert(listing.id.clone()) {
                debug!(segment = %self.segment, id = %listing.id, "Listing reappeared, already handled");
                continue;
            }
            debug!(segment = %self.segment, item = %listing, "New listing");

            let reference = self
                .prices
                .lookup(&listing.title, listing.variant.as_deref());
            let ctx = FeedContext::Polling { balance, baseline };

            if let Verdict::Qualified { discount, reference } =
                self.rule.evaluate(&listing, reference, ctx)
            {
                info!(
                    segment = %self.segment,
                    item = %listing,
                    discount = %discount.round_dp(2),
                    reference = %reference,
                    "Qualifying listing"
                );
                report.dispatched.push(listing.id.clone());
                self.executor.dispatch(listing, discount, reference);
            }
        }

        Ok(report)
    }

    /// Poll forever on a fixed interval.
    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            platform = self.source.name(),
            segment = %self.segment,
            interval_ms = interval.as_millis() as u64,
            "Poller started"
        );

        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(report) if !report.dispatched.is_empty() => {
                    info!(
                        segment = %self.segment,
                        fresh = report.fresh,
                        dispatched = report.dispatched.len(),
                        "Poll cycle dispatched purchases"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(segment = %self.segment, error = %e, "Poll cycle failed, retrying next tick");
                    notify_detached(Arc::clone(&self.notifier), Notification::Error(e.to_string()));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MockNotifier;
    use crate::platforms::{Exchange, MockExchange, MockListingSource, PurchaseResponse};
    use crate::pricing::{PriceSnapshot, ReferenceEntry};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn ids(listings: &[Listing]) -> Vec<&str> {
        listings.iter().map(|l| l.id.as_str()).collect()
    }

    #[test]
    fn test_first_snapshot_is_baseline() {
        let mut diff = SnapshotDiff::new();
        assert!(diff.is_baseline());
        let fresh = diff.advance(vec![Listing::sample("a", "A", 100)]);
        assert!(fresh.is_empty());
        assert!(!diff.is_baseline());
    }

    #[test]
    fn test_diff_returns_new_ids_only() {
        let mut diff = SnapshotDiff::new();
        diff.advance(vec![Listing::sample("a", "A", 100), Listing::sample("b", "B", 100)]);

        let fresh = diff.advance(vec![
            Listing::sample("b", "B", 100),
            Listing::sample("c", "C", 100),
            Listing::sample("d", "D", 100),
        ]);
        assert_eq!(ids(&fresh), vec!["c", "d"]);
    }

    #[test]
    fn test_diff_is_against_immediately_prior_snapshot() {
        let mut diff = SnapshotDiff::new();
        diff.advance(vec![Listing::sample("a", "A", 100)]);
        diff.advance(vec![Listing::sample("b", "B", 100)]);
        // "a" was absent from the prior snapshot, so it is new again.
        let fresh = diff.advance(vec![Listing::sample("a", "A", 100), Listing::sample("b", "B", 100)]);
        assert_eq!(ids(&fresh), vec!["a"]);
    }

    #[test]
    fn test_diff_collapses_duplicate_ids() {
        let mut diff = SnapshotDiff::new();
        diff.advance(Vec::new());
        let fresh = diff.advance(vec![Listing::sample("x", "X", 100), Listing::sample("x", "X", 100)]);
        assert_eq!(ids(&fresh), vec!["x"]);
    }

    fn prices() -> Arc<ReferencePriceStore> {
        let mut snapshot: PriceSnapshot = HashMap::new();
        snapshot.insert(
            "AK-47 | Redline".into(),
            ReferenceEntry { base: Some(dec!(20)), variants: HashMap::new() },
        );
        Arc::new(ReferencePriceStore::from_snapshot(snapshot))
    }

    fn rule() -> QualificationRule {
        QualificationRule {
            min_discount_pct: dec!(10),
            min_price: dec!(1),
            max_price: dec!(100),
            restricted_marker: "StatTrak".into(),
        }
    }

    async fn poller(source: MockListingSource, balance: rust_decimal::Decimal) -> ListingPoller {
        let mut exchange = MockExchange::new();
        exchange.expect_balance().returning(move || Ok(balance));
        exchange.expect_purchase().returning(|_| {
            Ok(PurchaseResponse { status: 200, body: r#"{"status":"TxSuccess","orderId":"o"}"#.into() })
        });
        let exchange: Arc<dyn Exchange> = Arc::new(exchange);

        let mut notifier = MockNotifier::new();
        notifier.expect_send().returning(|_| Ok(()));
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);

        let tracker = Arc::new(BalanceTracker::new(Arc::clone(&exchange)));
        tracker.refresh().await.unwrap();
        let executor = Arc::new(Executor::new(exchange, Arc::clone(&notifier), Arc::clone(&tracker)));

        ListingPoller::new(
            Arc::new(source),
            DmarketSegment::P2p,
            rule(),
            prices(),
            tracker,
            executor,
            notifier,
        )
    }

    #[tokio::test]
    async fn test_poll_dispatches_only_new_qualifying_listings() {
        let mut source = MockListingSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![Listing::sample("1", "AK-47 | Redline", 1500)]));
        source
            .expect_fetch_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(vec![
                    Listing::sample("1", "AK-47 | Redline", 1500),
                    Listing::sample("2", "AK-47 | Redline", 1500),
                    Listing::sample("3", "AK-47 | Redline", 1950),
                    Listing::sample("4", "StatTrak™ AK-47 | Redline", 1000),
                ])
            });
        source.expect_name().return_const("DMarket".to_string());

        let mut poller = poller(source, dec!(50)).await;

        let first = poller.poll_once().await.unwrap();
        assert_eq!(first.fetched, 1);
        assert!(first.dispatched.is_empty());

        let second = poller.poll_once().await.unwrap();
        assert_eq!(second.fresh, 3);
        assert_eq!(second.dispatched, vec!["2".to_string()]);
    }

    #[tokio::test]
    async fn test_poll_respects_balance() {
        let mut source = MockListingSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Vec::new()));
        source
            .expect_fetch_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![Listing::sample("1", "AK-47 | Redline", 1500)]));
        source.expect_name().return_const("DMarket".to_string());

        let mut poller = poller(source, dec!(10)).await;
        poller.poll_once().await.unwrap();
        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.fresh, 1);
        assert!(report.dispatched.is_empty());
    }

    #[tokio::test]
    async fn test_reappearing_listing_is_not_forwarded_twice() {
        let mut source = MockListingSource::new();
        let mut seq = mockall::Sequence::new();
        for snapshot in [vec![], vec!["1"], vec![], vec!["1"]] {
            source
                .expect_fetch_snapshot()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| {
                    Ok(snapshot
                        .iter()
                        .map(|id| Listing::sample(id, "AK-47 | Redline", 1500))
                        .collect())
                });
        }
        source.expect_name().return_const("DMarket".to_string());

        let mut poller = poller(source, dec!(50)).await;
        poller.poll_once().await.unwrap();
        assert_eq!(poller.poll_once().await.unwrap().dispatched, vec!["1".to_string()]);
        poller.poll_once().await.unwrap();

        let again = poller.poll_once().await.unwrap();
        assert_eq!(again.fresh, 1);
        assert!(again.dispatched.is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_snapshot() {
        let mut source = MockListingSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![Listing::sample("1", "AK-47 | Redline", 1500)]));
        source
            .expect_fetch_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow::anyhow!("DMarket listing error 503")));
        source
            .expect_fetch_snapshot()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(vec![
                    Listing::sample("1", "AK-47 | Redline", 1500),
                    Listing::sample("2", "AK-47 | Redline", 1500),
                ])
            });
        source.expect_name().return_const("DMarket".to_string());

        let mut poller = poller(source, dec!(50)).await;
        poller.poll_once().await.unwrap();
        assert!(poller.poll_once().await.is_err());
        let report = poller.poll_once().await.unwrap();
        assert_eq!(report.dispatched, vec!["2".to_string()]);
    }
}
