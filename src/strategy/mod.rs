//! Strategy: discount calculation and the qualification rule.
//!
//! Both feeds share one rule shape. The DMarket poller adds two gates of
//! its own (balance and cold-start baseline) through [`FeedContext`].

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::StrategyConfig;
use crate::types::Listing;

// ---------------------------------------------------------------------------
// Discount
// ---------------------------------------------------------------------------

/// Percentage discount of `observed` relative to `reference`.
///
/// Returns `None` when the reference is zero or negative: there is no
/// meaningful discount against a missing fair value.
pub fn discount_pct(observed: Decimal, reference: Decimal) -> Option<Decimal> {
    if reference <= Decimal::ZERO {
        return None;
    }
    Some((reference - observed) / reference * dec!(100))
}

// ---------------------------------------------------------------------------
// Qualification
// ---------------------------------------------------------------------------

/// Feed-specific inputs to the qualification rule.
#[derive(Debug, Clone, Copy)]
pub enum FeedContext {
    /// Streaming sale feed: no balance or baseline gate.
    Stream,
    /// Polled marketplace listing.
    Polling {
        balance: Decimal,
        /// True on the first cycle after the poller (re)started.
        baseline: bool,
    },
}

/// Outcome of evaluating one listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Qualified { discount: Decimal, reference: Decimal },
    /// Startup baseline cycle, never bought.
    Baseline,
    Restricted,
    OutOfBounds,
    /// No reference price, or one that cannot produce a discount.
    NoReference,
    InsufficientDiscount { discount: Decimal },
    OverBalance { balance: Decimal },
}

impl Verdict {
    pub fn is_qualified(&self) -> bool {
        matches!(self, Verdict::Qualified { .. })
    }
}

/// Predicate deciding whether a listing is worth buying.
#[derive(Debug, Clone)]
pub struct QualificationRule {
    pub min_discount_pct: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    /// Titles containing this marker never qualify. Empty disables the gate.
    pub restricted_marker: String,
}

impl QualificationRule {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            min_discount_pct: cfg.min_profit_pct,
            min_price: cfg.min_price,
            max_price: cfg.max_price,
            restricted_marker: cfg.restricted_marker.clone(),
        }
    }

    /// Same rule with different absolute price bounds.
    pub fn with_bounds(&self, min_price: Decimal, max_price: Decimal) -> Self {
        Self {
            min_price,
            max_price,
            ..self.clone()
        }
    }

    /// Evaluate a listing against its reference price.
    pub fn evaluate(
        &self,
        listing: &Listing,
        reference: Option<Decimal>,
        ctx: FeedContext,
    ) -> Verdict {
        let price = listing.price();

        if let FeedContext::Polling { baseline: true, .. } = ctx {
            return Verdict::Baseline;
        }

        if !self.restricted_marker.is_empty() && listing.title.contains(&self.restricted_marker) {
            return Verdict::Restricted;
        }

        if price < self.min_price || price > self.max_price {
            return Verdict::OutOfBounds;
        }

        if let FeedContext::Polling { balance, .. } = ctx {
            if price > balance {
                return Verdict::OverBalance { balance };
            }
        }

        let Some(reference) = reference else {
            return Verdict::NoReference;
        };
        let Some(discount) = discount_pct(price, reference) else {
            return Verdict::NoReference;
        };

        if discount < self.min_discount_pct {
            debug!(
                item = %listing.title,
                discount = %discount.round_dp(2),
                "Discount below threshold"
            );
            return Verdict::InsufficientDiscount { discount };
        }

        Verdict::Qualified { discount, reference }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
