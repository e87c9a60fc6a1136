//! Purchase executor.
//!
//! Sends the purchase for a qualifying listing, classifies the exchange's
//! reply, notifies, and refreshes the balance. Each purchase runs on its
//! own task with no channel back to the loop that found it.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::balance::BalanceTracker;
use crate::notify::{notify, Notification, Notifier};
use crate::platforms::dmarket::DmarketError;
use crate::platforms::{Exchange, PurchaseResponse};
use crate::types::{Listing, PurchaseOutcome};

/// Terminal success status of a synchronous order.
const TX_SUCCESS: &str = "TxSuccess";
/// Body marker of an accepted asynchronous (P2P) order.
const STARTED_MARKER: &str = r#"{"started":true}"#;
/// Fail-reason code for an offer that is already gone.
const OFFER_NOT_FOUND: &str = "OfferNotFound";

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// The fields of an order reply we look at. Every field is optional so
/// that any JSON shape parses.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    dm_offers_fail_reason: Option<FailReason>,
}

#[derive(Debug, Default, Deserialize)]
struct FailReason {
    #[serde(default)]
    code: Option<String>,
}

/// Classify a raw purchase reply. The checks run in a fixed order:
/// success status, then the `started` body marker, then the fail-reason
/// code, then the fallback.
pub fn classify(response: &PurchaseResponse) -> PurchaseOutcome {
    if !response.is_success() {
        return PurchaseOutcome::Error {
            detail: DmarketError::detail(response.status, &response.body),
        };
    }

    let order: OrderResponse = serde_json::from_str(&response.body).unwrap_or_default();
    let status = order.status.as_deref().unwrap_or("");
    let order_id = || order.order_id.clone().unwrap_or_default();

    if status == TX_SUCCESS {
        return PurchaseOutcome::Confirmed { order_id: order_id() };
    }

    if status.is_empty() && response.body.contains(STARTED_MARKER) {
        return PurchaseOutcome::Confirmed { order_id: order_id() };
    }

    let fail_code = order
        .dm_offers_fail_reason
        .as_ref()
        .and_then(|r| r.code.as_deref());
    if fail_code == Some(OFFER_NOT_FOUND) {
        return PurchaseOutcome::OutOfStock;
    }

    PurchaseOutcome::Unknown {
        body: response.body.clone(),
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    balance: Arc<BalanceTracker>,
}

impl Executor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        notifier: Arc<dyn Notifier>,
        balance: Arc<BalanceTracker>,
    ) -> Self {
        Self {
            exchange,
            notifier,
            balance,
        }
    }

    /// Run one purchase attempt to completion.
    ///
    /// Returns `None` when no response was received. The balance is
    /// refreshed exactly once afterwards in every case.
    pub async fn execute(
        &self,
        listing: &Listing,
        discount: Decimal,
        reference: Decimal,
    ) -> Option<PurchaseOutcome> {
        let attempt = Uuid::new_v4();
        info!(%attempt, item = %listing, discount = %discount.round_dp(2), "Purchasing");

        let outcome = match self.exchange.purchase(listing).await {
            Ok(response) => {
                let outcome = classify(&response);
                info!(%attempt, status = response.status, outcome = %outcome, "Purchase classified");
                Some(outcome)
            }
            Err(e) => {
                error!(%attempt, item = %listing.title, error = %e, "Purchase request failed");
                notify(self.notifier.as_ref(), Notification::Error(e.to_string())).await;
                None
            }
        };

        if let Some(outcome) = &outcome {
            self.report(listing, outcome, discount, reference).await;
        }

        // Errors are logged by the tracker.
        let _ = self.balance.refresh().await;
        outcome
    }

    async fn report(
        &self,
        listing: &Listing,
        outcome: &PurchaseOutcome,
        discount: Decimal,
        reference: Decimal,
    ) {
        let notification = match outcome {
            PurchaseOutcome::Confirmed { order_id } => {
                info!(item = %listing.title, order_id = %order_id, "Purchase confirmed");
                Notification::Purchase {
                    listing: listing.clone(),
                    order_id: order_id.clone(),
                    discount,
                    reference,
                }
            }
            PurchaseOutcome::OutOfStock => {
                info!(item = %listing.title, "Offer gone before purchase");
                Notification::Error(format!(
                    "The following product was OOS at the time of purchase: {}",
                    listing.title
                ))
            }
            PurchaseOutcome::Unknown { body } => {
                warn!(item = %listing.title, body = %body, "Unrecognised purchase response");
                Notification::Error(format!("Unknown order response: {body}"))
            }
            PurchaseOutcome::Error { detail } => {
                warn!(item = %listing.title, detail = %detail, "Purchase rejected");
                Notification::Error(detail.clone())
            }
        };
        notify(self.notifier.as_ref(), notification).await;
    }

    /// Run a purchase attempt on its own task.
    pub fn dispatch(self: &Arc<Self>, listing: Listing, discount: Decimal, reference: Decimal) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.execute(&listing, discount, reference).await;
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
