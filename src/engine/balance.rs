//! Balance tracker.
//!
//! Last-known spendable balance of the exchange account. Read by the
//! polling qualification gate, written once at startup and after every
//! purchase attempt.

use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::platforms::Exchange;

pub struct BalanceTracker {
    value: RwLock<Decimal>,
    exchange: Arc<dyn Exchange>,
}

impl BalanceTracker {
    /// Starts at zero until the first refresh succeeds.
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self {
            value: RwLock::new(Decimal::ZERO),
            exchange,
        }
    }

    pub fn get(&self) -> Decimal {
        match self.value.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set(&self, balance: Decimal) {
        match self.value.write() {
            Ok(mut guard) => *guard = balance,
            Err(poisoned) => *poisoned.into_inner() = balance,
        }
    }

    /// Query the exchange once. On failure the previous value is kept.
    pub async fn refresh(&self) -> Result<Decimal> {
        match self.exchange.balance().await {
            Ok(balance) => {
                self.set(balance);
                info!(balance = %balance, "Balance updated");
                Ok(balance)
            }
            Err(e) => {
                warn!(error = %e, kept = %self.get(), "Balance refresh failed, keeping previous value");
                Err(e)
            }
        }
    }
}
