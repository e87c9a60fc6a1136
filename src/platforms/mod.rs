//! Marketplace integrations.
//!
//! Defines the seams the engine talks through and provides implementations for:
//! - DMarket: polled listing snapshots, signed purchases and balance
//! - Skinport: socket.io sale feed and cart reservation

pub mod dmarket;
pub mod skinport;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{DmarketSegment, Listing};

/// A polled marketplace: returns the current listing snapshot of a segment.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_snapshot(&self, segment: DmarketSegment) -> Result<Vec<Listing>>;

    /// Marketplace name for logging and identification.
    fn name(&self) -> &str;
}

/// Raw exchange reply to a purchase request, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseResponse {
    pub status: u16,
    pub body: String,
}

impl PurchaseResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Exchange able to buy listings and report the spendable balance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Send a purchase request. `Err` means no response was received.
    async fn purchase(&self, listing: &Listing) -> Result<PurchaseResponse>;

    /// Spendable balance in major units.
    async fn balance(&self) -> Result<Decimal>;
}

/// Result of a best-effort reservation on a streaming marketplace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    /// The sale was gone before we got to it.
    Sold,
    /// The marketplace session has to be bootstrapped again.
    SessionExpired,
    Rejected(String),
}

/// Side effect fired for qualifying streaming listings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reserver: Send + Sync {
    async fn reserve(&self, listing: &Listing) -> Result<ReserveOutcome>;
}

/// One live, text-framed feed connection.
#[async_trait]
pub trait FeedConnection: Send {
    /// Next text frame. `Err` on transport failure or remote close.
    async fn recv(&mut self) -> Result<String>;

    async fn send(&mut self, frame: &str) -> Result<()>;

    async fn close(&mut self);
}

/// Opens feed connections; one call per (re)connect.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>>;
}
