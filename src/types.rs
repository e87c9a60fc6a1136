//! Shared types for the SKINSNIPER bot.
//!
//! These types form the data model used across all modules. Marketplace
//! clients normalise their feeds into a [`Listing`] so the pricing,
//! strategy and engine modules never see marketplace-specific JSON.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Marketplaces
// ---------------------------------------------------------------------------

/// Marketplace a listing was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Marketplace {
    Dmarket,
    Skinport,
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marketplace::Dmarket => write!(f, "DMarket"),
            Marketplace::Skinport => write!(f, "Skinport"),
        }
    }
}

/// Independent DMarket inventory segment. Each one is polled by its own
/// loop and doubles as the `type` of a purchase request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmarketSegment {
    /// Peer-to-peer offers; the seller has to send a trade after purchase.
    P2p,
    /// Items held by the DMarket bot inventory.
    Dmarket,
}

impl DmarketSegment {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmarketSegment::P2p => "p2p",
            DmarketSegment::Dmarket => "dmarket",
        }
    }
}

impl fmt::Display for DmarketSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Marketplace-specific handle needed to act on a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseHandle {
    DmarketOffer {
        offer_id: String,
        segment: DmarketSegment,
    },
    SkinportSale {
        sale_id: u64,
        /// Item page slug, used to build the sale link.
        slug: String,
    },
}

/// A normalised marketplace offer.
///
/// `id` is unique within one marketplace's listing set but is never
/// compared across marketplaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub marketplace: Marketplace,
    /// Display name, also the reference price key.
    pub title: String,
    /// Price in USD cents.
    pub price_cents: u64,
    /// Doppler phase or similar sub-variant, if any.
    pub variant: Option<String>,
    pub handle: PurchaseHandle,
    pub image_url: Option<String>,
}

impl Listing {
    /// Price in major currency units (dollars).
    pub fn price(&self) -> Decimal {
        cents_to_major(self.price_cents)
    }

    /// Public page for this listing, used in notifications.
    pub fn link(&self) -> String {
        match &self.handle {
            PurchaseHandle::DmarketOffer { .. } => {
                "https://dmarket.com/ingame-items/item-list/csgo-skins".to_string()
            }
            PurchaseHandle::SkinportSale { sale_id, slug } => {
                format!("https://skinport.com/item/{slug}/{sale_id}")
            }
        }
    }

    #[cfg(test)]
    pub fn sample(id: &str, title: &str, price_cents: u64) -> Self {
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
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} (${:.2}", self.marketplace, self.title, self.price())?;
        if let Some(variant) = &self.variant {
            write!(f, ", {variant}")?;
        }
        write!(f, ")")
    }
}

/// Convert an integer minor-unit amount to major units.
pub fn cents_to_major(cents: u64) -> Decimal {
    Decimal::from(cents) / Decimal::ONE_HUNDRED
}

// ---------------------------------------------------------------------------
// Purchase outcome
// ---------------------------------------------------------------------------

/// Classified result of a purchase attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    /// The exchange accepted the order (synchronously or via the slower
    /// asynchronous path).
    Confirmed { order_id: String },
    /// The offer vanished before we could buy it.
    OutOfStock,
    /// A successful response whose shape we do not recognise.
    Unknown { body: String },
    /// The exchange rejected the request.
    Error { detail: String },
}

impl fmt::Display for PurchaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurchaseOutcome::Confirmed { order_id } => write!(f, "confirmed ({order_id})"),
            PurchaseOutcome::OutOfStock => write!(f, "out of stock"),
            PurchaseOutcome::Unknown { .. } => write!(f, "unknown response"),
            PurchaseOutcome::Error { detail } => write!(f, "error: {detail}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for SKINSNIPER.
#[derive(Debug, thiserror::Error)]
pub enum SniperError {
    #[error("Transport error ({endpoint}): {message}")]
    Transport { endpoint: String, message: String },

    #[error("Protocol error: unrecognised frame {0}")]
    Protocol(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Item no longer listed: {0}")]
    OutOfStock(String),

    #[error("Reference price feed returned status {0}")]
    PriceFeed(u16),

    #[error("Feed reconnect ceiling exceeded after {failures} consecutive failures")]
    ReconnectCeiling { failures: u32 },

    #[error("Invalid credentials: {0}")]
    Credentials(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
