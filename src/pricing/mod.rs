//! Reference prices.
//!
//! Holds the latest snapshot of Buff163 highest-order prices keyed by item
//! name. The snapshot is replaced wholesale on every successful fetch and
//! read synchronously by the qualification rule.

use anyhow::{Context, Result};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::types::SniperError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const PRICES_URL: &str = "https://prices.csgotrader.app/latest/prices_v6.json";
const BUFF_SEARCH_URL: &str = "https://buff.163.com/market/csgo#tab=selling&page_num=1&search=";

/// Variant name used by the feeds for "no sub-variant".
const DEFAULT_VARIANT: &str = "default";

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Reference price for a single item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceEntry {
    pub base: Option<Decimal>,
    pub variants: HashMap<String, Decimal>,
}

impl ReferenceEntry {
    /// Price for the given variant, falling back to the base price when the
    /// variant has no override of its own.
    pub fn price_for(&self, variant: Option<&str>) -> Option<Decimal> {
        match variant {
            Some(v) if !v.is_empty() && v != DEFAULT_VARIANT => {
                self.variants.get(v).copied().or(self.base)
            }
            _ => self.base,
        }
    }
}

pub type PriceSnapshot = HashMap<String, ReferenceEntry>;

/// Shared, wholesale-replaced reference price snapshot.
#[derive(Debug, Default)]
pub struct ReferencePriceStore {
    snapshot: RwLock<Arc<PriceSnapshot>>,
}

impl ReferencePriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: PriceSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Reference price for an item, `None` when the item or its price is
    /// unknown.
    pub fn lookup(&self, name: &str, variant: Option<&str>) -> Option<Decimal> {
        self.current().get(name).and_then(|e| e.price_for(variant))
    }

    /// Swap in a new snapshot. The previous one is dropped, never merged.
    pub fn replace(&self, snapshot: PriceSnapshot) {
        let count = snapshot.len();
        let next = Arc::new(snapshot);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        debug!(items = count, "Reference price snapshot replaced");
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn current(&self) -> Arc<PriceSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

/// Buff163 search page for an item, linked next to the reference price.
pub fn buff_url(name: &str) -> String {
    format!("{BUFF_SEARCH_URL}{}", urlencoding::encode(name))
}

// ---------------------------------------------------------------------------
// Feed client
// ---------------------------------------------------------------------------

/// Only the Buff163 section of the price document is deserialized.
#[derive(Debug, Deserialize)]
struct ItemPrices {
    #[serde(default)]
    buff163: Option<BuffPrices>,
}

#[derive(Debug, Deserialize)]
struct BuffPrices {
    #[serde(default)]
    highest_order: Option<BuffOrder>,
}

#[derive(Debug, Deserialize)]
struct BuffOrder {
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    doppler: Option<HashMap<String, Option<f64>>>,
}

/// Fetches the reference price document.
pub struct PriceFeed {
    http: Client,
    url: String,
}

impl PriceFeed {
    pub fn new() -> Result<Self> {
        Self::with_url(PRICES_URL)
    }

    pub fn with_url(url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .user_agent("SKINSNIPER/0.1.0")
            .build()
            .context("Failed to build HTTP client for price feed")?;

        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    /// Download and parse the full price document.
    pub async fn fetch(&self) -> Result<PriceSnapshot> {
        info!(url = %self.url, "Fetching reference prices");

        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("Reference price request failed")?;

        if !resp.status().is_success() {
            return Err(SniperError::PriceFeed(resp.status().as_u16()).into());
        }

        let body = resp
            .text()
            .await
            .context("Failed to read reference price response")?;

        let snapshot = parse_snapshot(&body)?;
        info!(items = snapshot.len(), "Reference prices fetched");
        Ok(snapshot)
    }

    /// Fetch and, on success, replace the store's snapshot. A failed fetch
    /// leaves the previous snapshot in place.
    pub async fn refresh(&self, store: &ReferencePriceStore) -> Result<()> {
        match self.fetch().await {
            Ok(snapshot) => {
                store.replace(snapshot);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Reference price refresh failed, keeping previous snapshot");
                Err(e)
            }
        }
    }
}

/// Parse the price document into a snapshot. Items without a usable
/// Buff163 highest-order price keep an empty entry.
pub fn parse_snapshot(body: &str) -> Result<PriceSnapshot> {
    let raw: HashMap<String, ItemPrices> =
        serde_json::from_str(body).context("Failed to parse reference price document")?;

    Ok(raw
        .into_iter()
        .map(|(name, item)| {
            let order = item.buff163.and_then(|b| b.highest_order);
            let entry = match order {
                Some(order) => ReferenceEntry {
                    base: order.price.and_then(to_price),
                    variants: order
                        .doppler
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|(variant, price)| Some((variant, price.and_then(to_price)?)))
                        .collect(),
                },
                None => ReferenceEntry::default(),
            };
            (name, entry)
        })
        .collect())
}

fn to_price(value: f64) -> Option<Decimal> {
    Decimal::try_from(value).ok().map(|d| d.round_dp(2))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
