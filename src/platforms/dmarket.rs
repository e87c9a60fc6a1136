//! DMarket integration.
//!
//! Polled marketplace and purchase exchange. Listing snapshots come from
//! the public market endpoint; purchases and balance checks are signed.
//!
//! Base URL: https://api.dmarket.com
//! Auth: Ed25519 signature over `method + path + body + unix_ts`, sent as
//! `X-Request-Sign: dmar ed25519 <hex>` alongside `X-Sign-Date` and
//! `X-Api-Key`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use reqwest::{Client, Method};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Exchange, ListingSource, PurchaseResponse};
use crate::types::{
    cents_to_major, DmarketSegment, Listing, Marketplace, PurchaseHandle, SniperError,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const BASE_URL: &str = "https://api.dmarket.com";
const PLATFORM_NAME: &str = "dmarket";

const MARKET_ITEMS_PATH: &str = "/exchange/v1/market/items";
const OFFERS_BUY_PATH: &str = "/exchange/v1/offers-buy";
const BALANCE_PATH: &str = "/account/v1/balance";

/// CS2 game id on DMarket.
const GAME_ID: &str = "a8db";
/// Fixed page size of a listing snapshot.
pub const PAGE_SIZE: u32 = 100;

// ---------------------------------------------------------------------------
// Request signing
// ---------------------------------------------------------------------------

/// Signs exchange requests with the account's Ed25519 key.
pub struct RequestSigner {
    public_key: String,
    signing_key: SigningKey,
}

impl RequestSigner {
    /// Build a signer from the hex-encoded API keys.
    ///
    /// The private key may be the 64-byte keypair DMarket hands out or the
    /// bare 32-byte seed; the first 32 bytes are the seed either way.
    pub fn from_hex(public_key: &str, private_key: &SecretString) -> Result<Self, SniperError> {
        let bytes = hex::decode(private_key.expose_secret().trim())
            .map_err(|e| SniperError::Credentials(format!("private key is not hex: {e}")))?;

        let seed: [u8; 32] = bytes
            .get(..32)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                SniperError::Credentials(format!(
                    "private key must be 32 or 64 bytes, got {}",
                    bytes.len()
                ))
            })?;

        let signing_key = SigningKey::from_bytes(&seed);

        if bytes.len() == 64 && bytes[32..] != signing_key.verifying_key().to_bytes() {
            return Err(SniperError::Credentials(
                "private key does not match its embedded public half".into(),
            ));
        }

        Ok(Self {
            public_key: public_key.trim().to_string(),
            signing_key,
        })
    }

    /// The exact string that gets signed.
    pub fn message(method: &str, path: &str, body: &str, timestamp: i64) -> String {
        format!("{method}{path}{body}{timestamp}")
    }

    /// Hex-encoded signature of a request.
    pub fn sign(&self, method: &str, path: &str, body: &str, timestamp: i64) -> String {
        let message = Self::message(method, path, body, timestamp);
        hex::encode(self.signing_key.sign(message.as_bytes()).to_bytes())
    }

    /// Authentication headers for a request.
    pub fn headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
        timestamp: i64,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("X-Sign-Date", timestamp.to_string()),
            (
                "X-Request-Sign",
                format!("dmar ed25519 {}", self.sign(method, path, body, timestamp)),
            ),
            ("X-Api-Key", self.public_key.clone()),
        ]
    }
}

// ---------------------------------------------------------------------------
// API response types (DMarket JSON → Rust)
// ---------------------------------------------------------------------------

/// `/exchange/v1/market/items` page. Only the fields we need.
#[derive(Debug, Deserialize)]
struct MarketItemsResponse {
    #[serde(default)]
    objects: Vec<DmarketProduct>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DmarketProduct {
    #[serde(default)]
    product_id: String,
    #[serde(default)]
    item_id: String,
    title: String,
    #[serde(default)]
    image: Option<String>,
    price: DmarketPrice,
    #[serde(default)]
    extra: DmarketExtra,
}

#[derive(Debug, Deserialize)]
struct DmarketPrice {
    #[serde(rename = "USD")]
    usd: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DmarketExtra {
    #[serde(default)]
    offer_id: String,
    #[serde(default)]
    phase_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DmarketBalance {
    usd: String,
}

/// Error body returned with non-success statuses.
#[derive(Debug, Default, Deserialize)]
pub struct DmarketError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub code: serde_json::Value,
    #[serde(default)]
    pub message: String,
}

impl DmarketError {
    /// Best human-readable detail from an error body.
    pub fn detail(status: u16, body: &str) -> String {
        match serde_json::from_str::<DmarketError>(body) {
            Ok(err) if !err.message.is_empty() => err.message,
            Ok(err) if !err.error.is_empty() => err.error,
            _ => format!("HTTP {status}: {body}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// DMarket platform client.
pub struct DmarketClient {
    http: Client,
    api_url: String,
    signer: RequestSigner,
    min_price: Decimal,
    max_price: Decimal,
}

impl DmarketClient {
    /// Create a new DMarket client. `min_price`/`max_price` bound the
    /// listing query.
    pub fn new(
        api_url: Option<String>,
        signer: RequestSigner,
        min_price: Decimal,
        max_price: Decimal,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("SKINSNIPER/0.1.0")
            .build()
            .context("Failed to build HTTP client for DMarket")?;

        Ok(Self {
            http,
            api_url: api_url.unwrap_or_else(|| BASE_URL.to_string()),
            signer,
            min_price,
            max_price,
        })
    }

    // -- Internal helpers ------------------------------------------------

    /// Query parameters of a listing snapshot request.
    fn snapshot_query(&self, segment: DmarketSegment) -> Vec<(&'static str, String)> {
        vec![
            ("side", "market".into()),
            ("orderBy", "updated".into()),
            ("orderDir", "desc".into()),
            ("title", String::new()),
            ("priceFrom", to_cents(self.min_price).to_string()),
            ("priceTo", to_cents(self.max_price).to_string()),
            ("treeFilters", String::new()),
            ("gameId", GAME_ID.into()),
            ("cursor", String::new()),
            ("limit", PAGE_SIZE.to_string()),
            ("currency", "USD".into()),
            ("platform", "browser".into()),
            ("isLoggedIn", "false".into()),
            ("types", segment.as_str().into()),
        ]
    }

    /// Send a signed request. The body is signed byte-for-byte as sent.
    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        body: String,
    ) -> Result<reqwest::Response> {
        let timestamp = Utc::now().timestamp();
        let mut req = self
            .http
            .request(method.clone(), format!("{}{}", self.api_url, path))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");

        for (name, value) in self.signer.headers(method.as_str(), path, &body, timestamp) {
            req = req.header(name, value);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        req.send()
            .await
            .map_err(|e| SniperError::Transport {
                endpoint: path.to_string(),
                message: e.to_string(),
            })
            .map_err(Into::into)
    }

    /// Convert an API product to a `Listing`. Products with an unparseable
    /// price are dropped.
    fn to_listing(product: DmarketProduct, segment: DmarketSegment) -> Option<Listing> {
        let price_cents = match product.price.usd.parse::<u64>() {
            Ok(cents) => cents,
            Err(_) => {
                warn!(item = %product.title, price = %product.price.usd, "Unparseable DMarket price");
                return None;
            }
        };

        let id = if product.product_id.is_empty() {
            product.item_id
        } else {
            product.product_id
        };

        Some(Listing {
            id,
            marketplace: Marketplace::Dmarket,
            title: product.title,
            price_cents,
            variant: product.extra.phase_title.filter(|p| !p.is_empty()),
            handle: PurchaseHandle::DmarketOffer {
                offer_id: product.extra.offer_id,
                segment,
            },
            image_url: product.image,
        })
    }
}

/// Purchase request body for one offer.
pub fn purchase_body(listing: &Listing) -> Result<String> {
    let PurchaseHandle::DmarketOffer { offer_id, segment } = &listing.handle else {
        anyhow::bail!("Listing {} is not a DMarket offer", listing.id);
    };

    let body = serde_json::json!({
        "offers": [{
            "offerId": offer_id,
            "price": {
                "amount": listing.price_cents.to_string(),
                "currency": "USD",
            },
            "type": segment.as_str(),
        }]
    });
    Ok(body.to_string())
}

/// Parse the balance document (`usd` in cents) into dollars.
fn parse_balance(body: &str) -> Result<Decimal> {
    let balance: DmarketBalance =
        serde_json::from_str(body).context("Failed to parse DMarket balance response")?;
    let cents = balance
        .usd
        .parse::<u64>()
        .with_context(|| format!("Invalid DMarket balance amount: {}", balance.usd))?;
    Ok(cents_to_major(cents))
}

fn to_cents(amount: Decimal) -> u64 {
    (amount * Decimal::ONE_HUNDRED).round().to_u64().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl ListingSource for DmarketClient {
    /// Fetch one page of the most recently updated listings.
    async fn fetch_snapshot(&self, segment: DmarketSegment) -> Result<Vec<Listing>> {
        let url = format!("{}{}", self.api_url, MARKET_ITEMS_PATH);
        debug!(segment = %segment, "Fetching DMarket listings");

        let resp = self
            .http
            .get(&url)
            .query(&self.snapshot_query(segment))
            .send()
            .await
            .context("DMarket listing request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "DMarket listing error {status}: {}",
                DmarketError::detail(status.as_u16(), &body)
            );
        }

        let page: MarketItemsResponse = resp
            .json()
            .await
            .context("Failed to parse DMarket listing response")?;

        debug!(
            segment = %segment,
            count = page.objects.len(),
            cursor = page.cursor.as_deref().unwrap_or(""),
            "DMarket page fetched"
        );

        Ok(page
            .objects
            .into_iter()
            .filter_map(|p| Self::to_listing(p, segment))
            .collect())
    }

    fn name(&self) -> &str {
        PLATFORM_NAME
    }
}

#[async_trait]
impl Exchange for DmarketClient {
    async fn purchase(&self, listing: &Listing) -> Result<PurchaseResponse> {
        let body = purchase_body(listing)?;
        let resp = self.send_signed(Method::PATCH, OFFERS_BUY_PATH, body).await?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .context("Failed to read DMarket purchase response")?;

        info!(item = %listing.title, status, "DMarket purchase response received");
        Ok(PurchaseResponse { status, body })
    }

    async fn balance(&self) -> Result<Decimal> {
        let resp = self
            .send_signed(Method::GET, BALANCE_PATH, String::new())
            .await?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!(
                "DMarket balance error {status}: {}",
                DmarketError::detail(status.as_u16(), &body)
            );
        }

        parse_balance(&body)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
