//! Skinport integration.
//!
//! Streaming marketplace. Sales arrive over a socket.io (EIO=4) WebSocket;
//! qualifying sales are reserved by adding them to the account cart.
//!
//! Feed: wss://skinport.com/socket.io/?EIO=4&transport=websocket
//! Auth: `connect.sid` session cookie for the cart endpoints only.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{FeedConnection, FeedTransport, ReserveOutcome, Reserver};
use crate::auth::SessionProvider;
use crate::types::{Listing, Marketplace, PurchaseHandle, SniperError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const FEED_URL: &str = "wss://skinport.com/socket.io/?EIO=4&transport=websocket";
const SITE_URL: &str = "https://skinport.com";
const IMAGE_URL: &str = "https://community.cloudflare.steamstatic.com/economy/image/class/730/";

/// Socket.io ping from the server.
pub const PING_FRAME: &str = "2";
/// Our answer to a ping.
pub const PONG_FRAME: &str = "3";
/// Namespace join, sent after the open packet.
pub const NAMESPACE_JOIN_FRAME: &str = "40";
/// Prefix of event frames (`42[...]`).
const EVENT_PREFIX: &str = "42";

pub const SALE_FEED_EVENT: &str = "saleFeed";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscription to the CS2 sale feed, priced in USD.
pub fn subscribe_frame() -> String {
    format!(
        "{EVENT_PREFIX}{}",
        serde_json::json!(["saleFeedJoin", {"appid": 730, "currency": "USD", "locale": "en"}])
    )
}

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// A decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ping,
    Event { name: String, payload: Value },
    /// Anything else, kept verbatim for error reporting.
    Other(String),
}

pub fn parse_frame(text: &str) -> Frame {
    if text == PING_FRAME {
        return Frame::Ping;
    }

    let Some(json) = text.strip_prefix(EVENT_PREFIX) else {
        return Frame::Other(text.to_string());
    };

    match serde_json::from_str::<Value>(json) {
        Ok(Value::Array(mut parts)) if !parts.is_empty() => {
            let payload = if parts.len() > 1 { parts.remove(1) } else { Value::Null };
            match parts.remove(0) {
                Value::String(name) => Frame::Event { name, payload },
                _ => Frame::Other(text.to_string()),
            }
        }
        _ => Frame::Other(text.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Sale events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleFeedPayload {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub sales: Vec<SkinportSale>,
}

/// A sale as pushed by the feed. Only the fields we need.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkinportSale {
    pub sale_id: u64,
    pub market_name: String,
    /// USD cents.
    pub sale_price: u64,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub classid: Option<String>,
}

impl SkinportSale {
    pub fn into_listing(self) -> Listing {
        Listing {
            id: self.sale_id.to_string(),
            marketplace: Marketplace::Skinport,
            title: self.market_name,
            price_cents: self.sale_price,
            variant: self.version.filter(|v| !v.is_empty()),
            handle: PurchaseHandle::SkinportSale {
                sale_id: self.sale_id,
                slug: self.url,
            },
            image_url: self.classid.map(|c| format!("{IMAGE_URL}{c}")),
        }
    }
}

/// Decode a `saleFeed` payload into listings.
pub fn decode_sales(payload: Value) -> Result<Vec<Listing>, SniperError> {
    let feed: SaleFeedPayload = serde_json::from_value(payload)
        .map_err(|e| SniperError::Protocol(format!("saleFeed payload: {e}")))?;
    debug!(event_type = %feed.event_type, count = feed.sales.len(), "Sale feed event");
    Ok(feed.sales.into_iter().map(SkinportSale::into_listing).collect())
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// Opens real WebSocket connections to the sale feed.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: &str) -> Self {
        Self { url: url.to_string() }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(FEED_URL)
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>> {
        info!(url = %self.url, "Connecting to Skinport feed");

        let (stream, response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SniperError::Transport {
                endpoint: self.url.clone(),
                message: "connect timeout".into(),
            })?
            .map_err(|e| SniperError::Transport {
                endpoint: self.url.clone(),
                message: e.to_string(),
            })?;

        debug!(status = ?response.status(), "Skinport WebSocket connected");
        Ok(Box::new(WsConnection { stream }))
    }
}

#[async_trait]
impl FeedConnection for WsConnection {
    async fn recv(&mut self) -> Result<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(String::from_utf8_lossy(&bytes).into_owned())
                }
                Some(Ok(Message::Close(frame))) => {
                    anyhow::bail!("Feed closed by remote: {frame:?}")
                }
                // Transport-level ping/pong is answered by tungstenite.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("Feed read failed"),
                None => anyhow::bail!("Feed stream ended"),
            }
        }
    }

    async fn send(&mut self, frame: &str) -> Result<()> {
        self.stream
            .send(Message::Text(frame.to_string()))
            .await
            .context("Feed write failed")
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Error closing feed connection");
        }
    }
}

// ---------------------------------------------------------------------------
// Cart reservation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SiteDataResponse {
    #[serde(default)]
    csrf: String,
    #[serde(default)]
    rates: Option<Rates>,
}

#[derive(Debug, Deserialize)]
struct Rates {
    /// USD per GBP; the account is billed in GBP.
    #[serde(rename = "USD")]
    usd: f64,
}

/// Per-request site data: CSRF token and the GBP→USD rate.
#[derive(Debug, Clone)]
pub struct SiteData {
    pub csrf: String,
    pub usd_per_gbp: Decimal,
}

#[derive(Debug, Deserialize)]
struct CartResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Classify a cart response body.
pub fn classify_cart_response(body: &str) -> ReserveOutcome {
    let resp: CartResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(_) => return ReserveOutcome::Rejected(body.to_string()),
    };

    if resp.success {
        return ReserveOutcome::Reserved;
    }

    match resp.message.as_deref() {
        Some("MUST_LOGIN") => ReserveOutcome::SessionExpired,
        Some("ITEM_NOT_LISTED") => ReserveOutcome::Sold,
        Some(other) => ReserveOutcome::Rejected(other.to_string()),
        None => ReserveOutcome::Rejected(body.to_string()),
    }
}

/// Convert USD cents to GBP pence at the site's rate.
pub fn usd_cents_to_gbp_pence(usd_cents: u64, usd_per_gbp: Decimal) -> Result<u64> {
    if usd_per_gbp <= Decimal::ZERO {
        anyhow::bail!("Invalid GBP rate {usd_per_gbp}");
    }
    (Decimal::from(usd_cents) / usd_per_gbp)
        .round()
        .to_u64()
        .context("GBP amount out of range")
}

/// Browser-like headers the site expects.
fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("accept", HeaderValue::from_static("application/json, text/plain, */*"));
    headers.insert("accept-language", HeaderValue::from_static("en-GB,en-US;q=0.9,en;q=0.8"));
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("pragma", HeaderValue::from_static("no-cache"));
    headers.insert("referer", HeaderValue::from_static("https://skinport.com/item/"));
    headers
}

/// The cart endpoints, behind a seam so the session retry can be tested
/// without a network.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Cart: Send + Sync {
    /// Install a session as the `connect.sid` cookie.
    fn install_session(&self, session: &SecretString) -> Result<()>;

    /// Add one sale to the cart.
    async fn add(&self, sale_id: u64, usd_cents: u64) -> Result<ReserveOutcome>;
}

/// Cookie-authenticated HTTP access to the cart.
pub struct HttpCart {
    http: Client,
    jar: Arc<Jar>,
    base_url: String,
}

impl HttpCart {
    pub fn new(base_url: &str) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/105.0.0.0 Safari/537.36",
            )
            .default_headers(default_headers())
            .cookie_provider(Arc::clone(&jar))
            .build()
            .context("Failed to build HTTP client for Skinport")?;

        Ok(Self {
            http,
            jar,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the CSRF token and exchange rate.
    pub async fn site_data(&self) -> Result<SiteData> {
        let url = format!("{}/api/data", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("t", Utc::now().timestamp_millis().to_string())])
            .send()
            .await
            .context("Skinport site data request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("Skinport site data error {}", resp.status());
        }

        let data: SiteDataResponse = resp
            .json()
            .await
            .context("Failed to parse Skinport site data")?;

        let rate = data
            .rates
            .and_then(|r| Decimal::try_from(r.usd).ok())
            .context("Skinport site data has no USD rate")?;

        Ok(SiteData {
            csrf: data.csrf,
            usd_per_gbp: rate,
        })
    }
}

#[async_trait]
impl Cart for HttpCart {
    fn install_session(&self, session: &SecretString) -> Result<()> {
        let url = reqwest::Url::parse(&self.base_url).context("Invalid Skinport base URL")?;
        let domain = url.host_str().unwrap_or("skinport.com").to_string();
        self.jar.add_cookie_str(
            &format!(
                "connect.sid={}; Domain=.{domain}; Path=/",
                session.expose_secret()
            ),
            &url,
        );
        Ok(())
    }

    async fn add(&self, sale_id: u64, usd_cents: u64) -> Result<ReserveOutcome> {
        let site = self.site_data().await?;
        let pence = usd_cents_to_gbp_pence(usd_cents, site.usd_per_gbp)?;

        let form = [
            ("sales[0][id]", sale_id.to_string()),
            ("sales[0][price]", pence.to_string()),
            ("_csrf", site.csrf),
        ];

        let resp = self
            .http
            .post(format!("{}/api/cart/add", self.base_url))
            .form(&form)
            .send()
            .await
            .context("Skinport cart request failed")?;

        let body = resp
            .text()
            .await
            .context("Failed to read Skinport cart response")?;

        Ok(classify_cart_response(&body))
    }
}

/// Skinport reservations: a cart plus the sessions that authenticate it.
pub struct SkinportClient {
    cart: Arc<dyn Cart>,
    sessions: Arc<dyn SessionProvider>,
}

impl SkinportClient {
    pub fn new(sessions: Arc<dyn SessionProvider>) -> Result<Self> {
        Self::with_base_url(SITE_URL, sessions)
    }

    pub fn with_base_url(base_url: &str, sessions: Arc<dyn SessionProvider>) -> Result<Self> {
        Ok(Self::with_cart(Arc::new(HttpCart::new(base_url)?), sessions))
    }

    pub fn with_cart(cart: Arc<dyn Cart>, sessions: Arc<dyn SessionProvider>) -> Self {
        Self { cart, sessions }
    }

    /// Acquire a session and install it as the `connect.sid` cookie.
    pub async fn bootstrap(&self) -> Result<()> {
        let session = self.sessions.acquire().await?;
        self.cart.install_session(&session)?;
        info!("Skinport session installed");
        Ok(())
    }

    /// Replace a session that expired while generation `seen` was current.
    async fn renew_session(&self, seen: u64) -> Result<()> {
        let session = self.sessions.acquire_since(seen).await?;
        self.cart.install_session(&session)?;
        info!("Skinport session renewed");
        Ok(())
    }
}

#[async_trait]
impl Reserver for SkinportClient {
    /// Reserve a sale. An expired session is renewed and the reservation
    /// retried once.
    async fn reserve(&self, listing: &Listing) -> Result<ReserveOutcome> {
        let PurchaseHandle::SkinportSale { sale_id, .. } = &listing.handle else {
            anyhow::bail!("Listing {} is not a Skinport sale", listing.id);
        };

        let seen = self.sessions.generation();
        let outcome = self.cart.add(*sale_id, listing.price_cents).await?;
        if outcome != ReserveOutcome::SessionExpired {
            return Ok(outcome);
        }

        warn!(sale_id = *sale_id, "Skinport session expired at reservation, re-authenticating");
        self.renew_session(seen).await?;
        self.cart.add(*sale_id, listing.price_cents).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
