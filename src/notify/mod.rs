//! Notification sink.
//!
//! Purchases, finds, errors and operator prompts leave the process through
//! a [`Notifier`]. Delivery is fire-and-forget: a failed delivery is logged
//! and otherwise ignored.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::pricing::buff_url;
use crate::types::{DmarketSegment, Listing, PurchaseHandle};

/// Embed colour for successful purchases.
const PURCHASE_COLOR: u32 = 5_763_719;

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Notification {
    /// The exchange confirmed a purchase.
    Purchase {
        listing: Listing,
        order_id: String,
        discount: Decimal,
        reference: Decimal,
    },
    /// A qualifying listing on a feed we cannot buy from directly.
    Find {
        listing: Listing,
        discount: Decimal,
        reference: Decimal,
    },
    /// A qualifying listing was placed in the marketplace cart.
    Reserved { listing: Listing },
    Error(String),
    Status(String),
    /// Request for operator input (session cookie and similar).
    Prompt(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Deliver a notification, logging instead of propagating failures.
pub async fn notify(notifier: &dyn Notifier, notification: Notification) {
    if let Err(e) = notifier.send(&notification).await {
        warn!(error = %e, "Notification delivery failed");
    }
}

/// Deliver a notification on its own task.
pub fn notify_detached(notifier: Arc<dyn Notifier>, notification: Notification) {
    tokio::spawn(async move {
        notify(notifier.as_ref(), notification).await;
    });
}

// ---------------------------------------------------------------------------
// Discord webhook
// ---------------------------------------------------------------------------

/// Posts notifications to a Discord webhook.
pub struct DiscordWebhook {
    http: Client,
    url: SecretString,
}

impl DiscordWebhook {
    pub fn new(url: SecretString) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client for webhook")?;

        Ok(Self { http, url })
    }

    /// Webhook JSON body for a notification.
    pub fn payload(notification: &Notification) -> Value {
        match notification {
            Notification::Purchase {
                listing,
                order_id,
                discount,
                reference,
            } => {
                let description = match &listing.handle {
                    PurchaseHandle::DmarketOffer {
                        segment: DmarketSegment::Dmarket,
                        ..
                    } => "Purchased from the DMarket bot.",
                    _ => "Purchased P2P. SEND TRADE NOW.",
                };
                let mut embed = embed(listing, *discount, *reference);
                embed["title"] = json!(format!("Successful Purchase: {order_id}"));
                embed["description"] = json!(description);
                embed["color"] = json!(PURCHASE_COLOR);
                json!({ "embeds": [embed] })
            }
            Notification::Find {
                listing,
                discount,
                reference,
            } => {
                let mut embed = embed(listing, *discount, *reference);
                embed["title"] = json!(format!("{}: {}", listing.marketplace, listing.title));
                json!({ "embeds": [embed] })
            }
            Notification::Reserved { listing } => json!({
                "content": format!("Item added to cart: {} (https://skinport.com/cart)", listing.title)
            }),
            Notification::Error(message) => json!({
                "content": format!("Error encountered: {message}")
            }),
            Notification::Status(message) | Notification::Prompt(message) => json!({
                "content": message
            }),
        }
    }
}

/// Shared embed layout: price with discount, reference price with link.
fn embed(listing: &Listing, discount: Decimal, reference: Decimal) -> Value {
    let mut embed = json!({
        "url": listing.link(),
        "timestamp": Utc::now().to_rfc3339(),
        "fields": [
            {
                "name": "Price",
                "value": format!("${:.2} ({:.2}%)", listing.price(), discount),
                "inline": true,
            },
            {
                "name": "Buff Price",
                "value": format!("[${:.2}]({})", reference, buff_url(&listing.title)),
                "inline": true,
            },
        ],
    });
    if let Some(image) = &listing.image_url {
        embed["thumbnail"] = json!({ "url": image });
    }
    embed
}

#[async_trait]
impl Notifier for DiscordWebhook {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let resp = self
            .http
            .post(self.url.expose_secret())
            .json(&Self::payload(notification))
            .send()
            .await
            .context("Webhook request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Webhook rejected notification {status}: {body}");
        }

        debug!("Webhook notification delivered");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log-only sink
// ---------------------------------------------------------------------------

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::Purchase { listing, order_id, discount, .. } => {
                info!(item = %listing.title, order_id = %order_id, discount = %discount.round_dp(2), "Purchase confirmed");
            }
            Notification::Find { listing, discount, .. } => {
                info!(item = %listing.title, price = %listing.price(), discount = %discount.round_dp(2), "Qualifying listing found");
            }
            Notification::Reserved { listing } => info!(item = %listing.title, "Item reserved"),
            Notification::Error(message) => error!(message = %message, "Error encountered"),
            Notification::Status(message) => info!(message = %message, "Status"),
            Notification::Prompt(message) => warn!(message = %message, "Operator input required"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
