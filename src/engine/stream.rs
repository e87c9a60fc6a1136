//! Streaming sale-feed consumer.
//!
//! Keeps one socket.io connection to the Skinport sale feed alive,
//! evaluates every pushed sale and fires a best-effort cart reservation
//! for the ones that qualify.
//!
//! Connection lifecycle:
//!   Disconnected → Connecting → Handshaking → Subscribed → Disconnected
//!
//! A failed connect, handshake or read counts as one consecutive failure.
//! Any successful read on a subscribed connection resets the count; when it
//! reaches the ceiling the consumer returns a fatal error.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::notify::{notify, notify_detached, Notification, Notifier};
use crate::platforms::skinport::{
    decode_sales, parse_frame, subscribe_frame, Frame, NAMESPACE_JOIN_FRAME, PONG_FRAME,
    SALE_FEED_EVENT,
};
use crate::platforms::{FeedConnection, FeedTransport, ReserveOutcome, Reserver};
use crate::pricing::ReferencePriceStore;
use crate::strategy::{FeedContext, QualificationRule, Verdict};
use crate::types::{Listing, SniperError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Handshaking,
    Subscribed,
}

pub struct SaleFeedConsumer {
    transport: Arc<dyn FeedTransport>,
    rule: QualificationRule,
    prices: Arc<ReferencePriceStore>,
    reserver: Arc<dyn Reserver>,
    notifier: Arc<dyn Notifier>,
    max_failures: u32,
    state: FeedState,
}

impl SaleFeedConsumer {
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        rule: QualificationRule,
        prices: Arc<ReferencePriceStore>,
        reserver: Arc<dyn Reserver>,
        notifier: Arc<dyn Notifier>,
        max_failures: u32,
    ) -> Self {
        Self {
            transport,
            rule,
            prices,
            reserver,
            notifier,
            max_failures: max_failures.max(1),
            state: FeedState::Disconnected,
        }
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    fn transition(&mut self, next: FeedState) {
        debug!(from = ?self.state, to = ?next, "Sale feed state change");
        self.state = next;
    }

    /// Run until the reconnect ceiling is hit. Only ever returns an error.
    pub async fn run(&mut self) -> Result<()> {
        let mut failures: u32 = 0;

        loop {
            let err = match self.open().await {
                Ok(mut conn) => {
                    let err = self.receive(conn.as_mut(), &mut failures).await;
                    conn.close().await;
                    err
                }
                Err(e) => e,
            };

            self.transition(FeedState::Disconnected);
            failures += 1;
            warn!(
                error = %err,
                failures,
                max = self.max_failures,
                "Sale feed connection lost"
            );

            if failures >= self.max_failures {
                error!(failures, "Sale feed reconnect ceiling reached, giving up");
                let fatal = SniperError::ReconnectCeiling { failures };
                notify(self.notifier.as_ref(), Notification::Error(fatal.to_string())).await;
                return Err(fatal.into());
            }

            notify_detached(
                Arc::clone(&self.notifier),
                Notification::Status(format!("Skinport feed reconnecting ({failures})")),
            );
        }
    }

    /// Connect and perform the handshake:
    /// read ack, send join, read ack, send subscribe, read twice, send pong.
    async fn open(&mut self) -> Result<Box<dyn FeedConnection>> {
        self.transition(FeedState::Connecting);
        let mut conn = self.transport.connect().await?;

        self.transition(FeedState::Handshaking);
        if let Err(e) = Self::handshake(conn.as_mut()).await {
            conn.close().await;
            return Err(e);
        }

        self.transition(FeedState::Subscribed);
        info!("Subscribed to Skinport sale feed");
        Ok(conn)
    }

    async fn handshake(conn: &mut dyn FeedConnection) -> Result<()> {
        let open = conn.recv().await?;
        debug!(frame = %open, "Feed open");
        conn.send(NAMESPACE_JOIN_FRAME).await?;

        let joined = conn.recv().await?;
        debug!(frame = %joined, "Namespace joined");
        conn.send(&subscribe_frame()).await?;

        for _ in 0..2 {
            let frame = conn.recv().await?;
            debug!(frame = %frame, "Subscribe ack");
        }
        conn.send(PONG_FRAME).await?;
        Ok(())
    }

    /// Read frames until the connection fails; returns that failure.
    async fn receive(&self, conn: &mut dyn FeedConnection, failures: &mut u32) -> anyhow::Error {
        loop {
            let text = match conn.recv().await {
                Ok(text) => text,
                Err(e) => return e,
            };
            *failures = 0;

            match parse_frame(&text) {
                Frame::Ping => {
                    if let Err(e) = conn.send(PONG_FRAME).await {
                        return e;
                    }
                }
                Frame::Event { name, payload } if name == SALE_FEED_EVENT => {
                    match decode_sales(payload) {
                        Ok(listings) => {
                            for listing in listings {
                                self.handle_sale(listing);
                            }
                        }
                        Err(e) => self.report_protocol(e),
                    }
                }
                Frame::Event { name, .. } => {
                    self.report_protocol(SniperError::Protocol(format!("event {name}")));
                }
                Frame::Other(raw) => self.report_protocol(SniperError::Protocol(raw)),
            }
        }
    }

    fn report_protocol(&self, err: SniperError) {
        warn!(error = %err, "Unrecognised sale feed frame");
        notify_detached(Arc::clone(&self.notifier), Notification::Error(err.to_string()));
    }

    /// Evaluate one sale; on a pass, announce it and try to reserve it.
    fn handle_sale(&self, listing: Listing) {
        let reference = self
            .prices
            .lookup(&listing.title, listing.variant.as_deref());

        let Verdict::Qualified { discount, reference } =
            self.rule.evaluate(&listing, reference, FeedContext::Stream)
        else {
            return;
        };

        info!(
            item = %listing,
            discount = %discount.round_dp(2),
            reference = %reference,
            "Qualifying Skinport sale"
        );

        notify_detached(
            Arc::clone(&self.notifier),
            Notification::Find {
                listing: listing.clone(),
                discount,
                reference,
            },
        );

        let reserver = Arc::clone(&self.reserver);
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            reserve(reserver.as_ref(), notifier.as_ref(), listing).await;
        });
    }
}

async fn reserve(reserver: &dyn Reserver, notifier: &dyn Notifier, listing: Listing) {
    let notification = match reserver.reserve(&listing).await {
        Ok(ReserveOutcome::Reserved) => {
            info!(item = %listing.title, "Sale added to cart");
            Notification::Reserved { listing }
        }
        Ok(ReserveOutcome::Sold) => {
            info!(item = %listing.title, "Sale already gone");
            return;
        }
        Ok(ReserveOutcome::SessionExpired) => {
            Notification::Error(format!("Skinport session expired reserving {}", listing.title))
        }
        Ok(ReserveOutcome::Rejected(reason)) => {
            Notification::Error(format!("Skinport cart rejected {}: {reason}", listing.title))
        }
        Err(e) => Notification::Error(format!("Skinport reservation failed: {e}")),
    };
    notify(notifier, notification).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
