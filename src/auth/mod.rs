//! Session bootstrap for the streaming marketplace.
//!
//! A session is a `connect.sid` cookie. The first one may come from the
//! environment; every later one is requested from the operator, whose reply
//! arrives on a single-slot channel. Waiting for the operator has no
//! timeout but only suspends the task that needs the session.

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::notify::{notify, Notification, Notifier};
use crate::types::SniperError;

/// Source of fresh marketplace sessions.
///
/// Sessions are numbered. A caller that found its session expired passes
/// the generation it was using, so concurrent callers share one new
/// session instead of each asking for their own.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Number of sessions handed out so far.
    fn generation(&self) -> u64;

    /// A session newer than generation `seen`. Only asks for a new one if
    /// nothing has been handed out since `seen`.
    async fn acquire_since(&self, seen: u64) -> Result<SecretString>;

    async fn acquire(&self) -> Result<SecretString> {
        self.acquire_since(self.generation()).await
    }
}

// ---------------------------------------------------------------------------
// Operator inbox
// ---------------------------------------------------------------------------

/// Sending half handed to whatever collects operator replies.
pub type OperatorSender = mpsc::Sender<String>;

/// Receiving end of operator replies.
pub struct OperatorInbox {
    rx: Mutex<mpsc::Receiver<String>>,
}

/// Create a single-slot operator channel.
pub fn operator_channel() -> (OperatorSender, OperatorInbox) {
    let (tx, rx) = mpsc::channel(1);
    (tx, OperatorInbox { rx: Mutex::new(rx) })
}

impl OperatorInbox {
    /// Discard replies that arrived before anyone asked for them.
    async fn drain_stale(&self) {
        let mut rx = self.rx.lock().await;
        while let Ok(stale) = rx.try_recv() {
            debug!(len = stale.len(), "Discarding stale operator input");
        }
    }

    /// Block until the operator replies. Errors only if every sender is gone.
    pub async fn wait_for_input(&self) -> Result<String> {
        let mut rx = self.rx.lock().await;
        loop {
            let line = rx
                .recv()
                .await
                .ok_or_else(|| SniperError::Credentials("operator input channel closed".into()))?;
            let line = line.trim();
            if !line.is_empty() {
                return Ok(line.to_string());
            }
        }
    }
}

/// Feed operator replies from stdin, one line per reply.
pub fn spawn_stdin_feeder(tx: OperatorSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if tx.send(line).await.is_err() {
                break;
            }
        }
        debug!("Operator stdin feeder stopped");
    })
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Hands out the startup session once, then asks the operator.
///
/// Prompting and waiting happen under one lock, so at most one operator
/// request is outstanding. Callers queued behind it reuse its answer.
pub struct SessionBootstrap {
    slot: Mutex<SessionSlot>,
    generation: AtomicU64,
    inbox: OperatorInbox,
    notifier: Arc<dyn Notifier>,
    prompt: String,
}

struct SessionSlot {
    initial: Option<SecretString>,
    latest: Option<SecretString>,
}

impl SessionBootstrap {
    pub fn new(
        initial: Option<SecretString>,
        inbox: OperatorInbox,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            slot: Mutex::new(SessionSlot { initial, latest: None }),
            generation: AtomicU64::new(0),
            inbox,
            notifier,
            prompt: "Waiting for connect.sid cookie...".to_string(),
        }
    }

    async fn ask_operator(&self) -> Result<SecretString> {
        self.inbox.drain_stale().await;
        notify(self.notifier.as_ref(), Notification::Prompt(self.prompt.clone())).await;
        info!("Waiting for operator to supply a session");

        let session = self.inbox.wait_for_input().await?;
        info!("Operator supplied a new session");
        Ok(SecretString::new(session))
    }
}

#[async_trait]
impl SessionProvider for SessionBootstrap {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn acquire_since(&self, seen: u64) -> Result<SecretString> {
        let mut slot = self.slot.lock().await;

        if self.generation() > seen {
            if let Some(latest) = &slot.latest {
                debug!(seen, "Reusing session installed while waiting");
                return Ok(latest.clone());
            }
        }

        let session = match slot.initial.take() {
            Some(session) => {
                info!("Using session from environment");
                session
            }
            None => self.ask_operator().await?,
        };

        slot.latest = Some(session.clone());
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
