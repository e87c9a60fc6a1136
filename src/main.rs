//! SKINSNIPER: CS2 skin marketplace sniper
//!
//! Entry point. Loads configuration, initialises structured logging,
//! fetches reference prices, then runs one poller per DMarket segment and
//! the Skinport sale feed until interrupted or until the feed gives up.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use skinsniper::auth::{operator_channel, spawn_stdin_feeder, SessionBootstrap};
use skinsniper::config::{AppConfig, LoggingConfig};
use skinsniper::engine::balance::BalanceTracker;
use skinsniper::engine::executor::Executor;
use skinsniper::engine::poller::ListingPoller;
use skinsniper::engine::stream::SaleFeedConsumer;
use skinsniper::notify::{notify, DiscordWebhook, LogNotifier, Notification, Notifier};
use skinsniper::platforms::dmarket::{DmarketClient, RequestSigner};
use skinsniper::platforms::skinport::{SkinportClient, WsTransport};
use skinsniper::platforms::{Exchange, ListingSource};
use skinsniper::pricing::{PriceFeed, ReferencePriceStore};
use skinsniper::strategy::QualificationRule;

const BANNER: &str = r#"
 ___ _  _____ _  _ ___ _  _ ___ ___ ___ ___
/ __| |/ /_ _| \| / __| \| |_ _| _ \ __| _ \
\__ \ ' < | || .` \__ \ .` || ||  _/ _||   /
|___/_|\_\___|_|\_|___/_|\_|___|_| |___|_|_\

  DMarket + Skinport skin sniper  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("SKINSNIPER_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = AppConfig::load(&config_path)?;

    // Keep the guard alive so the file writer flushes on exit.
    let _log_guard = init_logging(&cfg.logging);

    println!("{BANNER}");
    info!(
        config = %config_path,
        poll_interval_ms = cfg.monitor.poll_interval_ms,
        min_profit_pct = %cfg.strategy.min_profit_pct,
        min_price = %cfg.strategy.min_price,
        max_price = %cfg.strategy.max_price,
        skinport = cfg.skinport.enabled,
        "SKINSNIPER starting up"
    );

    // -- Initialise components -------------------------------------------

    let notifier = build_notifier(&cfg)?;

    let public_key = AppConfig::resolve_env(&cfg.dmarket.public_key_env)?;
    let private_key = SecretString::new(AppConfig::resolve_env(&cfg.dmarket.private_key_env)?);
    let signer = RequestSigner::from_hex(&public_key, &private_key)
        .context("Malformed DMarket API keys")?;

    let dmarket = Arc::new(DmarketClient::new(
        cfg.dmarket.api_url.clone(),
        signer,
        cfg.strategy.min_price,
        cfg.strategy.max_price,
    )?);

    // Reference prices are required before anything is evaluated.
    let price_feed = Arc::new(PriceFeed::new()?);
    let snapshot = price_feed
        .fetch()
        .await
        .context("Startup reference price fetch failed")?;
    let prices = Arc::new(ReferencePriceStore::from_snapshot(snapshot));

    let exchange: Arc<dyn Exchange> = dmarket.clone();
    let balance = Arc::new(BalanceTracker::new(Arc::clone(&exchange)));
    if let Err(e) = balance.refresh().await {
        notify(notifier.as_ref(), Notification::Error(format!("Balance fetch failed: {e}"))).await;
    }

    let executor = Arc::new(Executor::new(
        exchange,
        Arc::clone(&notifier),
        Arc::clone(&balance),
    ));
    let rule = QualificationRule::from_config(&cfg.strategy);

    // -- Background tasks ------------------------------------------------

    if cfg.monitor.price_refresh_secs > 0 {
        spawn_price_refresh(
            Arc::clone(&price_feed),
            Arc::clone(&prices),
            Duration::from_secs(cfg.monitor.price_refresh_secs),
        );
    }

    let source: Arc<dyn ListingSource> = dmarket;
    let poll_interval = Duration::from_millis(cfg.monitor.poll_interval_ms);
    for segment in &cfg.monitor.segments {
        let poller = ListingPoller::new(
            Arc::clone(&source),
            *segment,
            rule.clone(),
            Arc::clone(&prices),
            Arc::clone(&balance),
            Arc::clone(&executor),
            Arc::clone(&notifier),
        );
        tokio::spawn(poller.run(poll_interval));
    }

    let stream = if cfg.skinport.enabled {
        Some(spawn_sale_feed(&cfg, &rule, &prices, &notifier)?)
    } else {
        info!("Skinport feed disabled");
        None
    };

    notify(
        notifier.as_ref(),
        Notification::Status(format!("Bot started. Balance: ${:.2}", balance.get())),
    )
    .await;

    // -- Wait for shutdown -----------------------------------------------

    let stream_exit = async {
        match stream {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received.");
        }
        exit = stream_exit => {
            match exit {
                Ok(Err(e)) => error!(error = %e, "Sale feed stopped, shutting down"),
                Ok(Ok(())) => warn!("Sale feed exited, shutting down"),
                Err(e) => error!(error = %e, "Sale feed task panicked, shutting down"),
            }
        }
    }

    info!(balance = %balance.get(), "SKINSNIPER shut down.");
    Ok(())
}

/// Webhook notifier when configured, log-only otherwise.
fn build_notifier(cfg: &AppConfig) -> Result<Arc<dyn Notifier>> {
    let Some(env) = cfg.notifications.webhook_url_env.as_deref() else {
        info!("No webhook configured, notifications go to the log");
        return Ok(Arc::new(LogNotifier));
    };

    match AppConfig::resolve_env(env) {
        Ok(url) => Ok(Arc::new(DiscordWebhook::new(SecretString::new(url))?)),
        Err(e) => {
            warn!(error = %e, "Webhook URL unavailable, notifications go to the log");
            Ok(Arc::new(LogNotifier))
        }
    }
}

/// Replace the reference snapshot on a fixed interval.
fn spawn_price_refresh(
    feed: Arc<PriceFeed>,
    prices: Arc<ReferencePriceStore>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The startup fetch already filled the store.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            // A failed fetch keeps the previous snapshot and is logged.
            let _ = feed.refresh(&prices).await;
        }
    })
}

/// Wire up the Skinport session, cart client and sale feed consumer.
fn spawn_sale_feed(
    cfg: &AppConfig,
    rule: &QualificationRule,
    prices: &Arc<ReferencePriceStore>,
    notifier: &Arc<dyn Notifier>,
) -> Result<JoinHandle<Result<()>>> {
    let (operator_tx, inbox) = operator_channel();
    spawn_stdin_feeder(operator_tx);

    let initial = cfg
        .skinport
        .session_env
        .as_deref()
        .and_then(|env| AppConfig::resolve_env(env).ok())
        .map(SecretString::new);
    let sessions = Arc::new(SessionBootstrap::new(initial, inbox, Arc::clone(notifier)));
    let skinport = Arc::new(SkinportClient::new(sessions)?);

    // Waiting on the operator must not hold up the feed or the pollers.
    {
        let skinport = Arc::clone(&skinport);
        let notifier = Arc::clone(notifier);
        tokio::spawn(async move {
            if let Err(e) = skinport.bootstrap().await {
                notify(notifier.as_ref(), Notification::Error(format!("Skinport login failed: {e}"))).await;
            }
        });
    }

    let (min_price, max_price) = cfg.skinport_bounds();
    let mut consumer = SaleFeedConsumer::new(
        Arc::new(WsTransport::default()),
        rule.with_bounds(min_price, max_price),
        Arc::clone(prices),
        skinport,
        Arc::clone(notifier),
        cfg.skinport.max_reconnect_failures,
    );

    Ok(tokio::spawn(async move { consumer.run().await }))
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialise the `tracing` subscriber: console plus an append-only log file.
fn init_logging(cfg: &LoggingConfig) -> WorkerGuard {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("skinsniper=info"));

    let file_appender = tracing_appender::rolling::never(&cfg.directory, &cfg.file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let json_logging = cfg.json || std::env::var("SKINSNIPER_LOG_JSON").is_ok();
    let registry = tracing_subscriber::registry().with(env_filter);

    if json_logging {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(fmt::layer().json().with_ansi(false).with_writer(file_writer))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true))
            .with(fmt::layer().with_ansi(false).with_writer(file_writer))
            .init();
    }

    guard
}
