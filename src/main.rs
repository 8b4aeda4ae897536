//! OFFERKEEPER: jackpot trade-offer agent.
//!
//! Entry point. Loads configuration, initialises structured logging, opens
//! the ledger, checks the trading account, then runs the offer poller, the
//! reconciler, the issue worker and the HTTP server until Ctrl+C.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use offerkeeper::config::AppConfig;
use offerkeeper::engine::dispatch::issue_channel;
use offerkeeper::engine::issuer::{IssuerSettings, OfferIssuer};
use offerkeeper::engine::poller::OfferPoller;
use offerkeeper::engine::reconciler::Reconciler;
use offerkeeper::engine::retry::RetryPolicy;
use offerkeeper::platforms::steam::SteamClient;
use offerkeeper::platforms::TradePlatform;
use offerkeeper::server;
use offerkeeper::storage;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load("config.toml")?;
    init_logging();

    info!(
        agent_name = %cfg.agent.name,
        site = %cfg.agent.site_name,
        steam_id = %cfg.platform.steam_id,
        "OFFERKEEPER starting up"
    );

    // -- Bootstrap -------------------------------------------------------

    let ledger = storage::open(&cfg.ledger).await?;

    let api_key = AppConfig::resolve_secret(&cfg.platform.api_key_env)?;
    let login_cookie = AppConfig::resolve_secret(&cfg.platform.login_cookie_env)?;
    let steam = SteamClient::new(cfg.platform.steam_id.clone(), api_key, login_cookie)?;
    let platform: Arc<dyn TradePlatform> = Arc::new(steam);

    platform
        .refresh_session()
        .await
        .context("Failed to establish a web session")?;
    info!(platform = platform.name(), "Web session established");

    check_account(&*platform).await?;

    let issuer = Arc::new(OfferIssuer::new(
        platform.clone(),
        ledger.clone(),
        RetryPolicy::new(cfg.retry.clone()),
        IssuerSettings {
            site_name: cfg.agent.site_name.clone(),
            app_id: cfg.platform.app_id,
            context_id: cfg.platform.context_id,
        },
    ));

    let poller = OfferPoller::restore(platform.clone(), &*ledger, cfg.poller.clone())
        .await
        .context("Failed to restore poll checkpoint")?;

    // -- Tasks -----------------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(cfg.poller.channel_capacity);

    let (issue_queue, issue_worker) = issue_channel(issuer.clone(), cfg.server.issue_queue_capacity);

    let reconciler = Reconciler::new(ledger.clone(), platform.clone(), issuer);
    let reconciler_task = tokio::spawn(reconciler.run(event_rx));
    let poller_task = tokio::spawn(poller.run(event_tx, shutdown_rx.clone()));
    let issue_task = tokio::spawn(issue_worker.run());
    let server_task = server::spawn_server(issue_queue, &cfg.server, shutdown_rx).await?;

    info!("Agent running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received.");

    // Poller exits and drops its sender, which ends the reconciler after it
    // has drained the channel and any reissues. The server drops the issue
    // queue once open requests finish, and the worker then drains.
    let _ = shutdown_tx.send(true);

    if let Err(e) = poller_task.await {
        error!(error = %e, "Poller task failed");
    }
    if let Err(e) = reconciler_task.await {
        error!(error = %e, "Reconciler task failed");
    }
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server stopped with error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }
    if let Err(e) = issue_task.await {
        error!(error = %e, "Issue worker task failed");
    }

    info!("OFFERKEEPER shut down cleanly.");
    Ok(())
}

/// Refuse to run on a trade-locked account; warn on lesser limits.
async fn check_account(platform: &dyn TradePlatform) -> Result<()> {
    let limits = platform
        .account_limitations()
        .await
        .context("Failed to read account limitations")?;

    if limits.locked {
        bail!("Trading account is locked; refusing to start");
    }
    if limits.limited {
        warn!("Account is limited");
    }
    if limits.community_banned {
        warn!("Account is community banned");
    }
    if !limits.can_invite_friends {
        warn!("Account cannot invite friends");
    }
    info!("Account limitations checked");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("offerkeeper=info"));

    let json_logging = std::env::var("OFFERKEEPER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
