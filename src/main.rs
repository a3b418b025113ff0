//! Live-Odds Relay
//!
//! Connects to the upstream live-odds feed, keeps a verified odds book per
//! event, pushes changes to local consumers and dispatches bets across every
//! ready betting session.
//!
//! ## Architecture
//!
//! - **Feed client** decodes compressed frames and keeps topic subscriptions
//!   alive across reconnects
//! - **Odds repository** rejects lines whose event text names other teams
//! - **Broadcaster** fans changes out over bounded per-consumer channels
//! - **Dispatcher** places in parallel per session, with lock-and-load replay
//! - **Audit log** persists every attempt to SQLite off the async runtime

use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use odds_relay::broadcast::{Broadcaster, FocusFilter};
use odds_relay::config::{
    dry_run_enabled, session_bridge_url, test_dispatch_enabled, AuditConfig, DispatchConfig, FeedConfig,
    RepositoryConfig,
};
use odds_relay::dispatch::{
    create_dispatch_channel, run_dispatch_loop, BetPlacer, DispatchOutcome, Dispatcher, DryRunPlacer, HttpSessionBridge,
};
use odds_relay::feed::feed_channel;
use odds_relay::lock_cache::LockedRequestCache;
use odds_relay::pipeline::{run_ingestion, Pipeline};
use odds_relay::repository::OddsRepository;
use odds_relay::session::SessionRegistry;
use odds_relay::storage::create_audit_channel;
use odds_relay::types::{DispatchRequest, FundType};

/// Decoded messages buffered between the socket and ingestion
const FEED_MESSAGE_BUFFER: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with both stdout and file output
    let file_appender = tracing_appender::rolling::never(".", "relay.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive("odds_relay=info".parse()?);

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    dotenvy::dotenv().ok();

    let feed_config = FeedConfig::from_env();
    let dispatch_config = DispatchConfig::from_env();
    let audit_config = AuditConfig::from_env();

    info!("🚀 Live-Odds Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("   Feed: {} (app {})", feed_config.endpoint, feed_config.app_version);
    info!("   Channels: {:?}", feed_config.channels);
    info!(
        "   Probe stake: ${:.2} | retries: {}",
        dispatch_config.probe_stake_cents as f64 / 100.0,
        dispatch_config.max_retries
    );

    let dry_run = dry_run_enabled();
    if dry_run {
        info!("   Mode: DRY RUN (set DRY_RUN=0 to place real bets)");
    } else {
        warn!("   Mode: LIVE PLACEMENT via {}", session_bridge_url());
    }
    let running_type = if dry_run { "DRY_RUN" } else { "REAL_MONEY" };

    // Shared state
    let repo = Arc::new(OddsRepository::new(RepositoryConfig::from_env()));
    let broadcaster = Arc::new(Broadcaster::new(repo.clone()));
    let focus = FocusFilter::default();
    if let Ok(event_id) = std::env::var("FOCUS_EVENT") {
        if !event_id.trim().is_empty() {
            focus.set(event_id.trim().into());
        }
    }

    let sessions = Arc::new(SessionRegistry::from_profiles(
        &std::env::var("SESSION_PROFILES").unwrap_or_else(|_| "primary".to_string()),
    ));
    info!("   Sessions: {} ready of {}", sessions.ready_sessions().len(), sessions.len());
    if sessions.ready_sessions().is_empty() {
        warn!("   ⚠️  No betting-enabled sessions configured (SESSION_PROFILES)");
    }

    let audit = create_audit_channel(&audit_config, running_type)
        .with_context(|| format!("opening audit log at {}", audit_config.db_path))?;
    info!("💾 Audit log: {} (keeping {} records)", audit_config.db_path, audit_config.retention);

    let placer: Arc<dyn BetPlacer> = if dry_run {
        Arc::new(DryRunPlacer::new())
    } else {
        Arc::new(
            HttpSessionBridge::new(session_bridge_url(), dispatch_config.placement_timeout)
                .context("building session bridge client")?,
        )
    };

    let locks = Arc::new(LockedRequestCache::new());
    let dispatcher = Arc::new(
        Dispatcher::new(repo.clone(), sessions.clone(), locks.clone(), placer, dispatch_config)
            .with_audit(Arc::new(audit.clone())),
    );

    // Feed → ingestion
    let (msg_tx, msg_rx) = mpsc::channel(FEED_MESSAGE_BUFFER);
    let auto_subscribe = feed_config.auto_subscribe_live;
    let (client, feed) = feed_channel(feed_config, msg_tx);
    let feed_handle = tokio::spawn(client.run_forever());

    let pipeline = Pipeline::new(repo.clone(), broadcaster.clone(), focus.clone()).with_feed(feed.clone(), auto_subscribe);
    let ingest_handle = tokio::spawn(run_ingestion(msg_rx, pipeline));

    // Dispatch
    let (dispatch_tx, dispatch_rx) = create_dispatch_channel();
    let dispatch_handle = tokio::spawn(run_dispatch_loop(dispatch_rx, dispatcher.clone()));

    // === TEST MODE: Synthetic dispatch injection ===
    // TEST_DISPATCH=1 to enable: probe then locked full stake on the first priced line
    if test_dispatch_enabled() {
        let test_repo = repo.clone();
        let test_dispatcher = dispatcher.clone();
        let test_tx = dispatch_tx.clone();

        tokio::spawn(async move {
            info!("[TEST] Injecting synthetic dispatch in 10 seconds...");
            tokio::time::sleep(Duration::from_secs(10)).await;

            let Some(line) = test_repo
                .events()
                .into_iter()
                .find_map(|e| test_repo.get_lines(&e.id).into_iter().find(|l| !l.suspended))
            else {
                warn!("[TEST] No priced lines yet, nothing to inject");
                return;
            };

            let probe = DispatchRequest {
                event_id: line.event_id.clone(),
                line_id: line.id.clone(),
                selection: line.selection.clone(),
                price: line.price,
                market: Some(line.market.clone()),
                param: line.param,
                stake_cents: test_dispatcher.config().probe_stake_cents,
                use_locked_path: false,
                fund_type: FundType::Cash,
            };
            warn!("[TEST] 🧪 Lock on {} / {} ({} @ {:+})", line.event_id, line.id, line.selection, line.price);
            let summary = match test_dispatcher.submit(probe.clone()).await {
                Ok(DispatchOutcome::Completed(summary)) => summary,
                Ok(DispatchOutcome::Pending(handle)) => {
                    info!("[TEST]    Lock still running after the caller budget, waiting");
                    match handle.await {
                        Ok(summary) => summary,
                        Err(e) => {
                            error!("[TEST] Lock task failed: {}", e);
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("[TEST] Lock failed: {}", e);
                    return;
                }
            };
            if !summary.any_armed {
                warn!("[TEST] Lock failed on every session, skipping full stake");
                return;
            }

            let full = DispatchRequest { stake_cents: 1_000, use_locked_path: true, ..probe };
            warn!("[TEST]    Load: $10.00 on the locked path (DRY_RUN={})", dry_run);
            if let Err(e) = test_tx.send(full).await {
                error!("[TEST] Failed to send synthetic dispatch: {}", e);
            }
        });
    }

    // System health monitoring
    let hb_repo = repo.clone();
    let hb_bcast = broadcaster.clone();
    let hb_feed = feed.clone();
    let hb_audit = audit.clone();
    let hb_locks = locks.clone();
    let hb_focus = focus.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let odds = hb_repo.stats();
            let feed = hb_feed.stats();
            let totals = hb_audit.totals();

            info!(
                "💓 Relay heartbeat | events={} lines={} rejected={} orphaned={} | frames={} decoded={} errors={} reconnects={}",
                odds.events,
                odds.lines,
                odds.rejected,
                odds.orphaned,
                feed.frames.load(Ordering::Relaxed),
                feed.decoded.load(Ordering::Relaxed),
                feed.decode_errors.load(Ordering::Relaxed),
                feed.sessions.load(Ordering::Relaxed).saturating_sub(1),
            );
            info!(
                "   consumers={} dropped={} | locks={} | bets: {} attempts, {} pending, ${:.2} wagered{}",
                hb_bcast.consumer_count(),
                hb_bcast.dropped(),
                hb_locks.len(),
                totals.attempts,
                totals.pending,
                totals.wagered_cents as f64 / 100.0,
                hb_focus.current().map(|e| format!(" | focus={}", e)).unwrap_or_default(),
            );
            if feed.frames.load(Ordering::Relaxed) == 0 {
                warn!("   ⚠️  No frames received yet - verify feed credentials");
            }
        }
    });

    info!("✅ All systems operational - entering main event loop");
    let _ = tokio::join!(feed_handle, ingest_handle, dispatch_handle, heartbeat_handle);

    audit.flush();
    audit.shutdown();
    Ok(())
}
