//! Root supervisor: wires the engine together and owns cancellation.
//!
//! `init_tracing()`, a `load_env()`/path-resolution helper anchored to
//! `CARGO_MANIFEST_DIR`, an `AppState` assembled once, a handful of
//! `tokio::spawn` background loops, and an axum server.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hedgebot_core::account_pool::AccountPool;
use hedgebot_core::api::{build_router, AppState};
use hedgebot_core::config::Config;
use hedgebot_core::domain::{Incident, MarketPair};
use hedgebot_core::errors::{incident_code, Severity};
use hedgebot_core::fill_pipeline::FillPipeline;
use hedgebot_core::hedger::{Hedger, HedgerConfig};
use hedgebot_core::order_manager::OrderManager;
use hedgebot_core::pair_controller::{PairController, PairControllerConfig};
use hedgebot_core::persistence::PersistenceGateway;
use hedgebot_core::reconciler::Reconciler;
use hedgebot_core::risk::{AccountState, RiskConfig, RiskManager};
use hedgebot_core::venue::{InMemoryVenue, VenueAdapter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}

fn resolve_config_path() -> String {
    std::env::var("HEDGEBOT_CONFIG").unwrap_or_else(|_| default_config_path())
}

fn default_config_path() -> String {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    format!("{manifest_dir}/hedgebot.toml")
}

/// Exit codes per spec §6: 0 clean shutdown; 2 configuration invalid;
/// 3 database unreachable at startup; 4 no accounts loaded; 5 no enabled
/// pairs.
#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config_path = resolve_config_path();
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, path = %config_path, "configuration invalid");
            return ExitCode::from(2);
        }
    };

    if config.accounts.is_empty() {
        error!("no accounts loaded");
        return ExitCode::from(4);
    }
    if config.market_pairs.is_empty() {
        error!("no enabled pairs configured");
        return ExitCode::from(5);
    }

    let persistence = match PersistenceGateway::open(&config.database.dsn).await {
        Ok(gateway) => Arc::new(gateway),
        Err(err) => {
            error!(%err, "database unreachable at startup");
            return ExitCode::from(3);
        }
    };

    match run(config, persistence).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal error during startup");
            ExitCode::from(2)
        }
    }
}

async fn run(config: Config, persistence: Arc<PersistenceGateway>) -> anyhow::Result<()> {
    for account in &config.accounts {
        persistence.upsert_account(account).await?;
    }
    for pair in &config.market_pairs {
        persistence.upsert_market_pair(pair).await?;
    }

    let account_pool = Arc::new(AccountPool::new(config.accounts.clone()));

    let risk = Arc::new(RiskManager::new(RiskConfig {
        exposure_cap: config.market_hedge_mode.exposure_cap,
        open_order_cap: 3,
        safety_margin: 0.9,
        max_slippage: config.market_hedge_mode.max_slippage,
    }));

    let mut venue_names: std::collections::HashSet<String> = std::collections::HashSet::new();
    for pair in &config.market_pairs {
        venue_names.insert(pair.venue_a.clone());
        venue_names.insert(pair.venue_b.clone());
    }
    let venues: HashMap<String, Arc<dyn VenueAdapter>> = venue_names
        .into_iter()
        .map(|name| {
            // Per spec §9 open question ("Polymarket relies on REST
            // polling"), adapters default to polling-only (no fill_id).
            let adapter = InMemoryVenue::new(name.clone(), false);
            (name, adapter as Arc<dyn VenueAdapter>)
        })
        .collect();

    let order_manager = Arc::new(OrderManager::new(
        venues.clone(),
        persistence.clone(),
        risk.clone(),
        account_pool.clone(),
        config.double_limit_enabled,
        config.dry_run,
    ));

    let reconciler = Arc::new(Reconciler::new(persistence.clone(), config.market_pairs.len() * 4, chrono::Duration::seconds(30)));

    // spec §1 "crash recovery": repopulate the Order Manager's order/
    // double-limit maps and the Reconciler's watermarks from what was
    // persisted before any tick or poll task starts, so a restart never
    // silently drops an order that was live when the process last exited.
    let restored_orders = persistence.load_non_terminal_orders().await?;
    let restored_double_limits = persistence.load_open_double_limits().await?;
    for order in &restored_orders {
        reconciler.rehydrate_watermark(&order.client_order_id, order.filled_size, order.requested_size);
    }
    if !restored_orders.is_empty() {
        info!(count = restored_orders.len(), "rehydrated non-terminal orders from persistence");
    }
    order_manager.rehydrate(restored_orders, restored_double_limits).await;

    // Shared by the Hedger's Trade recording and the Spread Analyzer's
    // entry-decision math (`PairControllerConfig`/`AppState` below), so a
    // recorded Trade's estimated_pnl is computed with the same fee rates
    // that decided the trade was worth entering in the first place.
    let entry_fee_rate = 0.01;
    let hedge_fee_rate = 0.01;

    let hedger = Arc::new(Hedger::new(
        order_manager.clone(),
        venues.clone(),
        persistence.clone(),
        HedgerConfig {
            hedge_ratio: config.market_hedge_mode.hedge_ratio,
            lot_step: 0.01,
            max_slippage: config.market_hedge_mode.max_slippage,
            allow_partial_hedge: config.allow_partial_hedge,
            multi_leg_enabled: config.multi_leg_enabled,
            leg_fractions: vec![1.0],
            hedge_max_retries: config.hedge_max_retries,
            entry_fee_rate,
            hedge_fee_rate,
        },
    ));
    let fill_pipeline = Arc::new(FillPipeline::new(reconciler.clone(), order_manager.clone(), hedger.clone()));

    let market_pairs: HashMap<String, MarketPair> =
        config.market_pairs.iter().map(|p| (p.pair_id.clone(), p.clone())).collect();

    let mut pair_controllers = HashMap::new();
    for pair in &config.market_pairs {
        let controller = Arc::new(PairController::new(
            pair.clone(),
            PairControllerConfig {
                notional: 100.0,
                min_spread_for_entry: config.market_hedge_mode.min_spread_for_entry,
                cancel_spread: config.market_hedge_mode.cancel_spread,
                max_order_age: config.max_order_age(),
                double_limit_enabled: config.double_limit_enabled,
                entry_fee_rate,
                hedge_fee_rate,
            },
            order_manager.clone(),
            venues.clone(),
            persistence.clone(),
        ));
        pair_controllers.insert(pair.pair_id.clone(), controller);
    }

    let app_state = Arc::new(AppState {
        started_at: Instant::now(),
        pairs: pair_controllers.clone(),
        market_pairs,
        venues: venues.clone(),
        persistence: persistence.clone(),
        entry_fee_rate,
        hedge_fee_rate,
    });

    let shutdown = new_shutdown_channel();

    let mut tick_handles = Vec::new();
    for controller in pair_controllers.values().cloned() {
        let account_pool = account_pool.clone();
        let poll_interval = config.poll_interval();
        let mut shutdown_rx = shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let account_pool = account_pool.clone();
                        let account_state_fn = move |account_id: &str| -> AccountState {
                            default_account_state(account_id, &account_pool)
                        };
                        if let Err(err) = controller.tick(account_state_fn).await {
                            warn!(pair_id = controller.pair_id(), %err, "pair controller tick failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(pair_id = controller.pair_id(), "pair controller shutting down");
                        break;
                    }
                }
            }
        });
        tick_handles.push(handle);
    }

    // One account is assigned to exactly one (venue, pair) (spec §3
    // `Account`), so this reverse index is unambiguous.
    let pair_for_account: HashMap<String, MarketPair> = config
        .market_pairs
        .iter()
        .flat_map(|p| [(p.account_a_id.clone(), p.clone()), (p.account_b_id.clone(), p.clone())])
        .collect();

    // One REST-poll task per pair (spec §5 "one task per (venue, account)
    // REST poller"): polls the primary account's open orders and routes
    // any newly observed fill through the Reconciler -> Hedger pipeline.
    for pair in config.market_pairs.iter().cloned() {
        let Some(adapter) = venues.get(&pair.primary_venue).cloned() else { continue };
        let fill_pipeline = fill_pipeline.clone();
        let account_pool = account_pool.clone();
        let poll_interval = poll_interval_for_venue(&config, &pair.primary_venue);
        let account_id = pair.account_for(&pair.primary_venue).to_string();
        let venue = pair.primary_venue.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let account_state = default_account_state(&account_id, &account_pool);
                        if let Err(err) = fill_pipeline.poll_once(adapter.as_ref(), &venue, &account_id, &pair, account_state).await {
                            warn!(pair_id = %pair.pair_id, %err, "fill poll failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        tick_handles.push(handle);
    }

    // One push-reader task per (venue, account) (spec §5): venues that
    // supply a push stream feed fills through the same pipeline the
    // moment they arrive, independent of the poll cadence above.
    for (account_id, pair) in pair_for_account.iter() {
        let venue = if pair.account_a_id == *account_id { pair.venue_a.clone() } else { pair.venue_b.clone() };
        if !venue_uses_websocket(&config, &venue) {
            continue;
        }
        let Some(adapter) = venues.get(&venue).cloned() else { continue };
        let fill_pipeline = fill_pipeline.clone();
        let order_manager = order_manager.clone();
        let account_pool = account_pool.clone();
        let account_id = account_id.clone();
        let pair = pair.clone();
        let mut shutdown_rx = shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut rx = match adapter.subscribe_fills(&account_id).await {
                Ok(rx) => rx,
                Err(err) => {
                    warn!(%venue, %account_id, %err, "could not subscribe to push fills");
                    return;
                }
            };
            loop {
                tokio::select! {
                    notif = rx.recv() => {
                        let Ok(notif) = notif else { continue };
                        let Some(order) = order_manager.find_by_venue_order_id(&venue, &notif.venue_order_id).await else {
                            continue;
                        };
                        let account_state = default_account_state(&account_id, &account_pool);
                        if let Err(err) = fill_pipeline
                            .handle_push_notification(
                                &venue,
                                &order.client_order_id,
                                notif.venue_order_id,
                                notif.fill_id,
                                notif.side,
                                notif.price,
                                notif.size,
                                notif.ts,
                                &pair,
                                account_state,
                            )
                            .await
                        {
                            warn!(%venue, %account_id, %err, "push-path fill routing failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        tick_handles.push(handle);
    }

    let reconciler_handle = {
        let reconciler = reconciler.clone();
        let order_manager = order_manager.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let open_ids = order_manager.live_order_ids().await;
                        if let Err(err) = reconciler.check_stale_sources(&open_ids).await {
                            warn!(%err, "stale-source check failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    };

    let app = build_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.control_bind).await?;
    info!(bind = %config.control_bind, "control surface listening");

    let mut shutdown_rx = shutdown.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_rx.recv().await.ok();
    });

    tokio::select! {
        result = server => {
            if let Err(err) = result {
                error!(%err, "control surface server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            shutdown.send(()).ok();
        }
    }

    for handle in tick_handles {
        if let Err(err) = handle.await {
            warn!(%err, "pair controller task join error");
        }
    }
    if let Err(err) = reconciler_handle.await {
        warn!(%err, "reconciler task join error");
    }

    // spec §5: placements still in flight when shutdown begins get one
    // best-effort cancel; anything that can't be confirmed cancelled is
    // recorded as a SHUTDOWN_INFLIGHT incident rather than silently dropped.
    for client_order_id in order_manager.live_order_ids().await {
        let confirmed = match order_manager.cancel(&client_order_id).await {
            Ok(()) => order_manager
                .get_order(&client_order_id)
                .await
                .map(|o| o.status.is_terminal())
                .unwrap_or(false),
            Err(_) => false,
        };
        if !confirmed {
            warn!(%client_order_id, "in-flight order not confirmed cancelled at shutdown");
            let _ = persistence
                .record_incident(&Incident {
                    id: None,
                    severity: Severity::Warning,
                    code: incident_code::SHUTDOWN_INFLIGHT.to_string(),
                    message: format!("order {client_order_id} not confirmed cancelled at shutdown"),
                    details: None,
                    pair_id: None,
                    created_at: chrono::Utc::now(),
                })
                .await;
        }
    }

    info!("clean shutdown");
    Ok(())
}

/// `connectivity[venue].poll_interval_ms` overrides the global poll cadence
/// for that venue (spec §6 `connectivity[venue].{use_websocket, poll_interval}`).
fn poll_interval_for_venue(config: &Config, venue: &str) -> std::time::Duration {
    config
        .connectivity
        .get(venue)
        .map(|c| std::time::Duration::from_millis(c.poll_interval_ms))
        .unwrap_or_else(|| config.poll_interval())
}

/// Venues default to push (websocket) delivery; `connectivity[venue]`
/// can opt a venue out so it's served by REST polling alone.
fn venue_uses_websocket(config: &Config, venue: &str) -> bool {
    config.connectivity.get(venue).map(|c| c.use_websocket).unwrap_or(true)
}

fn default_account_state(account_id: &str, account_pool: &AccountPool) -> AccountState {
    let account = account_pool.get(account_id);
    AccountState {
        account_id: account_id.to_string(),
        cool_down_until: None,
        current_gross_exposure: 0.0,
        open_order_count_for_pair: 0,
        available_balance: account.map(|_| 10_000.0).unwrap_or(0.0),
        predicted_slippage: 0.0,
    }
}

fn new_shutdown_channel() -> tokio::sync::broadcast::Sender<()> {
    let (tx, _rx) = tokio::sync::broadcast::channel(1);
    tx
}
