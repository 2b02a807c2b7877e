//! Control surface: `/status`, `/health`, `/simulate`. All read-only;
//! neither mutates live state. Router construction follows the familiar
//! `Router::new().route(...).with_state(app_state)` shape plus a
//! permissive CORS layer and `TraceLayer`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domain::{MarketPair, Side, SimulatedRun};
use crate::pair_controller::PairController;
use crate::persistence::PersistenceGateway;
use crate::spread::{net_spread, walk_book};
use crate::venue::VenueAdapter;

pub struct AppState {
    pub started_at: Instant,
    pub pairs: HashMap<String, Arc<PairController>>,
    pub market_pairs: HashMap<String, MarketPair>,
    pub venues: HashMap<String, Arc<dyn VenueAdapter>>,
    pub persistence: Arc<PersistenceGateway>,
    pub entry_fee_rate: f64,
    pub hedge_fee_rate: f64,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/simulate/:pair_id/:size", get(simulate_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    pair_count: usize,
    open_orders: i64,
    pairs: Vec<PairStatus>,
}

#[derive(Serialize)]
struct PairStatus {
    pair_id: String,
    disabled: bool,
    open_orders: i64,
    last_fill_at: Option<chrono::DateTime<Utc>>,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut pairs = Vec::with_capacity(state.pairs.len());
    for pc in state.pairs.values() {
        let pair_id = pc.pair_id().to_string();
        let open_orders = state.persistence.count_live_orders_for_pair(&pair_id).await.unwrap_or(0);
        let last_fill_at = state.persistence.last_fill_time_for_pair(&pair_id).await.unwrap_or(None);
        pairs.push(PairStatus {
            pair_id,
            disabled: pc.disabled.load(std::sync::atomic::Ordering::SeqCst),
            open_orders,
            last_fill_at,
        });
    }

    Json(StatusResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        pair_count: pairs.len(),
        open_orders: state.persistence.count_live_orders().await.unwrap_or(0),
        pairs,
    })
}

#[derive(Serialize)]
struct HealthPairResult {
    pair_id: String,
    ok: bool,
    net_spread: Option<f64>,
}

#[derive(Serialize)]
struct HealthResponse {
    pairs: Vec<HealthPairResult>,
}

const CANONICAL_HEALTH_SIZE: f64 = 100.0;

/// For each enabled pair, fetches both books in parallel, computes net
/// spread at a canonical size, returns OK/FAIL per pair. Never places.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let fetches = state.market_pairs.values().map(|pair| fetch_pair_spread(&state, pair));
    let results = futures_util::future::join_all(fetches).await;
    Json(HealthResponse { pairs: results })
}

async fn fetch_pair_spread(state: &AppState, pair: &MarketPair) -> HealthPairResult {
    let primary = state.venues.get(&pair.primary_venue).cloned();
    let secondary = state.venues.get(&pair.secondary_venue).cloned();

    let (Some(primary), Some(secondary)) = (primary, secondary) else {
        return HealthPairResult { pair_id: pair.pair_id.clone(), ok: false, net_spread: None };
    };

    let books = tokio::join!(primary.fetch_book(pair.primary_market()), secondary.fetch_book(pair.secondary_market()));
    let (Ok(primary_book), Ok(secondary_book)) = books else {
        return HealthPairResult { pair_id: pair.pair_id.clone(), ok: false, net_spread: None };
    };

    let spread = net_spread(
        Side::Buy,
        &primary_book,
        state.entry_fee_rate,
        &secondary_book,
        state.hedge_fee_rate,
        CANONICAL_HEALTH_SIZE,
    );

    HealthPairResult { pair_id: pair.pair_id.clone(), ok: spread.is_some(), net_spread: spread }
}

async fn simulate_handler(
    State(state): State<Arc<AppState>>,
    Path((pair_id, size)): Path<(String, f64)>,
) -> impl IntoResponse {
    let Some(pair) = state.market_pairs.get(&pair_id) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown pair"}))).into_response();
    };
    let (Some(primary), Some(secondary)) =
        (state.venues.get(&pair.primary_venue).cloned(), state.venues.get(&pair.secondary_venue).cloned())
    else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "no venue adapter"}))).into_response();
    };

    let (primary_book, secondary_book) =
        match tokio::join!(primary.fetch_book(pair.primary_market()), secondary.fetch_book(pair.secondary_market())) {
            (Ok(p), Ok(s)) => (p, s),
            _ => return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "book unavailable"}))).into_response(),
        };

    match run_simulation(
        &state.persistence,
        &pair_id,
        size,
        &primary_book,
        state.entry_fee_rate,
        &secondary_book,
        state.hedge_fee_rate,
    )
    .await
    {
        Ok(run) => (
            StatusCode::OK,
            Json(SimulateResponse { pair_id, size, expected_pnl: run.expected_pnl, plan: run.plan }),
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.to_string()}))).into_response(),
    }
}

#[derive(Serialize)]
struct SimulateResponse {
    pair_id: String,
    size: f64,
    expected_pnl: f64,
    plan: serde_json::Value,
}

/// Builds the full order plan (primary leg + would-be hedge legs) from the
/// current secondary book, estimates expected net pnl, persists a
/// `SimulatedRun` row. Never places, regardless of `dry_run` (§4.8).
pub async fn run_simulation(
    persistence: &PersistenceGateway,
    pair_id: &str,
    size: f64,
    entry_book: &crate::domain::OrderbookSnapshot,
    entry_fee_rate: f64,
    hedge_book: &crate::domain::OrderbookSnapshot,
    hedge_fee_rate: f64,
) -> anyhow::Result<SimulatedRun> {
    let entry_fill = walk_book(&entry_book.asks, size);
    let hedge_fill = walk_book(&hedge_book.bids, size);
    // net_spread is normalized by the entry fill's avg price, so scale back
    // up by notional (avg_price * size) to get an absolute pnl estimate.
    let expected_pnl = match (net_spread(Side::Buy, entry_book, entry_fee_rate, hedge_book, hedge_fee_rate, size), entry_fill) {
        (Some(spread), Some(entry_fill)) => spread * entry_fill.avg_price * size,
        _ => 0.0,
    };

    let plan = json!({
        "entry_leg": {
            "venue": entry_book.venue,
            "market_id": entry_book.market_id,
            "side": "buy",
            "fill_estimate": entry_fill.map(|f| json!({"filled_size": f.filled_size, "avg_price": f.avg_price})),
        },
        "hedge_leg": {
            "venue": hedge_book.venue,
            "market_id": hedge_book.market_id,
            "side": "sell",
            "fill_estimate": hedge_fill.map(|f| json!({"filled_size": f.filled_size, "avg_price": f.avg_price})),
        },
    });

    let run = SimulatedRun {
        id: None,
        pair_id: pair_id.to_string(),
        size,
        plan,
        expected_pnl,
        notes: "generated by /simulate control endpoint".to_string(),
        created_at: Utc::now(),
    };

    let id = persistence.record_simulated_run(&run).await?;
    Ok(SimulatedRun { id: Some(id), ..run })
}
