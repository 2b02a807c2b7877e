//! Pair Controller (spec §4.7): the per-event control loop that evaluates
//! spreads, gates entries via Risk, and drives the Order Manager. Never
//! dispatches its own fills — those arrive via Reconciler -> Hedger,
//! independent of this loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::domain::{Incident, MarketPair, OrderRole, OrderStatus, OrderType, Side};
use crate::errors::{incident_code, Severity};
use crate::order_manager::{OrderManager, PlaceRequest};
use crate::persistence::PersistenceGateway;
use crate::risk::AccountState;
use crate::spread::net_spread;
use crate::venue::VenueAdapter;

#[derive(Debug, Clone)]
pub struct PairControllerConfig {
    pub notional: f64,
    pub min_spread_for_entry: f64,
    pub cancel_spread: f64,
    pub max_order_age: chrono::Duration,
    pub double_limit_enabled: bool,
    pub entry_fee_rate: f64,
    pub hedge_fee_rate: f64,
}

/// Tracks the currently-live PRIMARY order for a pair, if any, so the tick
/// can decide between entry and cancel without re-deriving it from the
/// Order Manager's full order set every time.
struct PairRuntimeState {
    live_primary_client_order_id: Option<String>,
    live_primary_opened_at: Option<chrono::DateTime<Utc>>,
}

pub struct PairController {
    pair: MarketPair,
    config: PairControllerConfig,
    order_manager: Arc<OrderManager>,
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    persistence: Arc<PersistenceGateway>,
    state: AsyncMutex<PairRuntimeState>,
    tick_in_flight: AtomicBool,
    pub disabled: AtomicBool,
}

impl PairController {
    pub fn new(
        pair: MarketPair,
        config: PairControllerConfig,
        order_manager: Arc<OrderManager>,
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        persistence: Arc<PersistenceGateway>,
    ) -> Self {
        Self {
            pair,
            config,
            order_manager,
            venues,
            persistence,
            state: AsyncMutex::new(PairRuntimeState { live_primary_client_order_id: None, live_primary_opened_at: None }),
            tick_in_flight: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
        }
    }

    /// Records a CRITICAL incident and disables the pair (spec §7(c):
    /// "Invariant violation ... pair disabled"). Once disabled a pair never
    /// re-enables itself — a corrupt book needs an operator to look at it.
    async fn disable(&self, reason: &str) {
        error!(pair_id = %self.pair.pair_id, reason, "disabling pair after invariant violation");
        self.disabled.store(true, Ordering::SeqCst);
        let _ = self
            .persistence
            .record_incident(&Incident {
                id: None,
                severity: Severity::Critical,
                code: incident_code::INVARIANT_VIOLATION.to_string(),
                message: reason.to_string(),
                details: None,
                pair_id: Some(self.pair.pair_id.clone()),
                created_at: Utc::now(),
            })
            .await;
    }

    pub fn pair_id(&self) -> &str {
        &self.pair.pair_id
    }

    /// Runs one evaluation cycle. Reentrancy-safe: a tick overlapping its
    /// predecessor exits immediately rather than queuing.
    pub async fn tick(&self, account_state_fn: impl Fn(&str) -> AccountState) -> anyhow::Result<()> {
        if self.disabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self
            .tick_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(pair_id = %self.pair.pair_id, "tick overlapped predecessor, skipping");
            return Ok(());
        }
        let result = self.tick_inner(account_state_fn).await;
        self.tick_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn tick_inner(&self, account_state_fn: impl Fn(&str) -> AccountState) -> anyhow::Result<()> {
        let Some(primary_adapter) = self.venues.get(&self.pair.primary_venue).cloned() else {
            warn!(pair_id = %self.pair.pair_id, "no adapter for primary venue");
            return Ok(());
        };
        let Some(secondary_adapter) = self.venues.get(&self.pair.secondary_venue).cloned() else {
            warn!(pair_id = %self.pair.pair_id, "no adapter for secondary venue");
            return Ok(());
        };

        let primary_book = primary_adapter.fetch_book(self.pair.primary_market()).await?;
        let secondary_book = secondary_adapter.fetch_book(self.pair.secondary_market()).await?;

        if let Some(reason) = primary_book.invariant_violation().or_else(|| secondary_book.invariant_violation()) {
            self.disable(&reason).await;
            return Ok(());
        }

        let entry_side = Side::Buy;
        let spread = net_spread(
            entry_side,
            &primary_book,
            self.config.entry_fee_rate,
            &secondary_book,
            self.config.hedge_fee_rate,
            self.config.notional,
        );

        let mut state = self.state.lock().await;

        if let Some(primary_id) = state.live_primary_client_order_id.clone() {
            let age_exceeded = state
                .live_primary_opened_at
                .map(|opened_at| Utc::now() - opened_at > self.config.max_order_age)
                .unwrap_or(false);
            let spread_collapsed = spread.map(|s| s < self.config.cancel_spread).unwrap_or(true);

            if age_exceeded || spread_collapsed {
                info!(pair_id = %self.pair.pair_id, age_exceeded, spread_collapsed, "cancelling primary");
                self.order_manager.cancel(&primary_id).await?;
                if let Some(order) = self.order_manager.get_order(&primary_id).await {
                    if order.status.is_terminal() {
                        state.live_primary_client_order_id = None;
                        state.live_primary_opened_at = None;
                    }
                }
            }
            return Ok(());
        }

        let Some(spread) = spread else {
            return Ok(());
        };
        if spread < self.config.min_spread_for_entry {
            return Ok(());
        }

        let price = primary_book.best_ask().map(|l| l.price);
        let Some(price) = price else {
            return Ok(());
        };

        let account_id = self.pair.account_for(&self.pair.primary_venue).to_string();
        let req = PlaceRequest {
            pair_id: self.pair.pair_id.clone(),
            venue: self.pair.primary_venue.clone(),
            account_id: account_id.clone(),
            market_id: self.pair.primary_market().to_string(),
            side: entry_side,
            order_type: OrderType::Limit,
            price: Some(price),
            size: self.config.notional,
            role: OrderRole::Primary,
            parent_fill_id: None,
        };

        let account_state = account_state_fn(&account_id);
        let client_order_id = if self.config.double_limit_enabled {
            let sibling_account_id = self.pair.account_for(&self.pair.secondary_venue).to_string();
            let sibling_price = secondary_book.best_bid().map(|l| l.price).unwrap_or(price);
            let sibling_req = PlaceRequest {
                pair_id: self.pair.pair_id.clone(),
                venue: self.pair.secondary_venue.clone(),
                account_id: sibling_account_id.clone(),
                market_id: self.pair.secondary_market().to_string(),
                side: entry_side.opposite(),
                order_type: OrderType::Limit,
                price: Some(sibling_price),
                size: self.config.notional,
                role: OrderRole::DoubleB,
                parent_fill_id: None,
            };
            let sibling_account_state = account_state_fn(&sibling_account_id);
            let dl = self
                .order_manager
                .place_double_limit(&self.pair.pair_id, req, sibling_req, account_state, sibling_account_state)
                .await?;
            match dl.and_then(|dl| if dl.order_a_ref.is_empty() { None } else { Some(dl.order_a_ref) }) {
                Some(id) => id,
                None => return Ok(()),
            }
        } else {
            self.order_manager.place(req, account_state).await?
        };

        if let Some(order) = self.order_manager.get_order(&client_order_id).await {
            if order.status == OrderStatus::Live {
                state.live_primary_client_order_id = Some(client_order_id);
                state.live_primary_opened_at = Some(Utc::now());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account_pool::AccountPool;
    use crate::domain::{Account, Level, OrderbookSnapshot};
    use crate::persistence::PersistenceGateway;
    use crate::risk::{RiskConfig, RiskManager};
    use crate::venue::InMemoryVenue;

    fn pair() -> MarketPair {
        MarketPair {
            pair_id: "p1".into(),
            venue_a: "venue-a".into(),
            market_a: "mkt-a".into(),
            venue_b: "venue-b".into(),
            market_b: "mkt-b".into(),
            account_a_id: "acct-a".into(),
            account_b_id: "acct-b".into(),
            primary_venue: "venue-a".into(),
            secondary_venue: "venue-b".into(),
        }
    }

    fn config() -> PairControllerConfig {
        PairControllerConfig {
            notional: 100.0,
            min_spread_for_entry: 0.02,
            cancel_spread: 0.005,
            max_order_age: chrono::Duration::seconds(60),
            double_limit_enabled: false,
            entry_fee_rate: 0.0,
            hedge_fee_rate: 0.0,
        }
    }

    async fn controller(primary_book: OrderbookSnapshot, secondary_book: OrderbookSnapshot) -> PairController {
        let persistence = Arc::new(PersistenceGateway::open(":memory:").await.unwrap());
        let venue_a = InMemoryVenue::new("venue-a", false);
        let venue_b = InMemoryVenue::new("venue-b", false);
        venue_a.seed_book(primary_book);
        venue_b.seed_book(secondary_book);

        let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert("venue-a".into(), venue_a as Arc<dyn VenueAdapter>);
        venues.insert("venue-b".into(), venue_b as Arc<dyn VenueAdapter>);

        let accounts = vec![
            Account { id: "acct-a".into(), venue: "venue-a".into(), credentials: "x".into(), proxy: None, rate_limit_per_sec: 100.0, rate_limit_burst: 100 },
            Account { id: "acct-b".into(), venue: "venue-b".into(), credentials: "x".into(), proxy: None, rate_limit_per_sec: 100.0, rate_limit_burst: 100 },
        ];
        let account_pool = Arc::new(AccountPool::new(accounts));
        let risk = Arc::new(RiskManager::new(RiskConfig {
            exposure_cap: 100_000.0,
            open_order_cap: 10,
            safety_margin: 0.9,
            max_slippage: 0.1,
        }));
        let order_manager = Arc::new(OrderManager::new(venues.clone(), persistence.clone(), risk, account_pool, false, true));

        PairController::new(pair(), config(), order_manager, venues, persistence)
    }

    fn state(account_id: &str) -> AccountState {
        AccountState {
            account_id: account_id.to_string(),
            cool_down_until: None,
            current_gross_exposure: 0.0,
            open_order_count_for_pair: 0,
            available_balance: 10_000.0,
            predicted_slippage: 0.0,
        }
    }

    #[tokio::test]
    async fn wide_spread_places_a_primary_order() {
        let primary = OrderbookSnapshot {
            venue: "venue-a".into(),
            market_id: "mkt-a".into(),
            sequence: 1,
            bids: vec![Level { price: 0.40, size: 500.0 }],
            asks: vec![Level { price: 0.42, size: 500.0 }],
        };
        let secondary = OrderbookSnapshot {
            venue: "venue-b".into(),
            market_id: "mkt-b".into(),
            sequence: 1,
            bids: vec![Level { price: 0.48, size: 500.0 }],
            asks: vec![Level { price: 0.50, size: 500.0 }],
        };
        let pc = controller(primary, secondary).await;

        pc.tick(|id| state(id)).await.unwrap();

        let runtime_state = pc.state.lock().await;
        assert!(runtime_state.live_primary_client_order_id.is_some());
    }

    #[tokio::test]
    async fn narrow_spread_never_enters() {
        let primary = OrderbookSnapshot {
            venue: "venue-a".into(),
            market_id: "mkt-a".into(),
            sequence: 1,
            bids: vec![Level { price: 0.49, size: 500.0 }],
            asks: vec![Level { price: 0.50, size: 500.0 }],
        };
        let secondary = OrderbookSnapshot {
            venue: "venue-b".into(),
            market_id: "mkt-b".into(),
            sequence: 1,
            bids: vec![Level { price: 0.50, size: 500.0 }],
            asks: vec![Level { price: 0.51, size: 500.0 }],
        };
        let pc = controller(primary, secondary).await;

        pc.tick(|id| state(id)).await.unwrap();

        let runtime_state = pc.state.lock().await;
        assert!(runtime_state.live_primary_client_order_id.is_none());
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped_not_queued() {
        let primary = OrderbookSnapshot {
            venue: "venue-a".into(),
            market_id: "mkt-a".into(),
            sequence: 1,
            bids: vec![Level { price: 0.40, size: 500.0 }],
            asks: vec![Level { price: 0.42, size: 500.0 }],
        };
        let secondary = OrderbookSnapshot {
            venue: "venue-b".into(),
            market_id: "mkt-b".into(),
            sequence: 1,
            bids: vec![Level { price: 0.48, size: 500.0 }],
            asks: vec![Level { price: 0.50, size: 500.0 }],
        };
        let pc = controller(primary, secondary).await;
        pc.tick_in_flight.store(true, Ordering::SeqCst);

        pc.tick(|id| state(id)).await.unwrap();

        let runtime_state = pc.state.lock().await;
        assert!(runtime_state.live_primary_client_order_id.is_none());
    }

    #[tokio::test]
    async fn crossed_book_disables_the_pair() {
        let primary = OrderbookSnapshot {
            venue: "venue-a".into(),
            market_id: "mkt-a".into(),
            sequence: 1,
            bids: vec![Level { price: 0.52, size: 500.0 }],
            asks: vec![Level { price: 0.50, size: 500.0 }],
        };
        let secondary = OrderbookSnapshot {
            venue: "venue-b".into(),
            market_id: "mkt-b".into(),
            sequence: 1,
            bids: vec![Level { price: 0.48, size: 500.0 }],
            asks: vec![Level { price: 0.50, size: 500.0 }],
        };
        let pc = controller(primary, secondary).await;

        pc.tick(|id| state(id)).await.unwrap();

        assert!(pc.disabled.load(Ordering::SeqCst));
        let runtime_state = pc.state.lock().await;
        assert!(runtime_state.live_primary_client_order_id.is_none());
    }
}
