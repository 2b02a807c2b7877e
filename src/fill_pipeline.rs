//! Fill pipeline (spec §2 data flow: "Venue Adapters -> Reconciler (fill
//! events) -> Hedger -> Order Manager -> Trade persistence").
//!
//! The Reconciler only dedupes and canonicalizes; this module is the thin
//! orchestration layer that takes a canonical Fill and routes it onward —
//! first to the Order Manager's FSM (and, transitively, the Double-Limit
//! sibling-cancel), then to the Hedger when the filled order is a PRIMARY
//! leg. Kept separate from `reconciler` itself so the Reconciler stays a
//! pure dedup engine, testable without a Hedger or Order Manager in scope.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::domain::{MarketPair, OrderRole};
use crate::hedger::Hedger;
use crate::order_manager::OrderManager;
use crate::reconciler::{RawFillEvent, Reconciler};
use crate::risk::AccountState;
use crate::venue::{OpenOrder, VenueAdapter};

pub struct FillPipeline {
    reconciler: Arc<Reconciler>,
    order_manager: Arc<OrderManager>,
    hedger: Arc<Hedger>,
}

impl FillPipeline {
    pub fn new(reconciler: Arc<Reconciler>, order_manager: Arc<OrderManager>, hedger: Arc<Hedger>) -> Self {
        Self { reconciler, order_manager, hedger }
    }

    /// Ingests one raw fill notification (push or pull). On a new
    /// canonical Fill, applies it to the Order Manager's FSM and, only for
    /// PRIMARY-role orders, hands it to the Hedger. Hedge-leg fills are
    /// still routed through the FSM here but never re-hedged.
    pub async fn handle_raw_event(
        &self,
        event: RawFillEvent,
        pair: &MarketPair,
        account_state: AccountState,
    ) -> anyhow::Result<()> {
        let Some(fill) = self.reconciler.ingest(event).await? else {
            return Ok(());
        };

        self.order_manager.on_fill(&fill.client_order_id, fill.size).await?;

        let Some(order) = self.order_manager.get_order(&fill.client_order_id).await else {
            return Ok(());
        };
        if order.role != OrderRole::Primary {
            return Ok(());
        }

        self.hedger.process_fill(fill, &order, pair, account_state).await
    }

    /// REST-poll path (spec §4.5 "pull"): fetches `account_id`'s open
    /// orders on `venue`, diffs each against the order's own last-known
    /// `filled_size`, and routes any resulting delta through
    /// `handle_raw_event`. Call periodically from a supervisor tick — this
    /// method does not schedule itself.
    pub async fn poll_once(
        &self,
        adapter: &dyn VenueAdapter,
        venue: &str,
        account_id: &str,
        pair: &MarketPair,
        account_state: AccountState,
    ) -> anyhow::Result<()> {
        let open: Vec<OpenOrder> = adapter.fetch_open_orders(account_id).await?;
        for entry in open {
            let Some(order) = self.order_manager.get_order(&entry.client_order_id).await else {
                continue;
            };
            if order.status.is_terminal() {
                continue;
            }

            self.reconciler.track_order(&order.client_order_id, order.requested_size);
            let event = RawFillEvent {
                venue: venue.to_string(),
                venue_order_id: entry.venue_order_id,
                client_order_id: entry.client_order_id,
                fill_id: None,
                side: order.side,
                price: order.price.unwrap_or(0.0),
                size_or_cumulative: entry.filled_size,
                is_cumulative_snapshot: true,
                ts: Utc::now(),
            };

            if let Err(err) = self.handle_raw_event(event, pair, account_state.clone()).await {
                warn!(%venue, %account_id, %err, "poll-path fill routing failed");
            }
        }
        Ok(())
    }

    /// Push path (spec §4.5 "push"): routes one websocket fill
    /// notification. The caller has already resolved `venue_order_id` to
    /// `client_order_id` (e.g. via `OrderManager::find_by_venue_order_id`).
    pub async fn handle_push_notification(
        &self,
        venue: &str,
        client_order_id: &str,
        venue_order_id: String,
        fill_id: Option<String>,
        side: crate::domain::Side,
        price: f64,
        size: f64,
        ts: chrono::DateTime<Utc>,
        pair: &MarketPair,
        account_state: AccountState,
    ) -> anyhow::Result<()> {
        if let Some(order) = self.order_manager.get_order(client_order_id).await {
            self.reconciler.track_order(client_order_id, order.requested_size);
        }
        let event = RawFillEvent {
            venue: venue.to_string(),
            venue_order_id,
            client_order_id: client_order_id.to_string(),
            fill_id,
            side,
            price,
            size_or_cumulative: size,
            is_cumulative_snapshot: false,
            ts,
        };
        self.handle_raw_event(event, pair, account_state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account_pool::AccountPool;
    use crate::domain::{Account, Level, OrderRole, OrderStatus, OrderType, OrderbookSnapshot, Side};
    use crate::hedger::HedgerConfig;
    use crate::order_manager::PlaceRequest;
    use crate::persistence::PersistenceGateway;
    use crate::risk::{RiskConfig, RiskManager};
    use crate::venue::InMemoryVenue;
    use std::collections::HashMap;

    fn account_state(account_id: &str) -> AccountState {
        AccountState {
            account_id: account_id.to_string(),
            cool_down_until: None,
            current_gross_exposure: 0.0,
            open_order_count_for_pair: 0,
            available_balance: 10_000.0,
            predicted_slippage: 0.0,
        }
    }

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

    async fn setup() -> (Arc<OrderManager>, FillPipeline, Arc<InMemoryVenue>, Arc<InMemoryVenue>, Arc<PersistenceGateway>) {
        let persistence = Arc::new(PersistenceGateway::open(":memory:").await.unwrap());
        let venue_a = InMemoryVenue::new("venue-a", false);
        let venue_b = InMemoryVenue::new("venue-b", false);
        venue_b.seed_book(OrderbookSnapshot {
            venue: "venue-b".into(),
            market_id: "mkt-b".into(),
            sequence: 1,
            bids: vec![Level { price: 0.48, size: 500.0 }],
            asks: vec![Level { price: 0.50, size: 500.0 }],
        });

        let mut venues: HashMap<String, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert("venue-a".into(), venue_a.clone() as Arc<dyn VenueAdapter>);
        venues.insert("venue-b".into(), venue_b.clone() as Arc<dyn VenueAdapter>);

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

        let order_manager = Arc::new(OrderManager::new(venues.clone(), persistence.clone(), risk, account_pool, false, false));
        let reconciler = Arc::new(Reconciler::new(persistence.clone(), 10, chrono::Duration::seconds(30)));
        let hedger = Arc::new(Hedger::new(order_manager.clone(), venues.clone(), persistence.clone(), HedgerConfig::default()));
        let pipeline = FillPipeline::new(reconciler, order_manager.clone(), hedger);

        (order_manager, pipeline, venue_a, venue_b, persistence)
    }

    #[tokio::test]
    async fn primary_fill_triggers_hedge_and_trade() {
        let (order_manager, pipeline, _venue_a, _venue_b, persistence) = setup().await;
        let pair = pair();

        let client_order_id = order_manager
            .place(
                PlaceRequest {
                    pair_id: pair.pair_id.clone(),
                    venue: "venue-a".into(),
                    account_id: "acct-a".into(),
                    market_id: "mkt-a".into(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    price: Some(0.42),
                    size: 100.0,
                    role: OrderRole::Primary,
                    parent_fill_id: None,
                },
                account_state("acct-a"),
            )
            .await
            .unwrap();

        let order = order_manager.get_order(&client_order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Live);

        let event = RawFillEvent {
            venue: "venue-a".into(),
            venue_order_id: order.venue_order_id.clone().unwrap(),
            client_order_id: client_order_id.clone(),
            fill_id: Some("f1".into()),
            side: Side::Buy,
            price: 0.42,
            size_or_cumulative: 100.0,
            is_cumulative_snapshot: false,
            ts: Utc::now(),
        };
        pipeline.handle_raw_event(event, &pair, account_state("acct-b")).await.unwrap();

        let order = order_manager.get_order(&client_order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);

        // A hedge leg should have been placed on the secondary venue.
        let hedge_order = order_manager.find_by_venue_order_id("venue-b", "venue-b-synthetic-1").await;
        assert!(hedge_order.is_some());
        assert_eq!(hedge_order.unwrap().role, OrderRole::Hedge);

        // The hedge leg's fill must have been recorded and a Trade row
        // persisted: entry @0.42, hedge fills @0.48 on 100 units.
        let trades = persistence.recent_trades(1).await.unwrap();
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert!((trade.matched_size - 100.0).abs() < 1e-9);
        // gross (0.48 - 0.42) * 100 = 6.0, fees (0.42*0.01 + 0.48*0.01) * 100 = 0.9
        assert!((trade.estimated_pnl - 5.1).abs() < 1e-9);
        assert!((trade.fees_estimate - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_push_fill_hedges_exactly_once() {
        let (order_manager, pipeline, _venue_a, venue_b, _persistence) = setup().await;
        let pair = pair();

        let client_order_id = order_manager
            .place(
                PlaceRequest {
                    pair_id: pair.pair_id.clone(),
                    venue: "venue-a".into(),
                    account_id: "acct-a".into(),
                    market_id: "mkt-a".into(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    price: Some(0.42),
                    size: 100.0,
                    role: OrderRole::Primary,
                    parent_fill_id: None,
                },
                account_state("acct-a"),
            )
            .await
            .unwrap();
        let order = order_manager.get_order(&client_order_id).await.unwrap();

        let make_event = || RawFillEvent {
            venue: "venue-a".into(),
            venue_order_id: order.venue_order_id.clone().unwrap(),
            client_order_id: client_order_id.clone(),
            fill_id: Some("f1".into()),
            side: Side::Buy,
            price: 0.42,
            size_or_cumulative: 100.0,
            is_cumulative_snapshot: false,
            ts: Utc::now(),
        };

        pipeline.handle_raw_event(make_event(), &pair, account_state("acct-b")).await.unwrap();
        pipeline.handle_raw_event(make_event(), &pair, account_state("acct-b")).await.unwrap();

        // Exactly one hedge leg placed on venue-b despite the duplicate.
        assert_eq!(venue_b.placed_orders().len(), 1);
    }
}
