//! Hedger (spec §4.6): consumes canonical Fills on a PRIMARY leg, computes
//! and places the offsetting HEDGE leg(s), and records the resulting
//! `Trade` row.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::domain::{Fill, Incident, Level, MarketPair, Order, OrderRole, OrderStatus, OrderType, Side, Trade};
use crate::errors::{incident_code, Severity};
use crate::order_manager::{OrderManager, PlaceRequest};
use crate::persistence::PersistenceGateway;
use crate::risk::AccountState;
use crate::spread::{max_size_within_slippage, walk_book, FillEstimate};
use crate::venue::VenueAdapter;

#[derive(Debug, Clone)]
pub struct HedgerConfig {
    pub hedge_ratio: f64,
    pub lot_step: f64,
    pub max_slippage: f64,
    pub allow_partial_hedge: bool,
    pub multi_leg_enabled: bool,
    /// Fractions of hedge_size per child leg, used only when
    /// `multi_leg_enabled`. Must sum to <= 1.0.
    pub leg_fractions: Vec<f64>,
    pub hedge_max_retries: u32,
    /// Taker fee rates (fraction of notional) on the entry and hedge legs,
    /// the same values fed to `spread::net_spread` at decision time — kept
    /// consistent here so a recorded `Trade`'s `estimated_pnl` matches what
    /// the Spread Analyzer projected before the trade was ever placed.
    pub entry_fee_rate: f64,
    pub hedge_fee_rate: f64,
}

impl Default for HedgerConfig {
    fn default() -> Self {
        Self {
            hedge_ratio: 1.0,
            lot_step: 0.01,
            max_slippage: 0.02,
            allow_partial_hedge: false,
            multi_leg_enabled: false,
            leg_fractions: vec![1.0],
            hedge_max_retries: 2,
            entry_fee_rate: 0.01,
            hedge_fee_rate: 0.01,
        }
    }
}

pub struct Hedger {
    order_manager: Arc<OrderManager>,
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    persistence: Arc<PersistenceGateway>,
    config: HedgerConfig,
    fill_locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Hedger {
    pub fn new(
        order_manager: Arc<OrderManager>,
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        persistence: Arc<PersistenceGateway>,
        config: HedgerConfig,
    ) -> Self {
        Self { order_manager, venues, persistence, config, fill_locks: parking_lot::Mutex::new(HashMap::new()) }
    }

    fn floor_to_lot(size: f64, lot_step: f64) -> f64 {
        if lot_step <= 0.0 {
            return size;
        }
        (size / lot_step).floor() * lot_step
    }

    fn lock_for(&self, fill_key: &str) -> Arc<AsyncMutex<()>> {
        self.fill_locks
            .lock()
            .entry(fill_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Entry point: a canonical Fill on a PRIMARY leg arrived. At-most-once
    /// is enforced by a per-fill lock keyed by the fill's stable display
    /// id; a duplicate delivery that reaches here (reconciler bug, replay
    /// after cold start) finds the lock held or the work already done and
    /// is ignored.
    pub async fn process_fill(
        &self,
        fill: Fill,
        entry_order: &Order,
        pair: &MarketPair,
        account_state: AccountState,
    ) -> anyhow::Result<()> {
        let fill_key = fill.display_id();
        let lock = self.lock_for(&fill_key);
        let _guard = lock.lock().await;

        let hedge_size = Self::floor_to_lot(fill.size * self.config.hedge_ratio, self.config.lot_step);
        if hedge_size <= 0.0 {
            return Ok(());
        }

        let Some(hedge_adapter) = self.venues.get(&pair.secondary_venue).cloned() else {
            return Err(anyhow::anyhow!("no venue adapter for {}", pair.secondary_venue));
        };
        let hedge_side = entry_order.side.opposite();
        let hedge_market = pair.secondary_market().to_string();

        let book = hedge_adapter.fetch_book(&hedge_market).await?;
        let reference_price = match hedge_side {
            Side::Buy => book.best_ask().map(|l| l.price),
            Side::Sell => book.best_bid().map(|l| l.price),
        };
        let Some(reference_price) = reference_price else {
            warn!(pair_id = %pair.pair_id, "no reference price available on secondary book, aborting hedge");
            self.record_incident(incident_code::HEDGE_SLIPPAGE_ABORT, "no secondary book quote", pair).await?;
            return Ok(());
        };

        let executable = max_size_within_slippage(hedge_side, &book, reference_price, self.config.max_slippage);
        let final_size = if executable < hedge_size {
            if !self.config.allow_partial_hedge {
                warn!(pair_id = %pair.pair_id, requested = hedge_size, executable, "hedge slippage abort");
                self.record_incident(
                    incident_code::HEDGE_SLIPPAGE_ABORT,
                    &format!("requested {hedge_size}, only {executable} executable within slippage cap"),
                    pair,
                )
                .await?;
                return Ok(());
            }
            executable
        } else {
            hedge_size
        };

        if final_size <= 0.0 {
            return Ok(());
        }

        let leg_sizes = self.split_legs(final_size);
        let account_id = pair.account_for(&pair.secondary_venue).to_string();
        let mut filled_total = 0.0;
        let mut weighted_price_sum = 0.0;
        let mut last_hedge_order_id = String::new();

        // IOC/market orders execute immediately, so the Venue Adapter's
        // synchronous `place` ack carries no fill of its own (InMemoryVenue
        // never produces unsolicited fills, and a real IOC ack doesn't
        // either). Model the instant execution ourselves by walking the
        // same secondary ladder already fetched above, consuming it leg by
        // leg, and feeding the result back through the FSM via `on_fill` so
        // `filled_size` and the eventual Trade row reflect what actually
        // executed.
        let mut local_levels: Vec<Level> = match hedge_side {
            Side::Buy => book.asks.clone(),
            Side::Sell => book.bids.clone(),
        };

        for leg_size in leg_sizes {
            let mut remaining = leg_size;
            let mut retries = 0;
            let mut leg_order_id = String::new();
            while remaining > 0.0 && retries <= self.config.hedge_max_retries {
                let req = PlaceRequest {
                    pair_id: pair.pair_id.clone(),
                    venue: pair.secondary_venue.clone(),
                    account_id: account_id.clone(),
                    market_id: hedge_market.clone(),
                    side: hedge_side,
                    order_type: OrderType::Ioc,
                    price: None,
                    size: remaining,
                    role: OrderRole::Hedge,
                    parent_fill_id: fill.fill_id.clone().or_else(|| Some(fill_key.clone())),
                };
                let client_order_id = self.order_manager.place(req, account_state.clone()).await?;
                last_hedge_order_id = client_order_id.clone();
                leg_order_id = client_order_id.clone();

                let Some(placed) = self.order_manager.get_order(&client_order_id).await else {
                    break;
                };
                if placed.status != OrderStatus::Live {
                    // Rejected at placement (risk deny, venue rejection):
                    // nothing executed, no point retrying this leg.
                    break;
                }

                let Some(leg_fill) = Self::consume_ladder(&mut local_levels, remaining) else {
                    break; // no liquidity left on the secondary ladder
                };
                self.order_manager.on_fill(&client_order_id, leg_fill.filled_size).await?;
                let order_after_fill = self.order_manager.get_order(&client_order_id).await;

                filled_total += leg_fill.filled_size;
                weighted_price_sum += leg_fill.filled_size * leg_fill.avg_price;
                remaining = (remaining - leg_fill.filled_size).max(0.0);

                let filled_completely = order_after_fill.map(|o| o.status == OrderStatus::Filled).unwrap_or(false);
                if filled_completely || leg_fill.filled_size <= 0.0 {
                    break;
                }
                retries += 1;
            }

            if remaining > 0.0 {
                warn!(pair_id = %pair.pair_id, remaining, "hedge leg under-filled after retries");
                self.record_incident(
                    incident_code::HEDGE_UNDERSIZED,
                    &format!("leg short by {remaining} after {retries} retries"),
                    pair,
                )
                .await?;
                // An IOC that didn't fully fill cancels its own remainder;
                // don't leave it sitting LIVE forever.
                if !leg_order_id.is_empty() {
                    self.order_manager.cancel(&leg_order_id).await?;
                }
            }
        }

        if filled_total <= 0.0 {
            return Ok(());
        }

        let hedge_avg_price = weighted_price_sum / filled_total;
        let matched_size = filled_total.min(entry_order.filled_size);
        let entry_price = entry_order.price.unwrap_or(hedge_avg_price);
        // Same fee-aware formula as spread::net_spread, in absolute terms
        // rather than normalized: spec §8's worked example is
        // "(0.48 - 0.42) x 100 - fees".
        let fees_estimate = (entry_price * self.config.entry_fee_rate + hedge_avg_price * self.config.hedge_fee_rate) * matched_size;
        let gross_pnl = match entry_order.side {
            Side::Buy => (hedge_avg_price - entry_price) * matched_size,
            Side::Sell => (entry_price - hedge_avg_price) * matched_size,
        };
        let estimated_pnl = gross_pnl - fees_estimate;

        let trade = Trade {
            id: None,
            entry_order_id: entry_order.client_order_id.clone(),
            hedge_order_id: last_hedge_order_id,
            entry_venue: entry_order.venue.clone(),
            hedge_venue: pair.secondary_venue.clone(),
            matched_size,
            entry_price: entry_order.price.unwrap_or(0.0),
            hedge_price: hedge_avg_price,
            fees_estimate,
            estimated_pnl,
            created_at: Utc::now(),
        };
        self.persistence.insert_trade(&trade).await?;
        info!(pair_id = %pair.pair_id, matched_size, estimated_pnl, "trade recorded");

        Ok(())
    }

    /// Walks `levels` for `size` (via `walk_book`) then deducts the filled
    /// amount from the front of the ladder in place, so a second call for
    /// the next leg sees the depleted book rather than the original depth.
    fn consume_ladder(levels: &mut Vec<Level>, size: f64) -> Option<FillEstimate> {
        let estimate = walk_book(levels, size)?;
        let mut remaining = estimate.filled_size;
        let mut drained = 0;
        for level in levels.iter_mut() {
            if remaining <= 0.0 {
                break;
            }
            let take = level.size.min(remaining);
            level.size -= take;
            remaining -= take;
            if level.size <= 0.0 {
                drained += 1;
            }
        }
        levels.drain(0..drained);
        Some(estimate)
    }

    fn split_legs(&self, total_size: f64) -> Vec<f64> {
        if !self.config.multi_leg_enabled || self.config.leg_fractions.is_empty() {
            return vec![total_size];
        }
        self.config
            .leg_fractions
            .iter()
            .map(|frac| total_size * frac)
            .filter(|s| *s > 0.0)
            .collect()
    }

    async fn record_incident(&self, code: &str, message: &str, pair: &MarketPair) -> anyhow::Result<()> {
        self.persistence
            .record_incident(&Incident {
                id: None,
                severity: Severity::Warning,
                code: code.to_string(),
                message: message.to_string(),
                details: None,
                pair_id: Some(pair.pair_id.clone()),
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}
