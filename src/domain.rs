//! Core data model (spec §3).
//!
//! Plain value types shared across every subsystem. Nothing here owns I/O;
//! persistence lives in `persistence`, mutation rules live in `fsm`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", match self { Side::Buy => "BUY", Side::Sell => "SELL" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
    Ioc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    Primary,
    Hedge,
    DoubleA,
    DoubleB,
}

/// An account credentialed against one venue, usable for exactly one
/// (venue, pair) assignment (spec §3 `Account`). Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub venue: String,
    /// Opaque to the engine; concrete adapters interpret this.
    pub credentials: String,
    pub proxy: Option<String>,
    /// Tokens issued per second to this account's rate limiter.
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: u32,
}

/// A configured hedging event: one primary leg, one secondary leg (spec §3
/// `MarketPair`). Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPair {
    pub pair_id: String,
    pub venue_a: String,
    pub market_a: String,
    pub venue_b: String,
    pub market_b: String,
    pub account_a_id: String,
    pub account_b_id: String,
    /// Venue that carries the resting PRIMARY limit order.
    pub primary_venue: String,
    /// Venue that receives the offsetting HEDGE order.
    pub secondary_venue: String,
}

impl MarketPair {
    pub fn primary_market(&self) -> &str {
        if self.primary_venue == self.venue_a { &self.market_a } else { &self.market_b }
    }

    pub fn secondary_market(&self) -> &str {
        if self.secondary_venue == self.venue_a { &self.market_a } else { &self.market_b }
    }

    pub fn account_for(&self, venue: &str) -> &str {
        if venue == self.venue_a { &self.account_a_id } else { &self.account_b_id }
    }
}

/// A single price/size level in an orderbook ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: f64,
    pub size: f64,
}

/// Top-of-book + depth ladder for one venue/market at one point in time
/// (spec §3 `OrderbookSnapshot`). Invariant: best_bid < best_ask when both
/// sides present; each ladder sorted (bids desc, asks asc) with positive
/// sizes. Passive value type — never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub venue: String,
    pub market_id: String,
    pub sequence: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl OrderbookSnapshot {
    pub fn best_bid(&self) -> Option<Level> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first().copied()
    }

    /// Merges levels that share a price (should not occur per invariant,
    /// but the analyzer tolerates it — spec §4.1 tie-break rule).
    pub fn normalized(mut self) -> Self {
        self.bids = merge_same_price(self.bids, true);
        self.asks = merge_same_price(self.asks, false);
        self
    }

    /// Checks the invariants spec §3 declares for this type: ladders sorted
    /// best-first with strictly positive sizes, and `best_bid < best_ask`
    /// when both sides are present. Returns a description of the first
    /// violation found, or `None` if the snapshot is well-formed. A
    /// violation is an "Invariant violation" per spec §7(c): the caller
    /// disables the affected pair rather than trading against a corrupt book.
    pub fn invariant_violation(&self) -> Option<String> {
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid.price >= ask.price {
                return Some(format!("crossed book: best_bid {} >= best_ask {}", bid.price, ask.price));
            }
        }
        if !is_sorted_desc(&self.bids) {
            return Some("bid ladder not sorted descending".to_string());
        }
        if !is_sorted_asc(&self.asks) {
            return Some("ask ladder not sorted ascending".to_string());
        }
        if self.bids.iter().chain(self.asks.iter()).any(|l| l.size <= 0.0) {
            return Some("ladder contains a non-positive size".to_string());
        }
        None
    }
}

fn is_sorted_desc(levels: &[Level]) -> bool {
    levels.windows(2).all(|w| w[0].price >= w[1].price)
}

fn is_sorted_asc(levels: &[Level]) -> bool {
    levels.windows(2).all(|w| w[0].price <= w[1].price)
}

fn merge_same_price(mut levels: Vec<Level>, desc: bool) -> Vec<Level> {
    levels.retain(|l| l.size > 0.0);
    if desc {
        levels.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
    } else {
        levels.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
    }
    let mut merged: Vec<Level> = Vec::with_capacity(levels.len());
    for level in levels {
        if let Some(last) = merged.last_mut() {
            if (last.price - level.price).abs() < f64::EPSILON {
                last.size += level.size;
                continue;
            }
        }
        merged.push(level);
    }
    merged
}

/// Order lifecycle status, authoritative values mirrored by `fsm::State`.
/// Kept as a separate, `Display`-bounded string-safe enum because
/// persisted rows store the string form (spec §9 "persistence of
/// enum-like status strings ... validate against the FSM enumeration on
/// read").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PendingPlace,
    Live,
    Partial,
    Filled,
    Cancelling,
    Cancelled,
    Rejected,
    Expired,
    Errored,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Errored
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::PendingPlace => "pending_place",
            OrderStatus::Live => "live",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelling => "cancelling",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::Errored => "errored",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "new" => OrderStatus::New,
            "pending_place" => OrderStatus::PendingPlace,
            "live" => OrderStatus::Live,
            "partial" => OrderStatus::Partial,
            "filled" => OrderStatus::Filled,
            "cancelling" => OrderStatus::Cancelling,
            "cancelled" => OrderStatus::Cancelled,
            "rejected" => OrderStatus::Rejected,
            "expired" => OrderStatus::Expired,
            "errored" => OrderStatus::Errored,
            _ => return None,
        })
    }
}

/// One order, live or historical (spec §3 `Order`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub venue_order_id: Option<String>,
    pub venue: String,
    pub account_id: String,
    pub market_id: String,
    pub side: Side,
    pub order_type: OrderType,
    /// `None` for market orders.
    pub price: Option<f64>,
    pub requested_size: f64,
    pub filled_size: f64,
    pub status: OrderStatus,
    pub role: OrderRole,
    /// Set only for HEDGE orders: the canonical fill that spawned this leg.
    pub parent_fill_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_size(&self) -> f64 {
        (self.requested_size - self.filled_size).max(0.0)
    }
}

/// A canonical fill, already deduplicated by the Reconciler (spec §3 `Fill`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub source_venue: String,
    pub venue_order_id: String,
    pub client_order_id: String,
    /// Present when the venue supplies one; otherwise the Reconciler
    /// synthesizes a watermark-delta key (see `reconciler::FillKey`).
    pub fill_id: Option<String>,
    pub size: f64,
    pub price: f64,
    pub side: Side,
    pub ts: DateTime<Utc>,
}

impl Fill {
    /// Stable identity used for Hedger at-most-once locking and logging.
    /// Not the dedup key itself — see `reconciler::FillKey`.
    pub fn display_id(&self) -> String {
        match &self.fill_id {
            Some(id) => format!("{}:{}:{}", self.source_venue, self.venue_order_id, id),
            None => format!("{}:{}:wm", self.source_venue, self.venue_order_id),
        }
    }
}

/// A completed entry+hedge pair (spec §3 `Trade`). Created only once both
/// legs reach a terminal status with non-zero fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Option<i64>,
    pub entry_order_id: String,
    pub hedge_order_id: String,
    pub entry_venue: String,
    pub hedge_venue: String,
    pub matched_size: f64,
    pub entry_price: f64,
    pub hedge_price: f64,
    pub fees_estimate: f64,
    pub estimated_pnl: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoubleLimitState {
    Armed,
    Triggered,
    Cancelling,
    Resolved,
    Failed,
}

impl DoubleLimitState {
    pub fn as_str(self) -> &'static str {
        match self {
            DoubleLimitState::Armed => "armed",
            DoubleLimitState::Triggered => "triggered",
            DoubleLimitState::Cancelling => "cancelling",
            DoubleLimitState::Resolved => "resolved",
            DoubleLimitState::Failed => "failed",
        }
    }
}

/// A pair of opposing limit orders placed simultaneously; either fill
/// triggers immediate cancel of the sibling (spec §3 `DoubleLimit`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoubleLimit {
    pub id: String,
    pub pair_id: String,
    pub order_a_ref: String,
    pub order_b_ref: String,
    pub state: DoubleLimitState,
    pub triggered_order_id: Option<String>,
    pub cancelled_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only incident record (spec §3 `Incident`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Option<i64>,
    pub severity: crate::errors::Severity,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub pair_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted `/simulate` plan — never placed (spec §3 `SimulatedRun`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedRun {
    pub id: Option<i64>,
    pub pair_id: String,
    pub size: f64,
    pub plan: serde_json::Value,
    pub expected_pnl: f64,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted Order FSM transition row (spec §4.3 `order_events`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: Option<i64>,
    pub client_order_id: String,
    pub stage: String,
    pub detail: Option<String>,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_duplicate_price_levels() {
        let book = OrderbookSnapshot {
            venue: "a".into(),
            market_id: "m".into(),
            sequence: 1,
            bids: vec![Level { price: 0.40, size: 10.0 }, Level { price: 0.40, size: 5.0 }],
            asks: vec![Level { price: 0.42, size: 8.0 }],
        }
        .normalized();

        assert_eq!(book.bids.len(), 1);
        assert!((book.bids[0].size - 15.0).abs() < 1e-9);
    }

    #[test]
    fn crossed_book_is_an_invariant_violation() {
        let book = OrderbookSnapshot {
            venue: "a".into(),
            market_id: "m".into(),
            sequence: 1,
            bids: vec![Level { price: 0.51, size: 10.0 }],
            asks: vec![Level { price: 0.50, size: 10.0 }],
        };
        assert!(book.invariant_violation().is_some());
    }

    #[test]
    fn well_formed_book_has_no_violation() {
        let book = OrderbookSnapshot {
            venue: "a".into(),
            market_id: "m".into(),
            sequence: 1,
            bids: vec![Level { price: 0.40, size: 10.0 }],
            asks: vec![Level { price: 0.42, size: 10.0 }],
        };
        assert!(book.invariant_violation().is_none());
    }

    #[test]
    fn order_status_round_trips_through_string() {
        for s in [
            OrderStatus::New,
            OrderStatus::Live,
            OrderStatus::Filled,
            OrderStatus::Errored,
        ] {
            assert_eq!(OrderStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(OrderStatus::from_str("bogus"), None);
    }
}
