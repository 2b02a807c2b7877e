//! Orderbook Snapshot + Spread Analyzer (spec §4.1).
//!
//! Pure functions only: no I/O, no locking, no shared state. Everything
//! here takes an `OrderbookSnapshot` (or two) and returns a plain value.

use crate::domain::{Level, OrderbookSnapshot, Side};

/// Result of walking one side of a book to fill `size` units of notional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillEstimate {
    /// Size actually available within the walked levels (may be less than
    /// requested if the book is too thin).
    pub filled_size: f64,
    /// Size-weighted average price across the walked levels.
    pub avg_price: f64,
    /// Worst (last-touched) price in the walk.
    pub worst_price: f64,
}

/// Walks `levels` (already sorted best-first) accumulating up to `size`.
/// Returns `None` if the book has zero depth.
pub fn walk_book(levels: &[Level], size: f64) -> Option<FillEstimate> {
    if levels.is_empty() || size <= 0.0 {
        return None;
    }
    let mut remaining = size;
    let mut notional = 0.0;
    let mut filled = 0.0;
    let mut worst_price = levels[0].price;

    for level in levels {
        if remaining <= 0.0 {
            break;
        }
        let take = level.size.min(remaining);
        notional += take * level.price;
        filled += take;
        worst_price = level.price;
        remaining -= take;
    }

    if filled <= 0.0 {
        return None;
    }

    Some(FillEstimate {
        filled_size: filled,
        avg_price: notional / filled,
        worst_price,
    })
}

/// Slippage in price units between a reference price and a walked fill's
/// average price, signed so that a positive value is always "worse for the
/// taker" regardless of side.
pub fn slippage(side: Side, reference_price: f64, fill: &FillEstimate) -> f64 {
    match side {
        Side::Buy => fill.avg_price - reference_price,
        Side::Sell => reference_price - fill.avg_price,
    }
}

/// Net entry-vs-hedge spread for a candidate size, normalized by the entry
/// fill's average price so the result is a fraction comparable across pairs
/// regardless of their price level, after subtracting both venues' taker
/// fees (fee rate expressed as a fraction of notional, e.g. `0.02` for 2%).
/// Positive means the trade is profitable before slippage.
pub fn net_spread(
    entry_side: Side,
    entry_book: &OrderbookSnapshot,
    entry_fee_rate: f64,
    hedge_book: &OrderbookSnapshot,
    hedge_fee_rate: f64,
    size: f64,
) -> Option<f64> {
    let entry_levels = match entry_side {
        Side::Buy => &entry_book.asks,
        Side::Sell => &entry_book.bids,
    };
    let hedge_levels = match entry_side.opposite() {
        Side::Buy => &hedge_book.asks,
        Side::Sell => &hedge_book.bids,
    };

    let entry_fill = walk_book(entry_levels, size)?;
    let hedge_fill = walk_book(hedge_levels, size)?;

    let gross = match entry_side {
        Side::Buy => hedge_fill.avg_price - entry_fill.avg_price,
        Side::Sell => entry_fill.avg_price - hedge_fill.avg_price,
    };
    let fees = entry_fill.avg_price * entry_fee_rate + hedge_fill.avg_price * hedge_fee_rate;
    Some((gross - fees) / entry_fill.avg_price)
}

/// Largest size both books can absorb without the entry-side worst price
/// crossing `max_slippage` away from top-of-book. Used by the Hedger to cap
/// leg size before placement (spec §4.6).
pub fn max_size_within_slippage(
    side: Side,
    book: &OrderbookSnapshot,
    reference_price: f64,
    max_slippage: f64,
) -> f64 {
    let levels: &[Level] = match side {
        Side::Buy => &book.asks,
        Side::Sell => &book.bids,
    };
    let mut cumulative = 0.0;
    for level in levels {
        let candidate_slip = match side {
            Side::Buy => level.price - reference_price,
            Side::Sell => reference_price - level.price,
        };
        if candidate_slip > max_slippage {
            break;
        }
        cumulative += level.size;
    }
    cumulative
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderbookSnapshot {
        OrderbookSnapshot {
            venue: "v".into(),
            market_id: "m".into(),
            sequence: 1,
            bids: vec![Level { price: 0.48, size: 100.0 }, Level { price: 0.47, size: 200.0 }],
            asks: vec![Level { price: 0.50, size: 100.0 }, Level { price: 0.51, size: 200.0 }],
        }
    }

    #[test]
    fn walk_book_averages_across_levels() {
        let est = walk_book(&book().asks, 150.0).unwrap();
        assert!((est.filled_size - 150.0).abs() < 1e-9);
        // 100 @ 0.50 + 50 @ 0.51
        let expected_avg = (100.0 * 0.50 + 50.0 * 0.51) / 150.0;
        assert!((est.avg_price - expected_avg).abs() < 1e-9);
        assert!((est.worst_price - 0.51).abs() < 1e-9);
    }

    #[test]
    fn walk_book_caps_at_available_depth() {
        let est = walk_book(&book().asks, 10_000.0).unwrap();
        assert!((est.filled_size - 300.0).abs() < 1e-9);
    }

    #[test]
    fn walk_book_empty_returns_none() {
        assert!(walk_book(&[], 10.0).is_none());
    }

    #[test]
    fn net_spread_subtracts_fees() {
        let entry = book();
        let hedge = OrderbookSnapshot {
            venue: "v2".into(),
            market_id: "m2".into(),
            sequence: 1,
            bids: vec![Level { price: 0.55, size: 100.0 }],
            asks: vec![Level { price: 0.57, size: 100.0 }],
        };
        let spread = net_spread(Side::Buy, &entry, 0.01, &hedge, 0.01, 50.0).unwrap();
        // buy entry @0.50, sell hedge @0.55, gross 0.05, fees 0.50*0.01+0.55*0.01,
        // normalized by the entry fill's avg price (0.50)
        let expected = (0.05 - (0.50 * 0.01 + 0.55 * 0.01)) / 0.50;
        assert!((spread - expected).abs() < 1e-9);
    }

    #[test]
    fn max_size_within_slippage_stops_at_threshold() {
        let b = book();
        let size = max_size_within_slippage(Side::Buy, &b, 0.50, 0.005);
        assert!((size - 100.0).abs() < 1e-9);
    }
}
