//! Order FSM (spec §4.3).
//!
//! Transitions are driven only by `Event`s. Each accepted transition
//! produces an `OrderEvent` the caller must persist *before* the in-memory
//! state is considered durable — the FSM itself does no I/O, it only
//! computes the next state (or rejects the event as illegal).

use chrono::Utc;

use crate::domain::{Order, OrderEvent, OrderStatus};

#[derive(Debug, Clone)]
pub enum Event {
    PlaceAcked { venue_order_id: String },
    PlaceRejected { reason: String },
    FillReceived { size: f64 },
    CancelRequested,
    CancelAcked,
    CancelRejected { reason: String },
    TimeoutElapsed,
    ErrorObserved { detail: String },
}

impl Event {
    fn stage_name(&self) -> &'static str {
        match self {
            Event::PlaceAcked { .. } => "place_acked",
            Event::PlaceRejected { .. } => "place_rejected",
            Event::FillReceived { .. } => "fill_received",
            Event::CancelRequested => "cancel_requested",
            Event::CancelAcked => "cancel_acked",
            Event::CancelRejected { .. } => "cancel_rejected",
            Event::TimeoutElapsed => "timeout_elapsed",
            Event::ErrorObserved { .. } => "error_observed",
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            Event::PlaceAcked { venue_order_id } => Some(venue_order_id.clone()),
            Event::PlaceRejected { reason } => Some(reason.clone()),
            Event::FillReceived { size } => Some(size.to_string()),
            Event::CancelRejected { reason } => Some(reason.clone()),
            Event::ErrorObserved { detail } => Some(detail.clone()),
            Event::CancelRequested | Event::CancelAcked | Event::TimeoutElapsed => None,
        }
    }
}

/// Outcome of applying an event: either the order moved to a new state
/// (with the event row to persist), or the transition was illegal and the
/// caller should log an incident without touching the order.
pub enum Outcome {
    Applied(OrderEvent),
    Illegal { attempted: &'static str, current: OrderStatus },
}

/// Applies `event` to `order` in place, returning the persisted-event
/// record on success. `order` is only mutated when the transition is
/// legal; a late event against a terminal order (e.g. a CancelAcked that
/// arrives after the order already reached FILLED) is discarded.
pub fn apply(order: &mut Order, event: Event) -> Outcome {
    if order.status.is_terminal() {
        return Outcome::Illegal { attempted: event.stage_name(), current: order.status };
    }

    let next = match (order.status, &event) {
        (OrderStatus::New, Event::PlaceAcked { .. }) => Some(OrderStatus::Live),
        (OrderStatus::New, Event::PlaceRejected { .. }) => Some(OrderStatus::Rejected),
        (OrderStatus::PendingPlace, Event::PlaceAcked { .. }) => Some(OrderStatus::Live),
        (OrderStatus::PendingPlace, Event::PlaceRejected { .. }) => Some(OrderStatus::Rejected),

        (OrderStatus::Live, Event::FillReceived { size }) => {
            Some(fill_next_state(order, *size))
        }
        (OrderStatus::Partial, Event::FillReceived { size }) => {
            Some(fill_next_state(order, *size))
        }

        (OrderStatus::Live, Event::CancelRequested) => Some(OrderStatus::Cancelling),
        (OrderStatus::Partial, Event::CancelRequested) => Some(OrderStatus::Cancelling),

        (OrderStatus::Cancelling, Event::CancelAcked) => Some(OrderStatus::Cancelled),
        // A fill racing a cancel can still complete the order; FILLED wins.
        (OrderStatus::Cancelling, Event::FillReceived { size }) => {
            Some(fill_next_state(order, *size))
        }
        (OrderStatus::Cancelling, Event::CancelRejected { .. }) => Some(OrderStatus::Errored),

        (_, Event::TimeoutElapsed) => Some(OrderStatus::Expired),
        (_, Event::ErrorObserved { .. }) => Some(OrderStatus::Errored),

        _ => None,
    };

    let Some(next) = next else {
        return Outcome::Illegal { attempted: event.stage_name(), current: order.status };
    };

    if let Event::FillReceived { size } = &event {
        order.filled_size = (order.filled_size + size).min(order.requested_size);
    }

    order.status = next;
    order.updated_at = Utc::now();

    Outcome::Applied(OrderEvent {
        id: None,
        client_order_id: order.client_order_id.clone(),
        stage: event.stage_name().to_string(),
        detail: event.detail(),
        ts: order.updated_at,
    })
}

fn fill_next_state(order: &Order, incoming_size: f64) -> OrderStatus {
    let projected = (order.filled_size + incoming_size).min(order.requested_size);
    if projected >= order.requested_size {
        OrderStatus::Filled
    } else {
        OrderStatus::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderRole, OrderType, Side};

    fn new_order() -> Order {
        let now = Utc::now();
        Order {
            client_order_id: "p1-primary-1-abcd".into(),
            venue_order_id: None,
            venue: "venue-a".into(),
            account_id: "acct-1".into(),
            market_id: "mkt-1".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(0.42),
            requested_size: 100.0,
            filled_size: 0.0,
            status: OrderStatus::New,
            role: OrderRole::Primary,
            parent_fill_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn place_acked_moves_to_live() {
        let mut order = new_order();
        let outcome = apply(&mut order, Event::PlaceAcked { venue_order_id: "v1".into() });
        assert!(matches!(outcome, Outcome::Applied(_)));
        assert_eq!(order.status, OrderStatus::Live);
    }

    #[test]
    fn full_fill_bypasses_cancelling_even_while_cancelling() {
        let mut order = new_order();
        order.status = OrderStatus::Live;
        apply(&mut order, Event::CancelRequested);
        assert_eq!(order.status, OrderStatus::Cancelling);

        apply(&mut order, Event::FillReceived { size: 100.0 });
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn cancel_acked_after_fill_completed_is_discarded() {
        let mut order = new_order();
        order.status = OrderStatus::Live;
        apply(&mut order, Event::FillReceived { size: 100.0 });
        assert_eq!(order.status, OrderStatus::Filled);

        let outcome = apply(&mut order, Event::CancelAcked);
        assert!(matches!(outcome, Outcome::Illegal { .. }));
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn partial_fill_accumulates() {
        let mut order = new_order();
        order.status = OrderStatus::Live;
        apply(&mut order, Event::FillReceived { size: 30.0 });
        assert_eq!(order.status, OrderStatus::Partial);
        assert!((order.filled_size - 30.0).abs() < 1e-9);

        apply(&mut order, Event::FillReceived { size: 40.0 });
        assert_eq!(order.status, OrderStatus::Partial);
        assert!((order.filled_size - 70.0).abs() < 1e-9);
    }

    #[test]
    fn illegal_transition_from_terminal_does_not_mutate() {
        let mut order = new_order();
        order.status = OrderStatus::Rejected;
        let outcome = apply(&mut order, Event::PlaceAcked { venue_order_id: "v1".into() });
        assert!(matches!(outcome, Outcome::Illegal { .. }));
        assert_eq!(order.status, OrderStatus::Rejected);
    }
}
