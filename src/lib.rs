//! Cross-venue market-hedging engine core: Pair Controller, Order Manager
//! + FSM + Double-Limit, Reconciler, Hedger, Risk Manager, Spread
//! Analyzer. Concrete venue clients, configuration-file mechanics beyond
//! what `config` covers, and telemetry exposition are intentionally
//! outside this crate.

pub mod account_pool;
pub mod api;
pub mod backoff;
pub mod config;
pub mod domain;
pub mod errors;
pub mod fill_pipeline;
pub mod fsm;
pub mod hedger;
pub mod order_manager;
pub mod pair_controller;
pub mod persistence;
pub mod reconciler;
pub mod risk;
pub mod spread;
pub mod venue;

pub mod prelude {
    pub use crate::domain::*;
    pub use crate::errors::{RiskDenyReason, Severity, VenueError};
}
