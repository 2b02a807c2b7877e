//! Risk Manager gate.
//!
//! Pure predicate: `evaluate(account_state, proposed_order) -> Verdict`.
//! Checks run in a fixed order and the first failing check wins. A plain
//! struct holding configured thresholds, no hidden state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RiskDenyReason;

/// Snapshot of the facts the gate needs about one account + pair at
/// decision time. Built fresh by the caller on every `evaluate` call —
/// the Risk Manager itself holds no per-account state.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub account_id: String,
    pub cool_down_until: Option<DateTime<Utc>>,
    pub current_gross_exposure: f64,
    pub open_order_count_for_pair: u32,
    pub available_balance: f64,
    pub predicted_slippage: f64,
}

/// A candidate order, not yet persisted or placed.
#[derive(Debug, Clone)]
pub struct ProposedOrder {
    pub requested_size: f64,
    pub price: f64,
    pub projected_exposure_delta: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Deny(RiskDenyReason),
}

/// Configured thresholds for the gate (spec §6 `market_hedge_mode`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub exposure_cap: f64,
    pub open_order_cap: u32,
    pub safety_margin: f64,
    pub max_slippage: f64,
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    pub config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Checks run in spec order; first failure wins.
    pub fn evaluate(&self, account: &AccountState, order: &ProposedOrder, now: DateTime<Utc>) -> Verdict {
        if let Some(until) = account.cool_down_until {
            if now < until {
                return Verdict::Deny(RiskDenyReason::AccountCoolDown);
            }
        }

        let projected_exposure = account.current_gross_exposure + order.projected_exposure_delta;
        if projected_exposure > self.config.exposure_cap {
            return Verdict::Deny(RiskDenyReason::ExposureCapExceeded);
        }

        if account.open_order_count_for_pair >= self.config.open_order_cap {
            return Verdict::Deny(RiskDenyReason::OpenOrderCapExceeded);
        }

        let notional = order.requested_size * order.price;
        if notional > account.available_balance * self.config.safety_margin {
            return Verdict::Deny(RiskDenyReason::InsufficientBalance);
        }

        if account.predicted_slippage > self.config.max_slippage {
            return Verdict::Deny(RiskDenyReason::SlippageCeilingExceeded);
        }

        Verdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn config() -> RiskConfig {
        RiskConfig { exposure_cap: 1000.0, open_order_cap: 3, safety_margin: 0.9, max_slippage: 0.02 }
    }

    fn ok_account() -> AccountState {
        AccountState {
            account_id: "acct-1".into(),
            cool_down_until: None,
            current_gross_exposure: 0.0,
            open_order_count_for_pair: 0,
            available_balance: 1000.0,
            predicted_slippage: 0.0,
        }
    }

    fn ok_order() -> ProposedOrder {
        ProposedOrder { requested_size: 100.0, price: 0.5, projected_exposure_delta: 50.0 }
    }

    #[test]
    fn allows_when_all_checks_pass() {
        let rm = RiskManager::new(config());
        assert_eq!(rm.evaluate(&ok_account(), &ok_order(), Utc::now()), Verdict::Allow);
    }

    #[test]
    fn cool_down_wins_first_even_if_other_checks_would_also_fail() {
        let rm = RiskManager::new(config());
        let mut account = ok_account();
        account.cool_down_until = Some(Utc::now() + Duration::seconds(60));
        account.current_gross_exposure = 9999.0; // would also fail exposure check
        assert_eq!(
            rm.evaluate(&account, &ok_order(), Utc::now()),
            Verdict::Deny(RiskDenyReason::AccountCoolDown)
        );
    }

    #[test]
    fn denies_on_exposure_cap() {
        let rm = RiskManager::new(config());
        let mut account = ok_account();
        account.current_gross_exposure = 990.0;
        assert_eq!(
            rm.evaluate(&account, &ok_order(), Utc::now()),
            Verdict::Deny(RiskDenyReason::ExposureCapExceeded)
        );
    }

    #[test]
    fn denies_on_open_order_cap() {
        let rm = RiskManager::new(config());
        let mut account = ok_account();
        account.open_order_count_for_pair = 3;
        assert_eq!(
            rm.evaluate(&account, &ok_order(), Utc::now()),
            Verdict::Deny(RiskDenyReason::OpenOrderCapExceeded)
        );
    }

    #[test]
    fn denies_on_insufficient_balance() {
        let rm = RiskManager::new(config());
        let mut account = ok_account();
        account.available_balance = 10.0;
        assert_eq!(
            rm.evaluate(&account, &ok_order(), Utc::now()),
            Verdict::Deny(RiskDenyReason::InsufficientBalance)
        );
    }

    #[test]
    fn denies_on_slippage_ceiling() {
        let rm = RiskManager::new(config());
        let mut account = ok_account();
        account.predicted_slippage = 0.05;
        assert_eq!(
            rm.evaluate(&account, &ok_order(), Utc::now()),
            Verdict::Deny(RiskDenyReason::SlippageCeilingExceeded)
        );
    }
}
