//! Error taxonomy for the hedging engine.
//!
//! Matches spec §7: transient network errors are retried by the caller,
//! venue rejections and risk denials are terminal-but-handled, invariant
//! violations disable the affected pair, everything else is recorded as an
//! incident and the system continues.

use std::fmt;

/// Errors a Venue Adapter call can fail with. The Order Manager's retry
/// loop (§4.4) branches on `Transient` vs everything else.
#[derive(Debug, Clone)]
pub enum VenueError {
    /// Network blip, timeout, 5xx — safe to retry with backoff.
    Transient(String),
    /// Venue rejected the request outright (bad price, insufficient
    /// balance on venue side, market closed). Not idempotent to retry.
    Rejected(String),
}

impl fmt::Display for VenueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueError::Transient(msg) => write!(f, "transient venue error: {msg}"),
            VenueError::Rejected(msg) => write!(f, "venue rejected: {msg}"),
        }
    }
}

impl std::error::Error for VenueError {}

/// Why the Risk Manager denied a proposed order (spec §4.2, first-failing-check-wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskDenyReason {
    AccountCoolDown,
    ExposureCapExceeded,
    OpenOrderCapExceeded,
    InsufficientBalance,
    SlippageCeilingExceeded,
}

impl fmt::Display for RiskDenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskDenyReason::AccountCoolDown => "account in cool-down",
            RiskDenyReason::ExposureCapExceeded => "projected exposure exceeds cap",
            RiskDenyReason::OpenOrderCapExceeded => "per-pair open-order cap exceeded",
            RiskDenyReason::InsufficientBalance => "requested notional exceeds available balance",
            RiskDenyReason::SlippageCeilingExceeded => "predicted slippage exceeds ceiling",
        };
        write!(f, "{s}")
    }
}

/// Incident severity levels (spec §3 `Incident`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Well-known incident codes referenced by spec §4.5/§4.6/§5.
pub mod incident_code {
    pub const STALE_FILL_SOURCE: &str = "STALE_FILL_SOURCE";
    pub const HEDGE_SLIPPAGE_ABORT: &str = "HEDGE_SLIPPAGE_ABORT";
    pub const HEDGE_UNDERSIZED: &str = "HEDGE_UNDERSIZED";
    pub const SHUTDOWN_INFLIGHT: &str = "SHUTDOWN_INFLIGHT";
    pub const ILLEGAL_TRANSITION: &str = "ILLEGAL_TRANSITION";
    pub const INVARIANT_VIOLATION: &str = "INVARIANT_VIOLATION";
}
