//! Persistence Gateway.
//!
//! A struct owning `Arc<tokio::sync::Mutex<Connection>>`, an `open(path)`
//! that creates tables if absent, and `async fn` methods that lock the
//! connection for one short operation at a time. Migrations are a fixed,
//! lexicographically ordered list of embedded SQL strings, each tracked
//! in `schema_migrations` before it commits.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::domain::{
    Account, DoubleLimit, DoubleLimitState, Fill, Incident, MarketPair, Order, OrderEvent,
    OrderRole, OrderStatus, OrderType, SimulatedRun, Side, Trade,
};
use crate::errors::Severity;

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_init",
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            venue TEXT NOT NULL,
            credentials TEXT NOT NULL,
            proxy TEXT,
            rate_limit_per_sec REAL NOT NULL,
            rate_limit_burst INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS market_pairs (
            pair_id TEXT PRIMARY KEY,
            venue_a TEXT NOT NULL,
            market_a TEXT NOT NULL,
            venue_b TEXT NOT NULL,
            market_b TEXT NOT NULL,
            account_a_id TEXT NOT NULL,
            account_b_id TEXT NOT NULL,
            primary_venue TEXT NOT NULL,
            secondary_venue TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS orders (
            client_order_id TEXT PRIMARY KEY,
            venue_order_id TEXT,
            venue TEXT NOT NULL,
            account_id TEXT NOT NULL,
            market_id TEXT NOT NULL,
            side TEXT NOT NULL,
            order_type TEXT NOT NULL,
            price REAL,
            requested_size REAL NOT NULL,
            filled_size REAL NOT NULL,
            status TEXT NOT NULL,
            role TEXT NOT NULL,
            parent_fill_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE TABLE IF NOT EXISTS order_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            client_order_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            detail TEXT,
            ts TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_order_events_order ON order_events(client_order_id);
        CREATE TABLE IF NOT EXISTS fills (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_venue TEXT NOT NULL,
            venue_order_id TEXT NOT NULL,
            client_order_id TEXT NOT NULL,
            fill_id TEXT,
            size REAL NOT NULL,
            price REAL NOT NULL,
            side TEXT NOT NULL,
            ts TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_fills_dedup
            ON fills(source_venue, venue_order_id, fill_id);
        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_order_id TEXT NOT NULL,
            hedge_order_id TEXT NOT NULL,
            entry_venue TEXT NOT NULL,
            hedge_venue TEXT NOT NULL,
            matched_size REAL NOT NULL,
            entry_price REAL NOT NULL,
            hedge_price REAL NOT NULL,
            fees_estimate REAL NOT NULL,
            estimated_pnl REAL NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS double_limits (
            id TEXT PRIMARY KEY,
            pair_id TEXT NOT NULL,
            order_a_ref TEXT NOT NULL UNIQUE,
            order_b_ref TEXT NOT NULL UNIQUE,
            state TEXT NOT NULL,
            triggered_order_id TEXT,
            cancelled_order_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS incidents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            severity TEXT NOT NULL,
            code TEXT NOT NULL,
            message TEXT NOT NULL,
            details TEXT,
            pair_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS simulated_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pair_id TEXT NOT NULL,
            size REAL NOT NULL,
            plan TEXT NOT NULL,
            expected_pnl REAL NOT NULL,
            notes TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
    ),
];

pub struct PersistenceGateway {
    conn: Arc<Mutex<Connection>>,
}

impl PersistenceGateway {
    pub async fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("opening sqlite database")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
            [],
        )?;
        for (version, sql) in MIGRATIONS {
            let already: Option<String> = conn
                .query_row(
                    "SELECT version FROM schema_migrations WHERE version = ?1",
                    params![version],
                    |row| row.get(0),
                )
                .optional()?;
            if already.is_some() {
                continue;
            }
            conn.execute_batch(sql)
                .with_context(|| format!("applying migration {version}"))?;
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, Utc::now().to_rfc3339()],
            )?;
        }
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn upsert_account(&self, account: &Account) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO accounts (id, venue, credentials, proxy, rate_limit_per_sec, rate_limit_burst)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET venue=excluded.venue, credentials=excluded.credentials,
                proxy=excluded.proxy, rate_limit_per_sec=excluded.rate_limit_per_sec,
                rate_limit_burst=excluded.rate_limit_burst",
            params![
                account.id,
                account.venue,
                account.credentials,
                account.proxy,
                account.rate_limit_per_sec,
                account.rate_limit_burst,
            ],
        )?;
        Ok(())
    }

    pub async fn upsert_market_pair(&self, pair: &MarketPair) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO market_pairs (pair_id, venue_a, market_a, venue_b, market_b,
                account_a_id, account_b_id, primary_venue, secondary_venue)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(pair_id) DO UPDATE SET venue_a=excluded.venue_a, market_a=excluded.market_a,
                venue_b=excluded.venue_b, market_b=excluded.market_b,
                account_a_id=excluded.account_a_id, account_b_id=excluded.account_b_id,
                primary_venue=excluded.primary_venue, secondary_venue=excluded.secondary_venue",
            params![
                pair.pair_id,
                pair.venue_a,
                pair.market_a,
                pair.venue_b,
                pair.market_b,
                pair.account_a_id,
                pair.account_b_id,
                pair.primary_venue,
                pair.secondary_venue,
            ],
        )?;
        Ok(())
    }

    /// Idempotent on `client_order_id`, per spec §6. Used both for the
    /// initial NEW row and for every subsequent state write.
    pub async fn upsert_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO orders (client_order_id, venue_order_id, venue, account_id, market_id,
                side, order_type, price, requested_size, filled_size, status, role,
                parent_fill_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(client_order_id) DO UPDATE SET venue_order_id=excluded.venue_order_id,
                filled_size=excluded.filled_size, status=excluded.status,
                updated_at=excluded.updated_at",
            params![
                order.client_order_id,
                order.venue_order_id,
                order.venue,
                order.account_id,
                order.market_id,
                order.side.to_string(),
                order_type_str(order.order_type),
                order.price,
                order.requested_size,
                order.filled_size,
                order.status.as_str(),
                role_str(order.role),
                order.parent_fill_id,
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_order(&self, client_order_id: &str) -> Result<Option<Order>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT client_order_id, venue_order_id, venue, account_id, market_id, side,
                order_type, price, requested_size, filled_size, status, role, parent_fill_id,
                created_at, updated_at
             FROM orders WHERE client_order_id = ?1",
            params![client_order_id],
            row_to_order,
        )
        .optional()
        .context("loading order")
    }

    pub async fn append_order_event(&self, event: &OrderEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO order_events (client_order_id, stage, detail, ts) VALUES (?1, ?2, ?3, ?4)",
            params![event.client_order_id, event.stage, event.detail, event.ts.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Returns `false` if `(source_venue, venue_order_id, fill_id)` already
    /// exists — the caller treats this as a duplicate, never a Fill.
    pub async fn insert_fill_if_new(&self, fill: &Fill) -> Result<bool> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT OR IGNORE INTO fills (source_venue, venue_order_id, client_order_id, fill_id, size, price, side, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fill.source_venue,
                fill.venue_order_id,
                fill.client_order_id,
                fill.fill_id,
                fill.size,
                fill.price,
                fill.side.to_string(),
                fill.ts.to_rfc3339(),
            ],
        )?;
        Ok(result > 0)
    }

    pub async fn insert_trade(&self, trade: &Trade) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trades (entry_order_id, hedge_order_id, entry_venue, hedge_venue,
                matched_size, entry_price, hedge_price, fees_estimate, estimated_pnl, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                trade.entry_order_id,
                trade.hedge_order_id,
                trade.entry_venue,
                trade.hedge_venue,
                trade.matched_size,
                trade.entry_price,
                trade.hedge_price,
                trade.fees_estimate,
                trade.estimated_pnl,
                trade.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn upsert_double_limit(&self, dl: &DoubleLimit) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO double_limits (id, pair_id, order_a_ref, order_b_ref, state,
                triggered_order_id, cancelled_order_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET state=excluded.state,
                triggered_order_id=excluded.triggered_order_id,
                cancelled_order_id=excluded.cancelled_order_id,
                updated_at=excluded.updated_at",
            params![
                dl.id,
                dl.pair_id,
                dl.order_a_ref,
                dl.order_b_ref,
                double_limit_state_str(dl.state),
                dl.triggered_order_id,
                dl.cancelled_order_id,
                dl.created_at.to_rfc3339(),
                dl.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn record_incident(&self, incident: &Incident) -> Result<i64> {
        let conn = self.conn.lock().await;
        let details = incident.details.as_ref().map(|v| v.to_string());
        conn.execute(
            "INSERT INTO incidents (severity, code, message, details, pair_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                severity_str(incident.severity),
                incident.code,
                incident.message,
                details,
                incident.pair_id,
                incident.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn record_simulated_run(&self, run: &SimulatedRun) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO simulated_runs (pair_id, size, plan, expected_pnl, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.pair_id,
                run.size,
                run.plan.to_string(),
                run.expected_pnl,
                run.notes,
                run.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Every order not yet in a terminal state, for rehydrating
    /// `OrderManager`'s in-memory map at startup (spec §1 "crash
    /// recovery"): `filled_size` is persisted on every state transition, so
    /// the loaded row already carries the correct cumulative-filled
    /// watermark without replaying `order_events`.
    pub async fn load_non_terminal_orders(&self) -> Result<Vec<Order>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT client_order_id, venue_order_id, venue, account_id, market_id, side,
                order_type, price, requested_size, filled_size, status, role, parent_fill_id,
                created_at, updated_at
             FROM orders WHERE status NOT IN ('filled', 'cancelled', 'rejected', 'errored')",
        )?;
        let rows = stmt
            .query_map([], row_to_order)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("loading non-terminal orders")?;
        Ok(rows)
    }

    /// Every `DoubleLimit` not yet `resolved`/`failed`, for rehydrating
    /// `OrderManager`'s double-limit index and registry at startup.
    pub async fn load_open_double_limits(&self) -> Result<Vec<DoubleLimit>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, pair_id, order_a_ref, order_b_ref, state, triggered_order_id,
                cancelled_order_id, created_at, updated_at
             FROM double_limits WHERE state NOT IN ('resolved', 'failed')",
        )?;
        let rows = stmt
            .query_map([], row_to_double_limit)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("loading open double limits")?;
        Ok(rows)
    }

    pub async fn count_live_orders(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE status IN ('live', 'partial', 'pending_place', 'cancelling')",
            [],
            |row| row.get(0),
        )
        .context("counting live orders")
    }

    /// Live order count scoped to one pair (spec §6 "/status reports ...
    /// open orders"), matched by `client_order_id` prefix since
    /// `generate_client_order_id` always stamps `"{pair_id}-{role}-..."` and
    /// `orders` carries no separate `pair_id` column.
    pub async fn count_live_orders_for_pair(&self, pair_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let prefix = format!("{pair_id}-%");
        conn.query_row(
            "SELECT COUNT(*) FROM orders
             WHERE status IN ('live', 'partial', 'pending_place', 'cancelling')
               AND client_order_id LIKE ?1",
            params![prefix],
            |row| row.get(0),
        )
        .context("counting live orders for pair")
    }

    /// Timestamp of the most recent fill whose order belongs to `pair_id`,
    /// for `/status`'s per-pair "last fill time" (spec §6).
    pub async fn last_fill_time_for_pair(&self, pair_id: &str) -> Result<Option<chrono::DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let prefix = format!("{pair_id}-%");
        let ts: Option<String> = conn
            .query_row(
                "SELECT ts FROM fills WHERE client_order_id LIKE ?1 ORDER BY id DESC LIMIT 1",
                params![prefix],
                |row| row.get(0),
            )
            .optional()
            .context("loading last fill time for pair")?;
        Ok(ts.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)))
    }

    /// Most recent incidents, newest first. Used by operators inspecting
    /// `/status` and by tests asserting an abort path actually recorded one.
    pub async fn recent_incidents(&self, limit: i64) -> Result<Vec<Incident>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, severity, code, message, details, pair_id, created_at
             FROM incidents ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_incident)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("loading incidents")?;
        Ok(rows)
    }

    /// Most recent trades, newest first. Used by tests asserting the
    /// Hedger actually recorded a Trade row for a fill.
    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, entry_order_id, hedge_order_id, entry_venue, hedge_venue,
                matched_size, entry_price, hedge_price, fees_estimate, estimated_pnl, created_at
             FROM trades ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("loading trades")?;
        Ok(rows)
    }
}

fn row_to_order(row: &rusqlite::Row) -> rusqlite::Result<Order> {
    let side: String = row.get(5)?;
    let order_type: String = row.get(6)?;
    let status: String = row.get(10)?;
    let role: String = row.get(11)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(Order {
        client_order_id: row.get(0)?,
        venue_order_id: row.get(1)?,
        venue: row.get(2)?,
        account_id: row.get(3)?,
        market_id: row.get(4)?,
        side: parse_side(&side),
        order_type: parse_order_type(&order_type),
        price: row.get(7)?,
        requested_size: row.get(8)?,
        filled_size: row.get(9)?,
        status: OrderStatus::from_str(&status).unwrap_or(OrderStatus::Errored),
        role: parse_role(&role),
        parent_fill_id: row.get(12)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn order_type_str(ot: OrderType) -> &'static str {
    match ot {
        OrderType::Limit => "limit",
        OrderType::Market => "market",
        OrderType::Ioc => "ioc",
    }
}

fn parse_order_type(s: &str) -> OrderType {
    match s {
        "market" => OrderType::Market,
        "ioc" => OrderType::Ioc,
        _ => OrderType::Limit,
    }
}

fn role_str(role: OrderRole) -> &'static str {
    match role {
        OrderRole::Primary => "primary",
        OrderRole::Hedge => "hedge",
        OrderRole::DoubleA => "double_a",
        OrderRole::DoubleB => "double_b",
    }
}

fn parse_role(s: &str) -> OrderRole {
    match s {
        "hedge" => OrderRole::Hedge,
        "double_a" => OrderRole::DoubleA,
        "double_b" => OrderRole::DoubleB,
        _ => OrderRole::Primary,
    }
}

fn parse_side(s: &str) -> Side {
    if s.eq_ignore_ascii_case("buy") { Side::Buy } else { Side::Sell }
}

fn row_to_incident(row: &rusqlite::Row) -> rusqlite::Result<Incident> {
    let severity: String = row.get(1)?;
    let details: Option<String> = row.get(4)?;
    let created_at: String = row.get(6)?;

    Ok(Incident {
        id: row.get(0)?,
        severity: parse_severity(&severity),
        code: row.get(2)?,
        message: row.get(3)?,
        details: details.and_then(|d| serde_json::from_str(&d).ok()),
        pair_id: row.get(5)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    let created_at: String = row.get(10)?;
    Ok(Trade {
        id: row.get(0)?,
        entry_order_id: row.get(1)?,
        hedge_order_id: row.get(2)?,
        entry_venue: row.get(3)?,
        hedge_venue: row.get(4)?,
        matched_size: row.get(5)?,
        entry_price: row.get(6)?,
        hedge_price: row.get(7)?,
        fees_estimate: row.get(8)?,
        estimated_pnl: row.get(9)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "debug" => Severity::Debug,
        "warning" => Severity::Warning,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}

fn double_limit_state_str(state: DoubleLimitState) -> &'static str {
    state.as_str()
}

fn parse_double_limit_state(s: &str) -> DoubleLimitState {
    match s {
        "triggered" => DoubleLimitState::Triggered,
        "cancelling" => DoubleLimitState::Cancelling,
        "resolved" => DoubleLimitState::Resolved,
        "failed" => DoubleLimitState::Failed,
        _ => DoubleLimitState::Armed,
    }
}

fn row_to_double_limit(row: &rusqlite::Row) -> rusqlite::Result<DoubleLimit> {
    let state: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(DoubleLimit {
        id: row.get(0)?,
        pair_id: row.get(1)?,
        order_a_ref: row.get(2)?,
        order_b_ref: row.get(3)?,
        state: parse_double_limit_state(&state),
        triggered_order_id: row.get(5)?,
        cancelled_order_id: row.get(6)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn severity_str(sev: Severity) -> String {
    sev.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderType;

    async fn gateway() -> PersistenceGateway {
        PersistenceGateway::open(":memory:").await.unwrap()
    }

    fn sample_order() -> Order {
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

    #[tokio::test]
    async fn upsert_and_load_order_round_trips() {
        let gw = gateway().await;
        let order = sample_order();
        gw.upsert_order(&order).await.unwrap();

        let loaded = gw.get_order(&order.client_order_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::New);
        assert!((loaded.requested_size - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_fill_insert_is_rejected() {
        let gw = gateway().await;
        let fill = Fill {
            source_venue: "venue-a".into(),
            venue_order_id: "v1".into(),
            client_order_id: "p1-primary-1-abcd".into(),
            fill_id: Some("f1".into()),
            size: 30.0,
            price: 0.42,
            side: Side::Buy,
            ts: Utc::now(),
        };
        assert!(gw.insert_fill_if_new(&fill).await.unwrap());
        assert!(!gw.insert_fill_if_new(&fill).await.unwrap());
    }

    #[tokio::test]
    async fn load_non_terminal_orders_excludes_terminal_rows() {
        let gw = gateway().await;
        let live = sample_order();
        gw.upsert_order(&live).await.unwrap();

        let mut filled = sample_order();
        filled.client_order_id = "p1-primary-2-efgh".into();
        filled.status = OrderStatus::Filled;
        gw.upsert_order(&filled).await.unwrap();

        let loaded = gw.load_non_terminal_orders().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].client_order_id, live.client_order_id);
    }

    #[tokio::test]
    async fn pair_scoped_queries_ignore_other_pairs() {
        let gw = gateway().await;
        let live = sample_order();
        gw.upsert_order(&live).await.unwrap();

        let mut other_pair = sample_order();
        other_pair.client_order_id = "p2-primary-1-zzzz".into();
        gw.upsert_order(&other_pair).await.unwrap();

        assert_eq!(gw.count_live_orders_for_pair("p1").await.unwrap(), 1);
        assert_eq!(gw.count_live_orders_for_pair("p2").await.unwrap(), 1);
        assert_eq!(gw.count_live_orders_for_pair("p3").await.unwrap(), 0);

        assert!(gw.last_fill_time_for_pair("p1").await.unwrap().is_none());
        let fill = Fill {
            source_venue: "venue-a".into(),
            venue_order_id: "v1".into(),
            client_order_id: live.client_order_id.clone(),
            fill_id: Some("f1".into()),
            size: 30.0,
            price: 0.42,
            side: Side::Buy,
            ts: Utc::now(),
        };
        gw.insert_fill_if_new(&fill).await.unwrap();
        assert!(gw.last_fill_time_for_pair("p1").await.unwrap().is_some());
        assert!(gw.last_fill_time_for_pair("p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn migrations_are_applied_exactly_once_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hedge.db");
        let path_str = path.to_str().unwrap();

        let gw1 = PersistenceGateway::open(path_str).await.unwrap();
        gw1.upsert_order(&sample_order()).await.unwrap();
        drop(gw1);

        let gw2 = PersistenceGateway::open(path_str).await.unwrap();
        let loaded = gw2.get_order("p1-primary-1-abcd").await.unwrap();
        assert!(loaded.is_some());
    }
}
