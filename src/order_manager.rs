//! Order Manager.
//!
//! Owns the authoritative in-memory `Order` rows (backed by the
//! Persistence Gateway), drives the FSM, and coordinates the Double-Limit
//! protocol. Per-order and per-pair locks are plain
//! `Arc<parking_lot::Mutex<()>>` registries keyed by id — deliberately not
//! `dashmap`; `parking_lot::Mutex` + `HashMap` is plenty at this scale.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::account_pool::AccountPool;
use crate::backoff::BackoffPolicy;
use crate::domain::{DoubleLimit, DoubleLimitState, Order, OrderRole, OrderStatus, OrderType, Side};
use crate::errors::{incident_code, VenueError};
use crate::fsm::{self, Event, Outcome};
use crate::persistence::PersistenceGateway;
use crate::risk::{AccountState, ProposedOrder, RiskManager, Verdict};
use crate::venue::{OrderSpec as VenueOrderSpec, VenueAdapter};

/// What the caller wants to place; venue/account are resolved by the
/// caller and passed in explicitly so the Order Manager stays
/// venue-agnostic.
#[derive(Debug, Clone)]
pub struct PlaceRequest {
    pub pair_id: String,
    pub venue: String,
    pub account_id: String,
    pub market_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub size: f64,
    pub role: OrderRole,
    pub parent_fill_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum PlaceError {
    RiskDenied(crate::errors::RiskDenyReason),
    VenueRejected(String),
}

impl std::fmt::Display for PlaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaceError::RiskDenied(reason) => write!(f, "risk manager denied order: {reason}"),
            PlaceError::VenueRejected(reason) => write!(f, "venue rejected order: {reason}"),
        }
    }
}

impl std::error::Error for PlaceError {}

pub struct OrderManager {
    venues: HashMap<String, Arc<dyn VenueAdapter>>,
    persistence: Arc<PersistenceGateway>,
    risk: Arc<RiskManager>,
    account_pool: Arc<AccountPool>,
    backoff: BackoffPolicy,
    double_limit_enabled: bool,
    /// When set, `place`/`cancel` never call the Venue Adapter: placements
    /// are synthesized as immediate acks under a `dryrun-` venue_order_id
    /// (spec §4.7 "Dry-run ... deterministic synthetic acks, no network, no
    /// fills"). Persistence still runs so dry-run orders are auditable.
    dry_run: bool,
    orders: AsyncMutex<HashMap<String, Order>>,
    order_locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// DoubleLimit rows, owned by the Order Manager until RESOLVED/FAILED
    /// (spec §3 "Ownership"), indexed both by id and by each leg's
    /// `client_order_id` so `on_fill` can find the sibling without the
    /// caller threading a `DoubleLimit` handle through.
    double_limits: AsyncMutex<HashMap<String, DoubleLimit>>,
    double_limit_index: AsyncMutex<HashMap<String, String>>,
}

impl OrderManager {
    pub fn new(
        venues: HashMap<String, Arc<dyn VenueAdapter>>,
        persistence: Arc<PersistenceGateway>,
        risk: Arc<RiskManager>,
        account_pool: Arc<AccountPool>,
        double_limit_enabled: bool,
        dry_run: bool,
    ) -> Self {
        Self {
            venues,
            persistence,
            risk,
            account_pool,
            backoff: BackoffPolicy::default(),
            double_limit_enabled,
            dry_run,
            orders: AsyncMutex::new(HashMap::new()),
            order_locks: parking_lot::Mutex::new(HashMap::new()),
            double_limits: AsyncMutex::new(HashMap::new()),
            double_limit_index: AsyncMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, client_order_id: &str) -> Arc<AsyncMutex<()>> {
        self.order_locks
            .lock()
            .entry(client_order_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn generate_client_order_id(pair_id: &str, role: OrderRole) -> String {
        let role_tag = match role {
            OrderRole::Primary => "primary",
            OrderRole::Hedge => "hedge",
            OrderRole::DoubleA => "double_a",
            OrderRole::DoubleB => "double_b",
        };
        let monotonic_ts = Utc::now().timestamp_millis();
        let short_random = Uuid::new_v4().simple().to_string()[..8].to_string();
        format!("{pair_id}-{role_tag}-{monotonic_ts}-{short_random}")
    }

    fn venue_for(&self, venue: &str) -> Option<Arc<dyn VenueAdapter>> {
        self.venues.get(venue).cloned()
    }

    /// Assigns a client_order_id, persists the NEW row, gates via Risk,
    /// then invokes the Venue Adapter with retry-on-transient. Returns the
    /// client_order_id regardless of outcome — callers inspect order
    /// status to learn whether placement succeeded.
    pub async fn place(&self, req: PlaceRequest, account_state: AccountState) -> anyhow::Result<String> {
        let client_order_id = Self::generate_client_order_id(&req.pair_id, req.role);
        self.place_with_id(client_order_id.clone(), req, account_state).await?;
        Ok(client_order_id)
    }

    /// Same as `place`, but takes an already-assigned `client_order_id`
    /// rather than generating one. Lets a caller (e.g.
    /// `place_double_limit`) durably record the id before this function
    /// ever touches the venue.
    async fn place_with_id(&self, client_order_id: String, req: PlaceRequest, account_state: AccountState) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut order = Order {
            client_order_id: client_order_id.clone(),
            venue_order_id: None,
            venue: req.venue.clone(),
            account_id: req.account_id.clone(),
            market_id: req.market_id.clone(),
            side: req.side,
            order_type: req.order_type,
            price: req.price,
            requested_size: req.size,
            filled_size: 0.0,
            status: OrderStatus::New,
            role: req.role,
            parent_fill_id: req.parent_fill_id.clone(),
            created_at: now,
            updated_at: now,
        };

        self.persistence.upsert_order(&order).await?;
        self.orders.lock().await.insert(client_order_id.clone(), order.clone());

        let proposed = ProposedOrder {
            requested_size: req.size,
            price: req.price.unwrap_or(0.0),
            projected_exposure_delta: req.size * req.price.unwrap_or(0.0),
        };
        if let Verdict::Deny(reason) = self.risk.evaluate(&account_state, &proposed, now) {
            debug!(%client_order_id, %reason, "risk manager denied order");
            // A denied order never reaches the venue; it must still leave
            // NEW for a terminal state or it would count as live exposure
            // forever (live_order_ids / stale-source sweep).
            self.apply_event(&mut order, Event::PlaceRejected { reason: reason.to_string() }).await?;
            self.orders.lock().await.insert(client_order_id.clone(), order);
            return Err(PlaceError::RiskDenied(reason).into());
        }

        if self.dry_run {
            let venue_order_id = format!("dryrun-{client_order_id}");
            self.apply_event(&mut order, Event::PlaceAcked { venue_order_id }).await?;
            info!(%client_order_id, "dry-run order synthesized, no venue call");
            self.orders.lock().await.insert(client_order_id.clone(), order);
            return Ok(());
        }

        let Some(adapter) = self.venue_for(&req.venue) else {
            return Err(anyhow::anyhow!("no venue adapter registered for {}", req.venue));
        };

        if !self.account_pool.rate_limiter.try_acquire(&req.account_id) {
            // Rate-limit exhaustion is treated as a transient condition; the
            // caller's own scheduling loop will try again next tick.
            warn!(%client_order_id, account_id = %req.account_id, "rate limit budget exhausted");
            return Err(VenueError::Transient("rate limit budget exhausted".into()).into());
        }

        let spec = VenueOrderSpec {
            client_order_id: client_order_id.clone(),
            account_id: req.account_id.clone(),
            market_id: req.market_id.clone(),
            side: req.side,
            price: req.price,
            size: req.size,
        };

        match self.place_with_retry(adapter.as_ref(), spec).await {
            Ok(venue_order_id) => {
                self.apply_event(&mut order, Event::PlaceAcked { venue_order_id }).await?;
                info!(%client_order_id, "order placed and acked");
            }
            Err(VenueError::Rejected(reason)) | Err(VenueError::Transient(reason)) => {
                self.apply_event(&mut order, Event::PlaceRejected { reason: reason.clone() }).await?;
                warn!(%client_order_id, %reason, "order placement failed");
            }
        }

        self.orders.lock().await.insert(client_order_id.clone(), order);
        Ok(())
    }

    async fn place_with_retry(
        &self,
        adapter: &dyn VenueAdapter,
        spec: VenueOrderSpec,
    ) -> Result<String, VenueError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match adapter.place(spec.clone()).await {
                Ok(id) => return Ok(id),
                Err(VenueError::Rejected(reason)) => return Err(VenueError::Rejected(reason)),
                Err(VenueError::Transient(reason)) => {
                    if attempt >= self.backoff.max_attempts {
                        return Err(VenueError::Transient(reason));
                    }
                    tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                }
            }
        }
    }

    /// No-op if the order is already terminal.
    pub async fn cancel(&self, client_order_id: &str) -> anyhow::Result<()> {
        let lock = self.lock_for(client_order_id);
        let _guard = lock.lock().await;

        let mut order = {
            let orders = self.orders.lock().await;
            match orders.get(client_order_id) {
                Some(o) => o.clone(),
                None => return Ok(()),
            }
        };

        if order.status.is_terminal() {
            return Ok(());
        }

        self.apply_event(&mut order, Event::CancelRequested).await?;

        if self.dry_run {
            self.apply_event(&mut order, Event::CancelAcked).await?;
            self.orders.lock().await.insert(client_order_id.to_string(), order);
            return Ok(());
        }

        let Some(adapter) = self.venue_for(&order.venue) else {
            return Err(anyhow::anyhow!("no venue adapter registered for {}", order.venue));
        };
        let Some(venue_order_id) = order.venue_order_id.clone() else {
            // Never acked; nothing to cancel on the venue side.
            self.apply_event(&mut order, Event::CancelAcked).await?;
            self.orders.lock().await.insert(client_order_id.to_string(), order);
            return Ok(());
        };

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match adapter.cancel(&venue_order_id).await {
                Ok(()) => break Ok(()),
                Err(VenueError::Transient(reason)) if attempt < self.backoff.max_attempts => {
                    tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                    continue;
                }
                Err(err) => break Err(err),
            }
        };

        match outcome {
            Ok(()) => {
                self.apply_event(&mut order, Event::CancelAcked).await?;
            }
            Err(err) => {
                error!(%client_order_id, %err, "cancel exhausted retries");
                self.apply_event(&mut order, Event::CancelRejected { reason: err.to_string() }).await?;
            }
        }

        self.orders.lock().await.insert(client_order_id.to_string(), order);
        Ok(())
    }

    /// Places both legs atomically from the caller's view: the
    /// DoubleLimit row is written ARMED before either placement, then A,
    /// then B. Either placement failing best-effort cancels the other leg
    /// and marks the pair FAILED. Falls back to placing only leg A when
    /// double-limit is disabled.
    pub async fn place_double_limit(
        &self,
        pair_id: &str,
        spec_a: PlaceRequest,
        spec_b: PlaceRequest,
        account_state_a: AccountState,
        account_state_b: AccountState,
    ) -> anyhow::Result<Option<DoubleLimit>> {
        if !self.double_limit_enabled {
            self.place(spec_a, account_state_a).await?;
            return Ok(None);
        }

        // spec §4.4: both client_order_ids are assigned up front so the
        // ARMED row — linking the two legs — is durable before either leg
        // is placed. A crash right after A's venue ack can never leave an
        // orphaned live order: the row that names it as a sibling already
        // exists on disk.
        let order_a_id = Self::generate_client_order_id(pair_id, spec_a.role);
        let order_b_id = Self::generate_client_order_id(pair_id, spec_b.role);

        let now = Utc::now();
        let mut dl = DoubleLimit {
            id: Uuid::new_v4().to_string(),
            pair_id: pair_id.to_string(),
            order_a_ref: order_a_id.clone(),
            order_b_ref: order_b_id.clone(),
            state: DoubleLimitState::Armed,
            triggered_order_id: None,
            cancelled_order_id: None,
            created_at: now,
            updated_at: now,
        };

        self.persistence.upsert_double_limit(&dl).await?;
        self.double_limit_index.lock().await.insert(order_a_id.clone(), dl.id.clone());
        self.double_limit_index.lock().await.insert(order_b_id.clone(), dl.id.clone());
        self.double_limits.lock().await.insert(dl.id.clone(), dl.clone());

        if let Err(err) = self.place_with_id(order_a_id.clone(), spec_a, account_state_a).await {
            warn!(%pair_id, %err, "double-limit leg A failed");
            dl.state = DoubleLimitState::Failed;
            dl.updated_at = Utc::now();
            self.persistence.upsert_double_limit(&dl).await?;
            self.double_limits.lock().await.insert(dl.id.clone(), dl.clone());
            return Ok(Some(dl));
        }

        if let Err(err) = self.place_with_id(order_b_id.clone(), spec_b, account_state_b).await {
            warn!(%pair_id, %err, "double-limit leg B failed, cancelling leg A");
            self.cancel(&order_a_id).await.ok();
            dl.state = DoubleLimitState::Failed;
            dl.updated_at = Utc::now();
            self.persistence.upsert_double_limit(&dl).await?;
            self.double_limits.lock().await.insert(dl.id.clone(), dl.clone());
            return Ok(Some(dl));
        }

        Ok(Some(dl))
    }

    /// Routes a canonical Fill to the FSM. When the order is a
    /// DoubleLimit leg, the sibling cancel is issued before returning, so
    /// the caller (Hedger) places the hedge only after the double-window
    /// is minimized. The DoubleLimit row is looked up from the Order
    /// Manager's own registry (spec §3 "Ownership": DoubleLimit records
    /// are owned by Order Manager until RESOLVED/FAILED) rather than
    /// threaded in by the caller.
    pub async fn on_fill(&self, client_order_id: &str, size: f64) -> anyhow::Result<()> {
        let lock = self.lock_for(client_order_id);
        let _guard = lock.lock().await;

        let mut order = {
            let orders = self.orders.lock().await;
            orders
                .get(client_order_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown order {client_order_id}"))?
        };

        self.apply_event(&mut order, Event::FillReceived { size }).await?;
        self.orders.lock().await.insert(client_order_id.to_string(), order);

        let dl_id = self.double_limit_index.lock().await.get(client_order_id).cloned();
        if let Some(dl_id) = dl_id {
            // The ARMED -> TRIGGERED claim must be a single atomic
            // check-and-set over the `double_limits` map: if a concurrent
            // fill on the sibling leg read ARMED before this one wrote
            // TRIGGERED, the DoubleLimit invariant ("exactly one of A,B may
            // transition to TRIGGERED") would be violated. Holding the lock
            // across the whole read-check-write closes that window.
            let mut dl = {
                let mut double_limits = self.double_limits.lock().await;
                match double_limits.get(&dl_id).cloned() {
                    Some(mut dl) if dl.state == DoubleLimitState::Armed => {
                        dl.state = DoubleLimitState::Triggered;
                        dl.triggered_order_id = Some(client_order_id.to_string());
                        dl.updated_at = Utc::now();
                        double_limits.insert(dl.id.clone(), dl.clone());
                        dl
                    }
                    _ => return Ok(()), // already triggered/resolved by a concurrent fill
                }
            };

            // Cross-order operations acquire locks in a total order by
            // client_order_id to prevent deadlock (spec §5); the sibling
            // cancel below takes the sibling's own per-order lock, distinct
            // from the one this call already holds on `client_order_id`.
            let sibling = if dl.order_a_ref == client_order_id { dl.order_b_ref.clone() } else { dl.order_a_ref.clone() };

            self.persistence.upsert_double_limit(&dl).await?;

            dl.state = DoubleLimitState::Cancelling;
            self.persistence.upsert_double_limit(&dl).await?;
            self.double_limits.lock().await.insert(dl.id.clone(), dl.clone());
            self.cancel(&sibling).await?;

            dl.cancelled_order_id = Some(sibling);
            dl.state = DoubleLimitState::Resolved;
            dl.updated_at = Utc::now();
            self.persistence.upsert_double_limit(&dl).await?;
            self.double_limits.lock().await.insert(dl.id.clone(), dl.clone());
        }

        Ok(())
    }

    pub async fn get_order(&self, client_order_id: &str) -> Option<Order> {
        self.orders.lock().await.get(client_order_id).cloned()
    }

    /// Resolves a `(venue, venue_order_id)` pair back to the tracked
    /// `Order`, used by the fill-routing pipeline to translate a venue's
    /// own identifier into the stable `client_order_id` key.
    pub async fn find_by_venue_order_id(&self, venue: &str, venue_order_id: &str) -> Option<Order> {
        self.orders
            .lock()
            .await
            .values()
            .find(|o| o.venue == venue && o.venue_order_id.as_deref() == Some(venue_order_id))
            .cloned()
    }

    pub async fn double_limit_for(&self, client_order_id: &str) -> Option<DoubleLimit> {
        let dl_id = self.double_limit_index.lock().await.get(client_order_id).cloned()?;
        self.double_limits.lock().await.get(&dl_id).cloned()
    }

    /// Count of non-terminal orders that represent real venue exposure.
    /// Under `dry_run`, synthetic orders never touch a venue, so this
    /// always reports 0 regardless of how many dry-run rows are tracked.
    pub async fn live_order_count(&self) -> usize {
        if self.dry_run {
            return 0;
        }
        self.orders
            .lock()
            .await
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    /// `client_order_id`s of every order not yet in a terminal state,
    /// fed to `Reconciler::check_stale_sources` by the root supervisor.
    pub async fn live_order_ids(&self) -> Vec<String> {
        self.orders
            .lock()
            .await
            .values()
            .filter(|o| !o.status.is_terminal())
            .map(|o| o.client_order_id.clone())
            .collect()
    }

    /// Repopulates the in-memory order/double-limit registries from
    /// persisted state at startup (spec §1 "crash recovery"). Without this,
    /// every order live before a restart is invisible to `get_order`/
    /// `on_fill` afterwards and is silently skipped by the fill pipeline
    /// forever.
    pub async fn rehydrate(&self, orders: Vec<Order>, double_limits: Vec<DoubleLimit>) {
        {
            let mut orders_map = self.orders.lock().await;
            for order in orders {
                orders_map.insert(order.client_order_id.clone(), order);
            }
        }

        let mut dl_map = self.double_limits.lock().await;
        let mut dl_index = self.double_limit_index.lock().await;
        for dl in double_limits {
            dl_index.insert(dl.order_a_ref.clone(), dl.id.clone());
            dl_index.insert(dl.order_b_ref.clone(), dl.id.clone());
            dl_map.insert(dl.id.clone(), dl);
        }
    }

    async fn apply_event(&self, order: &mut Order, event: Event) -> anyhow::Result<()> {
        match fsm::apply(order, event) {
            Outcome::Applied(event_row) => {
                self.persistence.append_order_event(&event_row).await?;
                self.persistence.upsert_order(order).await?;
                Ok(())
            }
            Outcome::Illegal { attempted, current } => {
                warn!(
                    client_order_id = %order.client_order_id,
                    attempted,
                    ?current,
                    "illegal FSM transition attempted"
                );
                self.persistence
                    .record_incident(&crate::domain::Incident {
                        id: None,
                        severity: crate::errors::Severity::Warning,
                        code: incident_code::ILLEGAL_TRANSITION.to_string(),
                        message: format!("illegal transition '{attempted}' from state {current:?}"),
                        details: None,
                        pair_id: None,
                        created_at: Utc::now(),
                    })
                    .await?;
                Ok(())
            }
        }
    }
}
