//! Reconciler (spec §4.5).
//!
//! Merges push (websocket) and pull (REST polling) fill streams into a
//! canonical, deduplicated `Fill` sequence, one per order, strictly
//! monotonic in cumulative size. The dedup-key strategy is picked per
//! venue at construction (spec §9 "Fill-dedup key variability"): venues
//! that supply a `fill_id` dedupe on `(venue, order_id, fill_id)`; venues
//! that don't are tracked by a cumulative-filled watermark and only the
//! delta is emitted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::domain::{Fill, Incident, Side};
use crate::errors::{incident_code, Severity};
use crate::persistence::PersistenceGateway;

/// Canonical dedup key. `WithId` covers venues that supply `fill_id`;
/// `WatermarkDelta` covers venues that don't, keyed by the post-delta
/// cumulative size so repeated deltas at the same watermark collapse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FillKey {
    WithId { venue: String, venue_order_id: String, fill_id: String },
    WatermarkDelta { venue: String, venue_order_id: String, cumulative_after: u64 },
}

struct Lru {
    capacity: usize,
    order: VecDeque<FillKey>,
    members: std::collections::HashSet<FillKey>,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self { capacity, order: VecDeque::new(), members: std::collections::HashSet::new() }
    }

    /// Returns `true` if `key` was newly inserted (i.e. not a duplicate).
    fn insert_if_new(&mut self, key: FillKey) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.members.insert(key);
        true
    }
}

struct OrderWatermark {
    cumulative_filled: f64,
    requested_size: f64,
    last_seen: DateTime<Utc>,
}

/// Per-order reconciliation state plus the shared dedup LRU. One
/// `Reconciler` instance serves the whole process; fill emission is
/// serialized per-order by holding a per-`client_order_id` async mutex for
/// the whole read-check-write sequence of a single `ingest` call, so two
/// concurrent events for the same order can never both read the same
/// watermark and both commit against it.
pub struct Reconciler {
    persistence: Arc<PersistenceGateway>,
    lru: Mutex<Lru>,
    watermarks: Mutex<HashMap<String, OrderWatermark>>,
    order_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    stale_threshold: chrono::Duration,
}

/// Raw fill notification before dedup/canonicalization.
#[derive(Debug, Clone)]
pub struct RawFillEvent {
    pub venue: String,
    pub venue_order_id: String,
    pub client_order_id: String,
    pub fill_id: Option<String>,
    pub side: Side,
    pub price: f64,
    /// Size of this single delivery for push events; for pull polling this
    /// is the *new absolute* cumulative filled size observed on the venue.
    pub size_or_cumulative: f64,
    pub is_cumulative_snapshot: bool,
    pub ts: DateTime<Utc>,
}

impl Reconciler {
    pub fn new(persistence: Arc<PersistenceGateway>, expected_open_orders: usize, stale_threshold: chrono::Duration) -> Self {
        let capacity = (expected_open_orders * 10).max(256);
        Self {
            persistence,
            lru: Mutex::new(Lru::new(capacity)),
            watermarks: Mutex::new(HashMap::new()),
            order_locks: Mutex::new(HashMap::new()),
            stale_threshold,
        }
    }

    fn lock_for(&self, client_order_id: &str) -> Arc<AsyncMutex<()>> {
        self.order_locks
            .lock()
            .entry(client_order_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn track_order(&self, client_order_id: &str, requested_size: f64) {
        self.watermarks.lock().entry(client_order_id.to_string()).or_insert_with(|| OrderWatermark {
            cumulative_filled: 0.0,
            requested_size,
            last_seen: Utc::now(),
        });
    }

    /// Seeds an order's watermark from its persisted `filled_size` at
    /// startup (spec §1 "crash recovery"), so a fill arriving right after
    /// a restart is clamped and deduped against the correct baseline
    /// instead of starting from zero.
    pub fn rehydrate_watermark(&self, client_order_id: &str, cumulative_filled: f64, requested_size: f64) {
        self.watermarks.lock().insert(
            client_order_id.to_string(),
            OrderWatermark { cumulative_filled, requested_size, last_seen: Utc::now() },
        );
    }

    /// Ingests one raw event, returning `Some(Fill)` when it yields a new
    /// canonical fill, `None` when it is a duplicate or a zero-size delta.
    pub async fn ingest(&self, event: RawFillEvent) -> anyhow::Result<Option<Fill>> {
        // Held for the entire read-compute-write sequence below, including
        // the persistence insert: two concurrent fills for the same order
        // (distinct fill_ids arriving at once) must never both read the
        // same `cumulative_filled` and both clamp/commit against it.
        let lock = self.lock_for(&event.client_order_id);
        let _guard = lock.lock().await;

        let now_in_order_delta;
        {
            let mut watermarks = self.watermarks.lock();
            let wm = watermarks
                .entry(event.client_order_id.clone())
                .or_insert_with(|| OrderWatermark {
                    cumulative_filled: 0.0,
                    requested_size: f64::MAX,
                    last_seen: event.ts,
                });
            wm.last_seen = event.ts;

            let delta = if event.is_cumulative_snapshot {
                (event.size_or_cumulative - wm.cumulative_filled).max(0.0)
            } else {
                event.size_or_cumulative
            };

            if delta <= 0.0 {
                return Ok(None);
            }

            let projected = (wm.cumulative_filled + delta).min(wm.requested_size);
            now_in_order_delta = projected - wm.cumulative_filled;
            if now_in_order_delta <= 0.0 {
                return Ok(None);
            }
        }

        let key = match &event.fill_id {
            Some(fill_id) => FillKey::WithId {
                venue: event.venue.clone(),
                venue_order_id: event.venue_order_id.clone(),
                fill_id: fill_id.clone(),
            },
            None => {
                let watermarks = self.watermarks.lock();
                let cumulative_after =
                    (watermarks[&event.client_order_id].cumulative_filled + now_in_order_delta) as u64;
                FillKey::WatermarkDelta {
                    venue: event.venue.clone(),
                    venue_order_id: event.venue_order_id.clone(),
                    cumulative_after,
                }
            }
        };

        if !self.lru.lock().insert_if_new(key) {
            return Ok(None);
        }

        {
            let mut watermarks = self.watermarks.lock();
            if let Some(wm) = watermarks.get_mut(&event.client_order_id) {
                wm.cumulative_filled += now_in_order_delta;
            }
        }

        let fill = Fill {
            source_venue: event.venue,
            venue_order_id: event.venue_order_id,
            client_order_id: event.client_order_id,
            fill_id: event.fill_id,
            size: now_in_order_delta,
            price: event.price,
            side: event.side,
            ts: event.ts,
        };

        if !self.persistence.insert_fill_if_new(&fill).await? {
            return Ok(None);
        }

        Ok(Some(fill))
    }

    /// Scans tracked orders for silence beyond `stale_threshold` among
    /// still-open orders, logging `STALE_FILL_SOURCE` incidents. Call
    /// periodically from a supervisor tick; does not itself schedule.
    pub async fn check_stale_sources(&self, open_order_ids: &[String]) -> anyhow::Result<()> {
        let now = Utc::now();
        let stale: Vec<String> = {
            let watermarks = self.watermarks.lock();
            open_order_ids
                .iter()
                .filter(|id| {
                    watermarks
                        .get(id.as_str())
                        .map(|wm| now - wm.last_seen > self.stale_threshold)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };

        for client_order_id in stale {
            warn!(%client_order_id, "fill source stale");
            self.persistence
                .record_incident(&Incident {
                    id: None,
                    severity: Severity::Warning,
                    code: incident_code::STALE_FILL_SOURCE.to_string(),
                    message: format!("no fill activity observed for {client_order_id} within threshold"),
                    details: None,
                    pair_id: None,
                    created_at: now,
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn reconciler() -> Reconciler {
        let persistence = Arc::new(PersistenceGateway::open(":memory:").await.unwrap());
        Reconciler::new(persistence, 10, chrono::Duration::seconds(30))
    }

    fn push_event(fill_id: &str, size: f64) -> RawFillEvent {
        RawFillEvent {
            venue: "venue-a".into(),
            venue_order_id: "v1".into(),
            client_order_id: "p1-primary-1-abcd".into(),
            fill_id: Some(fill_id.into()),
            side: Side::Buy,
            price: 0.42,
            size_or_cumulative: size,
            is_cumulative_snapshot: false,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_websocket_fill_emits_once() {
        let r = reconciler().await;
        r.track_order("p1-primary-1-abcd", 100.0);

        let first = r.ingest(push_event("f1", 50.0)).await.unwrap();
        assert!(first.is_some());

        let second = r.ingest(push_event("f1", 50.0)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn polling_snapshot_emits_only_the_delta() {
        let r = reconciler().await;
        r.track_order("p1-primary-1-abcd", 100.0);

        let poll_event = |cumulative: f64| RawFillEvent {
            venue: "venue-b".into(),
            venue_order_id: "v2".into(),
            client_order_id: "p1-primary-1-abcd".into(),
            fill_id: None,
            side: Side::Buy,
            price: 0.42,
            size_or_cumulative: cumulative,
            is_cumulative_snapshot: true,
            ts: Utc::now(),
        };

        let first = r.ingest(poll_event(30.0)).await.unwrap().unwrap();
        assert!((first.size - 30.0).abs() < 1e-9);

        let second = r.ingest(poll_event(70.0)).await.unwrap().unwrap();
        assert!((second.size - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn never_emits_past_requested_size() {
        let r = reconciler().await;
        r.track_order("p1-primary-1-abcd", 100.0);

        let first = r.ingest(push_event("f1", 80.0)).await.unwrap().unwrap();
        assert!((first.size - 80.0).abs() < 1e-9);

        let second = r.ingest(push_event("f2", 50.0)).await.unwrap().unwrap();
        assert!((second.size - 20.0).abs() < 1e-9);
    }
}
