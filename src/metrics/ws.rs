//! WebSocket fan-out of metrics snapshots.
//!
//! A single broadcaster task ticks twice a second and pushes filtered
//! snapshots to each connected client whose interval has elapsed, together
//! with a `deltas` block against that client's previous snapshot. Client
//! sends go through unbounded channels so the broadcaster never blocks on a
//! slow socket; the socket task owns the actual write and a client is
//! dropped on its first send failure.

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Broadcaster tick period.
const TICK: Duration = Duration::from_millis(500);
/// Default per-client update interval when the subscription does not set one.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Subscription filters; unset fields mean "everything".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Filters {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    /// One of `throughput`, `latency`, `cache`, `streaming`, `queue`,
    /// `error`, `all`.
    pub metric_type: Option<String>,
    /// Update interval in seconds.
    pub interval: Option<f64>,
}

/// Builds a (possibly filtered) metrics snapshot on demand.
pub type SnapshotFn = Arc<dyn Fn(&Filters) -> Value + Send + Sync>;

struct Client {
    tx: mpsc::UnboundedSender<String>,
    filters: Filters,
    interval: Duration,
    next_due: Instant,
    last_snapshot: Option<Value>,
}

pub struct MetricsStreamer {
    snapshot_fn: SnapshotFn,
    clients: Mutex<HashMap<u64, Client>>,
    next_id: AtomicU64,
}

impl MetricsStreamer {
    pub fn new(snapshot_fn: SnapshotFn) -> Arc<Self> {
        Arc::new(Self {
            snapshot_fn,
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a client and hand back its id plus the message stream the
    /// socket task should forward. The first message is the full
    /// `historical_data` snapshot.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let initial = json!({
            "type": "historical_data",
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "data": (self.snapshot_fn)(&Filters::default()),
        });
        let _ = tx.send(initial.to_string());

        self.clients.lock().insert(
            id,
            Client {
                tx,
                filters: Filters::default(),
                interval: DEFAULT_INTERVAL,
                next_due: Instant::now(),
                last_snapshot: None,
            },
        );
        tracing::debug!(client = id, "metrics client connected");
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        if self.clients.lock().remove(&id).is_some() {
            tracing::debug!(client = id, "metrics client disconnected");
        }
    }

    /// Apply a `subscribe` message. Repeated subscriptions union: fields set
    /// in the new filters override, unset fields keep their current value.
    pub fn subscribe(&self, id: u64, filters: Filters) {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get_mut(&id) {
            if filters.endpoint.is_some() {
                client.filters.endpoint = filters.endpoint;
            }
            if filters.model.is_some() {
                client.filters.model = filters.model;
            }
            if filters.metric_type.is_some() {
                client.filters.metric_type = filters.metric_type;
            }
            if let Some(interval) = filters.interval {
                client.interval = Duration::from_secs_f64(interval.clamp(0.1, 60.0));
                client.filters.interval = Some(interval);
            }
            // Re-send promptly under the new view.
            client.next_due = Instant::now();
            client.last_snapshot = None;
        }
    }

    /// Apply an `unsubscribe` message: back to defaults.
    pub fn unsubscribe(&self, id: u64) {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get_mut(&id) {
            client.filters = Filters::default();
            client.interval = DEFAULT_INTERVAL;
            client.last_snapshot = None;
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// One broadcaster pass; returns how many clients were sent to.
    /// Exposed for tests; `run` drives this on a timer.
    pub fn broadcast_due(&self) -> usize {
        let now = Instant::now();
        let mut sent = 0;
        let mut dead = Vec::new();
        let mut clients = self.clients.lock();

        for (id, client) in clients.iter_mut() {
            if client.next_due > now {
                continue;
            }
            let data = (self.snapshot_fn)(&client.filters);
            let deltas = client
                .last_snapshot
                .as_ref()
                .map(|previous| compute_deltas(previous, &data))
                .unwrap_or_else(|| json!({}));

            let message = json!({
                "type": "metrics_update",
                "timestamp": chrono::Utc::now().timestamp_millis(),
                "data": data,
                "deltas": deltas,
            });

            if client.tx.send(message.to_string()).is_err() {
                dead.push(*id);
                continue;
            }
            client.last_snapshot = Some(data);
            client.next_due = now + client.interval;
            sent += 1;
        }

        for id in dead {
            clients.remove(&id);
            tracing::debug!(client = id, "dropping metrics client after send failure");
        }
        sent
    }

    /// Run the broadcast loop forever. Spawn this once at startup.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.broadcast_due();
        }
    }
}

/// Numeric field-by-field difference `new - old` over matching paths.
fn compute_deltas(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut out = serde_json::Map::new();
            for (key, new_value) in new_map {
                if let Some(old_value) = old_map.get(key) {
                    let delta = compute_deltas(old_value, new_value);
                    if !delta.is_null() {
                        out.insert(key.clone(), delta);
                    }
                }
            }
            if out.is_empty() {
                Value::Null
            } else {
                Value::Object(out)
            }
        }
        (Value::Number(old_n), Value::Number(new_n)) => {
            match (old_n.as_f64(), new_n.as_f64()) {
                (Some(o), Some(n)) => json!(n - o),
                _ => Value::Null,
            }
        }
        _ => Value::Null,
    }
}

/// Server reply to a client `ping`.
pub fn pong() -> String {
    json!({
        "type": "pong",
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
    .to_string()
}
