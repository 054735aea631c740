//! Last-known-good telemetry per PID.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use crate::protocol::pid::{Pid, Unit};

/// A decoded value for one PID.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryValue {
    /// The PID the value belongs to.
    pub pid: Pid,
    /// Decoded value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: Unit,
    /// Arrival time of the reply that carried it.
    pub observed_at: Instant,
}

impl TelemetryValue {
    /// Create a new value.
    pub fn new(pid: Pid, value: f64, unit: Unit, observed_at: Instant) -> Self {
        Self {
            pid,
            value,
            unit,
            observed_at,
        }
    }

    /// Time since the value was observed.
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.observed_at)
    }

    /// Convert to a wall-clock stamped snapshot.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let age = chrono::Duration::from_std(self.age()).unwrap_or_else(|_| chrono::Duration::zero());
        TelemetrySnapshot {
            pid: self.pid,
            value: self.value,
            unit: self.unit,
            observed_at: Utc::now() - age,
        }
    }
}

/// A [`TelemetryValue`] with a wall-clock timestamp, suitable for export.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetrySnapshot {
    /// The PID the value belongs to.
    pub pid: Pid,
    /// Decoded value.
    pub value: f64,
    /// Unit of `value`.
    pub unit: Unit,
    /// Wall-clock time the value was observed.
    pub observed_at: DateTime<Utc>,
}

/// Holds the latest value per PID.
///
/// Cloning gives another handle to the same store. Updates overwrite in
/// place; no history is kept.
#[derive(Debug, Clone)]
pub struct TelemetryStore {
    values: Arc<RwLock<HashMap<Pid, TelemetryValue>>>,
    update_tx: broadcast::Sender<TelemetryValue>,
}

impl TelemetryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(64);
        Self {
            values: Arc::new(RwLock::new(HashMap::new())),
            update_tx,
        }
    }

    /// Store `value`, replacing whatever was held for its PID.
    pub fn update(&self, value: TelemetryValue) {
        trace!("Telemetry {} = {} {}", value.pid, value.value, value.unit);
        self.values.write().insert(value.pid, value.clone());
        let _ = self.update_tx.send(value);
    }

    /// Latest value for `pid`, if one was ever stored.
    pub fn get(&self, pid: Pid) -> Option<TelemetryValue> {
        self.values.read().get(&pid).cloned()
    }

    /// Whether `pid` has no value younger than `max_age`.
    pub fn is_stale(&self, pid: Pid, max_age: Duration) -> bool {
        self.get(pid).map(|v| v.age() > max_age).unwrap_or(true)
    }

    /// All current values as wall-clock snapshots, ordered by PID.
    pub fn snapshot(&self) -> Vec<TelemetrySnapshot> {
        let mut snapshots: Vec<_> = self
            .values
            .read()
            .values()
            .map(TelemetryValue::snapshot)
            .collect();
        snapshots.sort_by_key(|s| s.pid);
        snapshots
    }

    /// Number of PIDs with a value.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether no value has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Subscribe to every update.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryValue> {
        self.update_tx.subscribe()
    }
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}
