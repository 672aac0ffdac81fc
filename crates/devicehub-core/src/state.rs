//! Reactive state cells: [`StateValue`], [`Quality`], and [`Cell`].
//!
//! A `StateValue<T>` bundles a value with its provenance (when it was
//! produced at the source, when it was observed here) and a [`Quality`]
//! flag. `Cell<T>` is the mutable, observable container that device
//! properties and derived graph nodes are built from.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;

/// Health of a [`StateValue`].
///
/// `Quality` is ordered worst-to-best for [`Quality::combine`]: `BAD` beats
/// `UNCERTAIN` beats `GOOD`, so a derived value inherits the worst quality of
/// its inputs.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Quality {
    Good,
    Uncertain { code: Option<String> },
    Bad { code: Option<String> },
}

impl Quality {
    pub fn good() -> Self {
        Quality::Good
    }

    pub fn bad(code: impl Into<String>) -> Self {
        Quality::Bad { code: Some(code.into()) }
    }

    pub fn uncertain(code: impl Into<String>) -> Self {
        Quality::Uncertain { code: Some(code.into()) }
    }

    fn rank(&self) -> u8 {
        match self {
            Quality::Bad { .. } => 0,
            Quality::Uncertain { .. } => 1,
            Quality::Good => 2,
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }

    /// Worst-of-two combination, used when deriving a value from multiple
    /// source cells.
    pub fn combine(&self, other: &Quality) -> Quality {
        if self.rank() <= other.rank() {
            self.clone()
        } else {
            other.clone()
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Good => write!(f, "GOOD"),
            Quality::Uncertain { code: Some(c) } => write!(f, "UNCERTAIN({c})"),
            Quality::Uncertain { code: None } => write!(f, "UNCERTAIN"),
            Quality::Bad { code: Some(c) } => write!(f, "BAD({c})"),
            Quality::Bad { code: None } => write!(f, "BAD"),
        }
    }
}

/// A timestamped, quality-tagged value.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StateValue<T> {
    pub value: T,
    /// When the value was produced at its origin (e.g. the device itself).
    pub origin_time: DateTime<Utc>,
    /// When this process observed/recorded the value.
    pub server_time: DateTime<Utc>,
    pub quality: Quality,
}

impl<T> StateValue<T> {
    pub fn new(value: T, origin_time: DateTime<Utc>, server_time: DateTime<Utc>, quality: Quality) -> Self {
        Self {
            value,
            origin_time,
            server_time,
            quality,
        }
    }

    /// A good-quality value observed now, with origin time equal to server time.
    pub fn now(value: T, now: DateTime<Utc>) -> Self {
        Self {
            value,
            origin_time: now,
            server_time: now,
            quality: Quality::Good,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StateValue<U> {
        StateValue {
            value: f(self.value),
            origin_time: self.origin_time,
            server_time: self.server_time,
            quality: self.quality,
        }
    }
}

/// A mutable, observable reactive cell.
///
/// Reads are lock-free via `watch::Receiver::borrow`; writers serialize
/// through the `watch::Sender`. Cloning a `Cell` shares the same underlying
/// state (it is reference-counted), matching how blueprint-declared
/// properties are shared between the device runtime and derived-graph
/// subscribers.
#[derive(Clone)]
pub struct Cell<T> {
    tx: Arc<watch::Sender<StateValue<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Cell<T> {
    pub fn new(initial: StateValue<T>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Current value, without establishing a subscription.
    pub fn get(&self) -> StateValue<T> {
        self.tx.borrow().clone()
    }

    /// Replace the value outright.
    pub fn set(&self, value: StateValue<T>) {
        let _ = self.tx.send(value);
    }

    /// Update the payload while keeping the current quality, stamping
    /// `server_time` to `now`.
    pub fn update_value(&self, value: T, origin_time: DateTime<Utc>, now: DateTime<Utc>) {
        self.tx.send_modify(|current| {
            current.value = value;
            current.origin_time = origin_time;
            current.server_time = now;
        });
    }

    /// Update only the quality flag, leaving value/timestamps untouched
    /// except for bumping `server_time`.
    pub fn update_quality(&self, quality: Quality, now: DateTime<Utc>) {
        self.tx.send_modify(|current| {
            current.quality = quality;
            current.server_time = now;
        });
    }

    /// A receiver that observes every subsequent change to this cell.
    pub fn subscribe(&self) -> watch::Receiver<StateValue<T>> {
        self.tx.subscribe()
    }
}

/// A named, type-erased read side of a [`Cell`], used by the reactive graph
/// and property registry where cells of heterogeneous `T` must be stored
/// together.
pub trait AnyCellReader: Send + Sync {
    fn current_quality(&self) -> Quality;
    fn current_json(&self) -> serde_json::Value;
}

impl<T> AnyCellReader for Cell<T>
where
    T: Clone + Send + Sync + serde::Serialize + 'static,
{
    fn current_quality(&self) -> Quality {
        self.get().quality
    }

    fn current_json(&self) -> serde_json::Value {
        serde_json::to_value(self.get().value).unwrap_or(serde_json::Value::Null)
    }
}

/// Registry of named, type-erased cells for a single device, used by the
/// runtime to answer generic `readProperty`/introspection calls without
/// knowing every property's Rust type at the call site.
#[derive(Default)]
pub struct CellRegistry {
    cells: RwLock<std::collections::HashMap<String, Arc<dyn AnyCellReader>>>,
}

impl CellRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, cell: Arc<dyn AnyCellReader>) {
        self.cells.write().insert(name.into(), cell);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnyCellReader>> {
        self.cells.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.cells.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_combine_picks_worst() {
        assert_eq!(Quality::Good.combine(&Quality::bad("x")), Quality::bad("x"));
        assert_eq!(Quality::good().combine(&Quality::good()), Quality::good());
        assert_eq!(
            Quality::uncertain("a").combine(&Quality::bad("b")),
            Quality::bad("b")
        );
    }

    #[test]
    fn cell_update_value_bumps_server_time_only() {
        let t0 = Utc::now();
        let cell = Cell::new(StateValue::now(1i64, t0));
        let t1 = t0 + chrono::Duration::seconds(5);
        cell.update_value(2, t0, t1);
        let v = cell.get();
        assert_eq!(v.value, 2);
        assert_eq!(v.origin_time, t0);
        assert_eq!(v.server_time, t1);
        assert_eq!(v.quality, Quality::Good);
    }

    #[test]
    fn cell_subscribe_observes_changes() {
        let t0 = Utc::now();
        let cell = Cell::new(StateValue::now(1i64, t0));
        let mut rx = cell.subscribe();
        cell.update_value(7, t0, t0);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().value, 7);
    }

    #[test]
    fn registry_roundtrip() {
        let t0 = Utc::now();
        let cell: Arc<dyn AnyCellReader> = Arc::new(Cell::new(StateValue::now(42i64, t0)));
        let registry = CellRegistry::new();
        registry.insert("count", cell);
        assert_eq!(registry.names(), vec!["count".to_string()]);
        assert!(registry.get("count").unwrap().current_quality().is_good());
    }
}
