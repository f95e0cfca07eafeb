//! Per-key request coalescing.
//!
//! The first caller for a key runs the work; callers arriving while it is in
//! flight await the same result. Once the flight lands the key is cleared,
//! so later callers start a fresh one.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

/// Map of key to in-flight result cell.
#[derive(Debug)]
pub struct SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
{
    inflight: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless a flight for it is already running, in
    /// which case wait for that flight's result.
    ///
    /// If the running caller is cancelled, a waiting caller takes over.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = V>,
    {
        let cell = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let value = cell.get_or_init(work).await.clone();

        self.inflight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
        value
    }

    /// Keys with a flight currently registered.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}
