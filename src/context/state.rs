//! Server-wide shared key/value state.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

type Entry = Arc<dyn Any + Send + Sync>;

/// A cheaply-cloneable handle to key/value data that lives as long as the
/// server.
///
/// The same handle is given to every request, startup hook and shutdown hook.
/// Individual `insert`/`get`/`remove` calls are atomic, but nothing serializes
/// a read-modify-write sequence across calls: store a `Mutex` or an atomic
/// inside the entry when a handler needs that.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use switchyard::context::ServerState;
///
/// let state = ServerState::new();
/// state.insert("hits", AtomicU64::new(0));
///
/// let hits = state.get::<AtomicU64>("hits").unwrap();
/// hits.fetch_add(1, Ordering::Relaxed);
/// assert_eq!(state.get::<AtomicU64>("hits").unwrap().load(Ordering::Relaxed), 1);
/// ```
#[derive(Clone, Default)]
pub struct ServerState {
    entries: Arc<DashMap<String, Entry>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, returning `true` if an entry was replaced.
    pub fn insert<T>(&self, key: impl Into<String>, value: T) -> bool
    where
        T: Send + Sync + 'static,
    {
        self.entries.insert(key.into(), Arc::new(value)).is_some()
    }

    /// Returns the entry under `key` if it exists and holds a `T`.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = Arc::clone(self.entries.get(key)?.value());
        entry.downcast::<T>().ok()
    }

    /// Removes the entry under `key`, returning it if it held a `T`.
    pub fn remove<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let (_, entry) = self.entries.remove(key)?;
        entry.downcast::<T>().ok()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState")
            .field("entries", &self.entries.len())
            .finish()
    }
}
