//! Global and per-connection key/value stores.
//!
//! Values are [`serde_json::Value`] trees. A `get` hands out a deep copy and
//! a `set` takes ownership of one, so two scripts never alias the same
//! in-process object. Locking is internal; callers never see a guard.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use vigil_types::ConnectionId;

/// A mutex-guarded `key -> value` bag.
#[derive(Debug, Default)]
pub struct KvBag {
    entries: Mutex<HashMap<String, Value>>,
}

impl KvBag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the value under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// Storing `Value::Null` removes the key, matching a script assigning
    /// `nil`.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let mut entries = self.entries.lock();
        if value.is_null() {
            entries.remove(&key.into());
        } else {
            entries.insert(key.into(), value);
        }
    }

    /// Removes `key`, returning its previous value.
    pub fn del(&self, key: &str) -> Option<Value> {
        self.entries.lock().remove(key)
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// The process-wide bag shared by all scripts and all connections.
///
/// Cloning is cheap and yields a handle to the same bag.
#[derive(Debug, Clone, Default)]
pub struct GlobalStore {
    bag: Arc<KvBag>,
}

impl GlobalStore {
    /// Creates an empty global store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`KvBag::get`].
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.bag.get(key)
    }

    /// See [`KvBag::set`].
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.bag.set(key, value);
    }

    /// See [`KvBag::del`].
    pub fn del(&self, key: &str) -> Option<Value> {
        self.bag.del(key)
    }
}

/// Per-connection bags keyed by [`ConnectionId`].
///
/// A bag is created when an invocation first [`open`](Self::open)s the
/// connection's session and destroyed by
/// [`on_disconnect`](Self::on_disconnect). Plain reads never allocate a bag.
///
/// Cloning is cheap and yields a handle to the same map.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<ConnectionId, Arc<KvBag>>>>,
}

impl SessionStore {
    /// Creates an empty session store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a handle to the session of `conn`, creating the bag if needed.
    ///
    /// The handle keeps its bag after [`on_disconnect`](Self::on_disconnect):
    /// later writes through it land in a detached bag that is dropped with
    /// the handle and never re-enters the store.
    #[must_use]
    pub fn open(&self, conn: ConnectionId) -> SessionHandle {
        let bag = Arc::clone(self.sessions.lock().entry(conn).or_default());
        SessionHandle { bag }
    }

    /// Returns a copy of `key` in the session of `conn`.
    #[must_use]
    pub fn get(&self, conn: ConnectionId, key: &str) -> Option<Value> {
        let bag = self.sessions.lock().get(&conn).cloned();
        bag.and_then(|bag| bag.get(key))
    }

    /// Drops every value stored for `conn`.
    ///
    /// Must be called by the transport when the connection closes.
    pub fn on_disconnect(&self, conn: ConnectionId) {
        if let Some(bag) = self.sessions.lock().remove(&conn) {
            debug!(connection = %conn, keys = bag.len(), "Dropped session store");
        }
    }

    /// Returns true if a bag currently exists for `conn`.
    #[must_use]
    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.sessions.lock().contains_key(&conn)
    }

    /// Number of connections with a live bag.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns true if no connection has a live bag.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// One connection's session bag, bound by [`SessionStore::open`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    bag: Arc<KvBag>,
}

impl SessionHandle {
    /// See [`KvBag::get`].
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.bag.get(key)
    }

    /// See [`KvBag::set`].
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.bag.set(key, value);
    }

    /// See [`KvBag::del`].
    pub fn del(&self, key: &str) -> Option<Value> {
        self.bag.del(key)
    }
}
