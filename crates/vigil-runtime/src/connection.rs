//! Caller identity as seen by policy scripts.

use vigil_types::{ConnectionId, Filter};

/// What the transport layer knows about the connection behind a request.
///
/// Implemented by the relay framework. The engine reads it once per
/// invocation through [`ConnectionSnapshot::capture`], so a script always
/// sees a consistent view even if the connection authenticates mid-call.
pub trait ConnectionContext: Send + Sync {
    /// Network origin of the caller.
    fn ip(&self) -> String;

    /// Verified public key, if the caller has authenticated.
    fn authed_pubkey(&self) -> Option<String>;

    /// Filters the caller currently has open.
    fn open_subscriptions(&self) -> Vec<Filter>;

    /// Unique handle of the underlying connection.
    fn connection_id(&self) -> ConnectionId;
}

/// Owned, immutable copy of a [`ConnectionContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub ip: String,
    pub pubkey: Option<String>,
    pub subscriptions: Vec<Filter>,
}

impl ConnectionSnapshot {
    /// Creates a snapshot for a fresh, unauthenticated connection.
    #[must_use]
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::next(),
            ip: ip.into(),
            pubkey: None,
            subscriptions: Vec::new(),
        }
    }

    /// Copies the current state of `ctx`.
    #[must_use]
    pub fn capture(ctx: &dyn ConnectionContext) -> Self {
        Self {
            id: ctx.connection_id(),
            ip: ctx.ip(),
            pubkey: ctx.authed_pubkey().filter(|pk| !pk.is_empty()),
            subscriptions: ctx.open_subscriptions(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: ConnectionId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_pubkey(mut self, pubkey: impl Into<String>) -> Self {
        let pubkey = pubkey.into();
        self.pubkey = (!pubkey.is_empty()).then_some(pubkey);
        self
    }

    #[must_use]
    pub fn with_subscription(mut self, filter: Filter) -> Self {
        self.subscriptions.push(filter);
        self
    }
}

impl ConnectionContext for ConnectionSnapshot {
    fn ip(&self) -> String {
        self.ip.clone()
    }

    fn authed_pubkey(&self) -> Option<String> {
        self.pubkey.clone()
    }

    fn open_subscriptions(&self) -> Vec<Filter> {
        self.subscriptions.clone()
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }
}
