//! Async façade for hosts running on tokio.
//!
//! Script execution blocks (query streams, `fetch`, timer sleeps), so
//! every decision runs on the blocking pool under an outer timeout. The VM
//! of an abandoned run stays owned by its blocking task and is dropped when
//! that task finishes.

use crate::engine::{PolicyEngine, PolicyInput};
use crate::PolicyError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use vigil_runtime::{ConnectionContext, ConnectionSnapshot};
use vigil_types::{ConnectionId, Decision, Event, Filter};

/// Slack added on top of the script deadline before the outer timeout fires.
const DEFAULT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PolicyService {
    engine: Arc<PolicyEngine>,
    grace: Duration,
}

impl PolicyService {
    #[must_use]
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self {
            engine,
            grace: DEFAULT_GRACE,
        }
    }

    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    pub async fn decide_event(&self, event: Event, conn: &dyn ConnectionContext) -> Decision {
        self.decide(PolicyInput::Event(event), conn).await
    }

    pub async fn decide_filter(&self, filter: Filter, conn: &dyn ConnectionContext) -> Decision {
        self.decide(PolicyInput::Filter(filter), conn).await
    }

    /// Decides on the blocking pool, failing closed on panic or timeout.
    pub async fn decide(&self, input: PolicyInput, conn: &dyn ConnectionContext) -> Decision {
        let snapshot = ConnectionSnapshot::capture(conn);
        let engine = Arc::clone(&self.engine);
        let budget = engine.limits().timeout + self.grace;
        let kind = input.kind();

        let task = tokio::task::spawn_blocking(move || engine.decide(&input, &snapshot));
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                error!(kind, error = %e, "Policy task failed");
                Decision::fail_closed()
            }
            Err(_) => {
                warn!(kind, ?budget, "Policy decision abandoned after timeout");
                Decision::reject(PolicyError::ScriptTimeout(budget).rejection_message())
            }
        }
    }

    pub fn on_disconnect(&self, conn: ConnectionId) {
        self.engine.on_disconnect(conn);
    }
}
