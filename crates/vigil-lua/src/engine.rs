//! Runs one policy script invocation to a [`Decision`].
//!
//! Every call gets a fresh sandboxed VM:
//!
//! 1. fetch the compiled script from the [`ScriptCache`]
//! 2. create the VM, install globals, the deadline hook and the job queue
//! 3. evaluate the chunk, which must return the entry function
//! 4. call it with `(event | filter, relay, conn)`
//! 5. if it returned a promise, drain the job queue until it settles
//! 6. map the outcome: `nil` or `""` accepts, a non-empty string rejects
//!
//! [`PolicyEngine::decide`] never fails: every error becomes a rejection.

use crate::bridge::{event_to_lua, filter_to_lua};
use crate::cache::{CompiledScript, ScriptCache};
use crate::error::format_lua_error;
use crate::jobs::{drain, JobQueue};
use crate::promise::{describe_reason, Promise, PromiseState};
use crate::sandbox::{self, Deadline, ExecLimits};
use crate::{capabilities, globals, PolicyError};
use mlua::{Lua, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use vigil_runtime::config::{FetchConfig, ScriptsConfig, VigilConfig};
use vigil_runtime::{ConnectionContext, EventQuery, GlobalStore, SessionStore};
use vigil_types::{ConnectionId, Decision, ErrorCode, Event, Filter};

/// What a decision is being made about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyInput {
    Event(Event),
    Filter(Filter),
}

impl PolicyInput {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Filter(_) => "filter",
        }
    }
}

impl From<Event> for PolicyInput {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

impl From<Filter> for PolicyInput {
    fn from(filter: Filter) -> Self {
        Self::Filter(filter)
    }
}

/// The script policy engine.
///
/// Cheap to share behind an `Arc`; all state is internally synchronized.
pub struct PolicyEngine {
    scripts: ScriptsConfig,
    limits: ExecLimits,
    fetch: FetchConfig,
    cache: ScriptCache,
    query: Arc<dyn EventQuery>,
    global: GlobalStore,
    sessions: SessionStore,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("scripts", &self.scripts)
            .field("limits", &self.limits)
            .field("compiles", &self.cache.compile_count())
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// Creates an engine with empty stores.
    #[must_use]
    pub fn new(config: &VigilConfig, query: Arc<dyn EventQuery>) -> Self {
        Self {
            scripts: config.scripts.clone(),
            limits: ExecLimits::from(&config.limits),
            fetch: config.fetch.clone(),
            cache: ScriptCache::new(),
            query,
            global: GlobalStore::new(),
            sessions: SessionStore::new(),
        }
    }

    /// Shares existing stores, e.g. between an event and a filter engine.
    #[must_use]
    pub fn with_stores(mut self, global: GlobalStore, sessions: SessionStore) -> Self {
        self.global = global;
        self.sessions = sessions;
        self
    }

    #[must_use]
    pub fn global_store(&self) -> &GlobalStore {
        &self.global
    }

    #[must_use]
    pub fn session_store(&self) -> &SessionStore {
        &self.sessions
    }

    #[must_use]
    pub fn limits(&self) -> &ExecLimits {
        &self.limits
    }

    /// Path of the script that handles `input`.
    #[must_use]
    pub fn script_path(&self, input: &PolicyInput) -> PathBuf {
        match input {
            PolicyInput::Event(_) => self.scripts.event_path(),
            PolicyInput::Filter(_) => self.scripts.filter_path(),
        }
    }

    /// Number of syntax checks of changed scripts so far.
    #[must_use]
    pub fn compile_count(&self) -> u64 {
        self.cache.compile_count()
    }

    /// Drops the session bag of a closed connection.
    pub fn on_disconnect(&self, conn: ConnectionId) {
        self.sessions.on_disconnect(conn);
    }

    pub fn decide_event(&self, event: &Event, conn: &dyn ConnectionContext) -> Decision {
        let path = self.scripts.event_path();
        let result = self.run(&path, conn, |lua| Ok(Value::Table(event_to_lua(lua, event)?)));
        settle("event", &path, result)
    }

    pub fn decide_filter(&self, filter: &Filter, conn: &dyn ConnectionContext) -> Decision {
        let path = self.scripts.filter_path();
        let result = self.run(&path, conn, |lua| filter_to_lua(lua, filter));
        settle("filter", &path, result)
    }

    /// Decides on `input`, failing closed on any error.
    pub fn decide(&self, input: &PolicyInput, conn: &dyn ConnectionContext) -> Decision {
        match input {
            PolicyInput::Event(event) => self.decide_event(event, conn),
            PolicyInput::Filter(filter) => self.decide_filter(filter, conn),
        }
    }

    /// Like [`decide`](Self::decide) but surfaces the error.
    ///
    /// # Errors
    ///
    /// Returns the [`PolicyError`] that stopped the invocation.
    pub fn try_decide(
        &self,
        input: &PolicyInput,
        conn: &dyn ConnectionContext,
    ) -> Result<Decision, PolicyError> {
        let path = self.script_path(input);
        match input {
            PolicyInput::Event(event) => {
                self.run(&path, conn, |lua| Ok(Value::Table(event_to_lua(lua, event)?)))
            }
            PolicyInput::Filter(filter) => self.run(&path, conn, |lua| filter_to_lua(lua, filter)),
        }
    }

    fn run(
        &self,
        path: &Path,
        conn: &dyn ConnectionContext,
        bind: impl FnOnce(&Lua) -> Result<Value, PolicyError>,
    ) -> Result<Decision, PolicyError> {
        let script = self.cache.get_or_compile(path)?;
        let name = script.file_name();

        let lua = sandbox::new_vm(&self.limits)?;
        let deadline = Deadline::after(self.limits.timeout);
        let queue = JobQueue::new();
        lua.set_app_data(queue.clone());
        lua.set_app_data(deadline.clone());
        lua.set_app_data(self.fetch.clone());
        globals::install(&lua, &name)?;
        sandbox::install_deadline_hook(&lua, &self.limits, deadline.clone());

        trace!(script = %name, conn = %conn.connection_id(), "Running policy script");
        let result = self.execute(&lua, &script, conn, bind, &queue, &deadline);
        queue.clear();
        result
    }

    fn execute(
        &self,
        lua: &Lua,
        script: &CompiledScript,
        conn: &dyn ConnectionContext,
        bind: impl FnOnce(&Lua) -> Result<Value, PolicyError>,
        queue: &JobQueue,
        deadline: &Deadline,
    ) -> Result<Decision, PolicyError> {
        let failed = |e: mlua::Error| {
            if deadline.expired() {
                PolicyError::ScriptTimeout(deadline.budget())
            } else {
                warn!(script = %script.file_name(), error = %e, "Lua error");
                PolicyError::ScriptRuntime(format_lua_error(&e))
            }
        };

        let entry = match lua
            .load(&*script.source)
            .set_name(script.chunk_name())
            .eval::<Value>()
            .map_err(failed)?
        {
            Value::Function(f) => f,
            other => {
                return Err(PolicyError::invalid(
                    &script.path,
                    format!("script must return a function, got {}", other.type_name()),
                ))
            }
        };

        let subject = bind(lua)?;
        let relay = capabilities::relay_table(lua, Arc::clone(&self.query), self.global.clone())?;
        let session = self.sessions.open(conn.connection_id());
        let conn = capabilities::connection_table(lua, conn, session)?;

        let returned = entry.call::<Value>((subject, relay, conn)).map_err(failed)?;

        let outcome = if Promise::is_promise_like(&returned)? {
            let root = Promise::resolved(lua, returned).map_err(failed)?;
            debug!(script = %script.file_name(), pending = queue.len(), "Draining async work");
            drain(lua, queue, deadline, || !root.is_pending()).map_err(failed)?;
            match root.state() {
                PromiseState::Fulfilled(value) => value,
                PromiseState::Rejected(reason) => {
                    return Err(PolicyError::ScriptRuntime(describe_reason(&reason)))
                }
                PromiseState::Pending => {
                    return Err(PolicyError::ScriptRuntime("promise never settled".into()))
                }
            }
        } else {
            returned
        };

        Ok(outcome_to_decision(&outcome))
    }
}

/// Maps the entry function's final value to a decision.
///
/// `nil`, `json.null` and `""` accept; any other string rejects with that
/// string; every other value accepts.
#[must_use]
pub fn outcome_to_decision(value: &Value) -> Decision {
    match value {
        Value::String(s) => {
            let message = s.to_string_lossy().to_string();
            if message.is_empty() {
                Decision::accept()
            } else {
                Decision::reject(message)
            }
        }
        _ => Decision::accept(),
    }
}

fn settle(kind: &str, path: &Path, result: Result<Decision, PolicyError>) -> Decision {
    match result {
        Ok(decision) => {
            debug!(kind, script = %path.display(), %decision, "Policy decided");
            decision
        }
        Err(e) => {
            warn!(
                kind,
                script = %path.display(),
                code = e.code(),
                error = %e,
                "Policy script failed, rejecting"
            );
            Decision::reject(e.rejection_message())
        }
    }
}
