//! Host-implemented promises for Lua.
//!
//! Lua has no native promise type, so one is provided as userdata:
//!
//! ```lua
//! local p = Promise.new(function(resolve, reject) resolve(1) end)
//! p:next(function(v) return v + 1 end)
//!  :catch(function(err) log.warn(err) end)
//!
//! Promise.resolve(x)     -- adopts promises and thenables
//! Promise.reject(reason)
//! Promise.all({p1, p2})  -- fulfils with a sequence of results
//! ```
//!
//! `then` is a Lua keyword, so the chaining method is `:next`; the same
//! method is also reachable as `p["then"](p, ...)`. Any table with a
//! callable `next` or `then` field is treated as a foreign thenable and is
//! called as `thenable:next(resolve, reject)`.
//!
//! Reactions never run synchronously. Settling a promise queues its
//! reactions on the [`JobQueue`], which the engine drains.

use crate::error::format_lua_error;
use crate::jobs::{JobQueue, Task};
use crate::sandbox::Deadline;
use mlua::{Function, Lua, MetaMethod, Table, UserData, UserDataMethods, Value};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Observable state of a promise.
#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

#[derive(Clone)]
enum Settled {
    Fulfilled(Value),
    Rejected(Value),
}

struct Reaction {
    on_fulfilled: Option<Function>,
    on_rejected: Option<Function>,
    target: Promise,
}

enum State {
    Pending(Vec<Reaction>),
    Settled(Settled),
}

/// A promise shared between Rust and Lua.
#[derive(Clone)]
pub struct Promise {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Promise").field(&self.label()).finish()
    }
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl Promise {
    /// A new pending promise.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    /// Returns the promise behind `value`, if it is one.
    #[must_use]
    pub fn from_lua_value(value: &Value) -> Option<Self> {
        match value {
            Value::UserData(ud) => ud.borrow::<Promise>().ok().map(|p| (*p).clone()),
            _ => None,
        }
    }

    /// `Promise.resolve(value)`: returns `value` if it already is a
    /// promise, otherwise a new promise resolved with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the job queue is missing.
    pub fn resolved(lua: &Lua, value: Value) -> mlua::Result<Self> {
        if let Some(p) = Self::from_lua_value(&value) {
            return Ok(p);
        }
        let p = Self::new();
        p.resolve(lua, value)?;
        Ok(p)
    }

    /// Returns true if `value` is a promise or a thenable table.
    ///
    /// # Errors
    ///
    /// Returns an error if reading a table field fails.
    pub fn is_promise_like(value: &Value) -> mlua::Result<bool> {
        Ok(match value {
            Value::Table(t) => thenable_method(t)?.is_some(),
            other => Self::from_lua_value(other).is_some(),
        })
    }

    #[must_use]
    pub fn state(&self) -> PromiseState {
        match &*self.state.lock() {
            State::Pending(_) => PromiseState::Pending,
            State::Settled(Settled::Fulfilled(v)) => PromiseState::Fulfilled(v.clone()),
            State::Settled(Settled::Rejected(v)) => PromiseState::Rejected(v.clone()),
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(&*self.state.lock(), State::Pending(_))
    }

    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn label(&self) -> &'static str {
        match &*self.state.lock() {
            State::Pending(_) => "pending",
            State::Settled(Settled::Fulfilled(_)) => "fulfilled",
            State::Settled(Settled::Rejected(_)) => "rejected",
        }
    }

    /// Resolves with `value`, adopting the state of promises and thenables.
    ///
    /// # Errors
    ///
    /// Returns an error if the job queue is missing.
    pub fn resolve(&self, lua: &Lua, value: Value) -> mlua::Result<()> {
        if let Some(other) = Self::from_lua_value(&value) {
            if other.same(self) {
                let reason = lua.create_string("promise resolved with itself")?;
                return self.reject(lua, Value::String(reason));
            }
            return other.add_reaction(
                lua,
                Reaction {
                    on_fulfilled: None,
                    on_rejected: None,
                    target: self.clone(),
                },
            );
        }

        if let Value::Table(table) = &value {
            if let Some(method) = thenable_method(table)? {
                let target = self.clone();
                let thenable = table.clone();
                JobQueue::of(lua)?.enqueue(Box::new(move |lua: &Lua| {
                    adopt_thenable(lua, &target, thenable, method)
                }));
                return Ok(());
            }
        }

        self.fulfill(lua, value)
    }

    /// Fulfils with `value` as-is. No-op if already settled.
    ///
    /// # Errors
    ///
    /// Returns an error if the job queue is missing.
    pub fn fulfill(&self, lua: &Lua, value: Value) -> mlua::Result<()> {
        self.settle(lua, Settled::Fulfilled(value))
    }

    /// Rejects with `reason`. No-op if already settled.
    ///
    /// # Errors
    ///
    /// Returns an error if the job queue is missing.
    pub fn reject(&self, lua: &Lua, reason: Value) -> mlua::Result<()> {
        self.settle(lua, Settled::Rejected(reason))
    }

    fn settle(&self, lua: &Lua, outcome: Settled) -> mlua::Result<()> {
        let reactions = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Settled(_) => return Ok(()),
                State::Pending(reactions) => {
                    let reactions = std::mem::take(reactions);
                    *state = State::Settled(outcome.clone());
                    reactions
                }
            }
        };
        if reactions.is_empty() {
            return Ok(());
        }
        let queue = JobQueue::of(lua)?;
        for reaction in reactions {
            queue.enqueue(reaction.into_task(outcome.clone()));
        }
        Ok(())
    }

    /// Chains handlers, returning the derived promise.
    ///
    /// # Errors
    ///
    /// Returns an error if the job queue is missing.
    pub fn then(
        &self,
        lua: &Lua,
        on_fulfilled: Option<Function>,
        on_rejected: Option<Function>,
    ) -> mlua::Result<Promise> {
        let target = Promise::new();
        self.add_reaction(
            lua,
            Reaction {
                on_fulfilled,
                on_rejected,
                target: target.clone(),
            },
        )?;
        Ok(target)
    }

    fn add_reaction(&self, lua: &Lua, reaction: Reaction) -> mlua::Result<()> {
        let settled = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(reactions) => {
                    reactions.push(reaction);
                    return Ok(());
                }
                State::Settled(outcome) => outcome.clone(),
            }
        };
        JobQueue::of(lua)?.enqueue(reaction.into_task(settled));
        Ok(())
    }
}

impl Reaction {
    fn into_task(self, outcome: Settled) -> Task {
        Box::new(move |lua: &Lua| {
            let (handler, value, fulfilled) = match outcome {
                Settled::Fulfilled(v) => (self.on_fulfilled, v, true),
                Settled::Rejected(v) => (self.on_rejected, v, false),
            };
            let Some(handler) = handler else {
                return if fulfilled {
                    self.target.fulfill(lua, value)
                } else {
                    self.target.reject(lua, value)
                };
            };
            match handler.call::<Value>(value) {
                Ok(ret) => self.target.resolve(lua, ret),
                Err(e) if deadline_passed(lua) => Err(e),
                Err(e) => self.target.reject(lua, error_value(lua, &e)?),
            }
        })
    }
}

impl UserData for Promise {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("next", then_method);
        methods.add_method("then", then_method);
        methods.add_method("catch", |lua, this, on_rejected: Value| {
            this.then(lua, None, callable(on_rejected))
        });
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("Promise<{}>", this.label()))
        });
    }
}

fn then_method(
    lua: &Lua,
    this: &Promise,
    (on_fulfilled, on_rejected): (Value, Value),
) -> mlua::Result<Promise> {
    this.then(lua, callable(on_fulfilled), callable(on_rejected))
}

fn callable(value: Value) -> Option<Function> {
    match value {
        Value::Function(f) => Some(f),
        _ => None,
    }
}

fn thenable_method(table: &Table) -> mlua::Result<Option<Function>> {
    for key in ["next", "then"] {
        if let Value::Function(f) = table.get::<Value>(key)? {
            return Ok(Some(f));
        }
    }
    Ok(None)
}

fn adopt_thenable(lua: &Lua, target: &Promise, thenable: Table, method: Function) -> mlua::Result<()> {
    let (resolve, reject, done) = resolving_functions(lua, target)?;
    match method.call::<()>((thenable, resolve, reject)) {
        Ok(()) => Ok(()),
        Err(e) if deadline_passed(lua) => Err(e),
        Err(e) => {
            if done.swap(true, Ordering::SeqCst) {
                Ok(())
            } else {
                target.reject(lua, error_value(lua, &e)?)
            }
        }
    }
}

/// One-shot `resolve` / `reject` pair for `target`.
fn resolving_functions(
    lua: &Lua,
    target: &Promise,
) -> mlua::Result<(Function, Function, Arc<AtomicBool>)> {
    let done = Arc::new(AtomicBool::new(false));

    let (p, d) = (target.clone(), Arc::clone(&done));
    let resolve = lua.create_function(move |lua, value: Value| {
        if !d.swap(true, Ordering::SeqCst) {
            p.resolve(lua, value)?;
        }
        Ok(())
    })?;

    let (p, d) = (target.clone(), Arc::clone(&done));
    let reject = lua.create_function(move |lua, reason: Value| {
        if !d.swap(true, Ordering::SeqCst) {
            p.reject(lua, reason)?;
        }
        Ok(())
    })?;

    Ok((resolve, reject, done))
}

fn deadline_passed(lua: &Lua) -> bool {
    lua.app_data_ref::<Deadline>().is_some_and(|d| d.expired())
}

/// Converts a raised error into a rejection reason.
fn error_value(lua: &Lua, err: &mlua::Error) -> mlua::Result<Value> {
    Ok(Value::String(lua.create_string(format_lua_error(err))?))
}

/// Human-readable text for a rejection reason.
#[must_use]
pub fn describe_reason(reason: &Value) -> String {
    match reason {
        Value::Nil => "promise rejected".to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Error(e) => format_lua_error(e),
        Value::Table(t) => match t.get::<Value>("message") {
            Ok(Value::String(s)) => s.to_string_lossy().to_string(),
            _ => "promise rejected with a table".to_string(),
        },
        other => format!("promise rejected with a {}", other.type_name()),
    }
}

/// Installs the global `Promise` table.
///
/// # Errors
///
/// Returns an error if the VM cannot allocate.
pub fn register(lua: &Lua) -> mlua::Result<()> {
    let promise = lua.create_table()?;

    promise.set(
        "new",
        lua.create_function(|lua, executor: Function| {
            let p = Promise::new();
            let (resolve, reject, done) = resolving_functions(lua, &p)?;
            match executor.call::<()>((resolve, reject)) {
                Ok(()) => {}
                Err(e) if deadline_passed(lua) => return Err(e),
                Err(e) => {
                    if !done.swap(true, Ordering::SeqCst) {
                        p.reject(lua, error_value(lua, &e)?)?;
                    }
                }
            }
            Ok(p)
        })?,
    )?;

    promise.set(
        "resolve",
        lua.create_function(|lua, value: Value| Promise::resolved(lua, value))?,
    )?;

    promise.set(
        "reject",
        lua.create_function(|lua, reason: Value| {
            let p = Promise::new();
            p.reject(lua, reason)?;
            Ok(p)
        })?,
    )?;

    promise.set("all", lua.create_function(promise_all)?)?;

    lua.globals().set("Promise", promise)?;
    Ok(())
}

fn promise_all(lua: &Lua, list: Table) -> mlua::Result<Promise> {
    let items = list
        .sequence_values::<Value>()
        .collect::<mlua::Result<Vec<_>>>()?;
    let target = Promise::new();
    let results = lua.create_table_with_capacity(items.len(), 0)?;
    if items.is_empty() {
        target.fulfill(lua, Value::Table(results))?;
        return Ok(target);
    }

    let remaining = Arc::new(AtomicUsize::new(items.len()));
    for (i, item) in items.into_iter().enumerate() {
        let p = Promise::resolved(lua, item)?;

        let (t, res, left) = (target.clone(), results.clone(), Arc::clone(&remaining));
        let on_fulfilled = lua.create_function(move |lua, value: Value| {
            res.raw_set(i + 1, value)?;
            if left.fetch_sub(1, Ordering::SeqCst) == 1 {
                t.fulfill(lua, Value::Table(res.clone()))?;
            }
            Ok(())
        })?;

        let t = target.clone();
        let on_rejected = lua.create_function(move |lua, reason: Value| t.reject(lua, reason))?;

        p.then(lua, Some(on_fulfilled), Some(on_rejected))?;
    }
    Ok(target)
}
