//! The `relay` and `conn` arguments passed to the entry function.
//!
//! # relay
//!
//! | Function | Description |
//! |----------|-------------|
//! | `relay.query(filter)` | Iterator over stored events matching `filter` |
//! | `relay.store.get(key)` | Read from the relay-wide store |
//! | `relay.store.set(key, value)` | Write to the relay-wide store (`nil` deletes) |
//! | `relay.store.del(key)` | Delete from the relay-wide store |
//!
//! The query iterator supports `it:next()`, `it:collect()`, `it:close()`
//! and can be used directly in a generic `for`:
//!
//! ```lua
//! for ev in relay.query({ kinds = {0}, authors = { event.pubkey } }) do
//!   log.info(ev.id)
//! end
//! ```
//!
//! # conn
//!
//! | Field | Description |
//! |-------|-------------|
//! | `conn.ip` | Remote address |
//! | `conn.pubkey` | Authenticated public key, `nil` before auth |
//! | `conn.id` | Connection id, unique for the process lifetime |
//! | `conn.get_open_subscriptions()` | Sequence of filter tables |
//! | `conn.store.get/set/del` | Per-connection store, same API as `relay.store` |

use crate::bridge::{event_to_lua, filter_to_lua, json_to_lua, lua_to_filter, lua_to_json};
use crate::sandbox::Deadline;
use crate::PolicyError;
use mlua::{Lua, MetaMethod, MultiValue, Table, UserData, UserDataMethods, Value};
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::debug;
use vigil_runtime::{ConnectionContext, EventQuery, EventStream, GlobalStore, SessionHandle};
use vigil_types::ConnectionId;

/// Lazily pulls events from a query stream into Lua.
pub struct QueryIter {
    stream: Option<EventStream>,
}

impl QueryIter {
    fn new(stream: EventStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    fn advance(&mut self, lua: &Lua) -> mlua::Result<Value> {
        if let Some(deadline) = lua.app_data_ref::<Deadline>() {
            deadline.check()?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Value::Nil);
        };
        match stream.next() {
            None => {
                self.stream = None;
                Ok(Value::Nil)
            }
            Some(Ok(event)) => Ok(Value::Table(
                event_to_lua(lua, &event).map_err(mlua::Error::external)?,
            )),
            Some(Err(e)) => {
                self.stream = None;
                Err(mlua::Error::external(PolicyError::QueryFailed(e)))
            }
        }
    }
}

impl UserData for QueryIter {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method_mut("next", |lua, this, ()| this.advance(lua));
        methods.add_meta_method_mut(MetaMethod::Call, |lua, this, _: MultiValue| {
            this.advance(lua)
        });
        methods.add_method_mut("collect", |lua, this, ()| {
            let out = lua.create_table()?;
            let mut n = 0usize;
            loop {
                match this.advance(lua)? {
                    Value::Nil => break,
                    event => {
                        n += 1;
                        out.raw_set(n, event)?;
                    }
                }
            }
            Ok(out)
        });
        methods.add_method_mut("close", |_, this, ()| {
            this.stream = None;
            Ok(())
        });
    }
}

/// Builds the `relay` table.
///
/// # Errors
///
/// Returns an error if the VM cannot allocate.
pub fn relay_table(
    lua: &Lua,
    query: Arc<dyn EventQuery>,
    global: GlobalStore,
) -> mlua::Result<Table> {
    let relay = lua.create_table()?;

    relay.set(
        "query",
        lua.create_function(move |_, filter: Value| {
            let filter = lua_to_filter(&filter).map_err(mlua::Error::external)?;
            debug!(?filter, "Script query");
            let stream = query
                .query(&filter)
                .map_err(|e| mlua::Error::external(PolicyError::QueryFailed(e)))?;
            Ok(QueryIter::new(stream))
        })?,
    )?;

    let (g, s, d) = (global.clone(), global.clone(), global);
    relay.set(
        "store",
        store_table(
            lua,
            move |key| g.get(key),
            move |key, value| s.set(key, value),
            move |key| {
                d.del(key);
            },
        )?,
    )?;

    Ok(relay)
}

/// Builds the `conn` table from a snapshot of `ctx`.
///
/// `conn.store` writes go to `session`, bound once for the whole invocation.
///
/// # Errors
///
/// Returns an error if the VM cannot allocate or a subscription cannot be
/// converted.
pub fn connection_table(
    lua: &Lua,
    ctx: &dyn ConnectionContext,
    session: SessionHandle,
) -> mlua::Result<Table> {
    let conn = lua.create_table()?;
    let id: ConnectionId = ctx.connection_id();

    conn.set("ip", ctx.ip())?;
    if let Some(pubkey) = ctx.authed_pubkey().filter(|p| !p.is_empty()) {
        conn.set("pubkey", pubkey)?;
    }
    conn.set("id", id.to_string())?;

    let subscriptions = ctx.open_subscriptions();
    conn.set(
        "get_open_subscriptions",
        lua.create_function(move |lua, _: MultiValue| {
            let list = lua.create_table_with_capacity(subscriptions.len(), 0)?;
            for (i, filter) in subscriptions.iter().enumerate() {
                let value = filter_to_lua(lua, filter).map_err(mlua::Error::external)?;
                list.raw_set(i + 1, value)?;
            }
            Ok(list)
        })?,
    )?;

    let (g, s, d) = (session.clone(), session.clone(), session);
    conn.set(
        "store",
        store_table(
            lua,
            move |key| g.get(key),
            move |key, value| s.set(key, value),
            move |key| {
                d.del(key);
            },
        )?,
    )?;

    Ok(conn)
}

fn store_table<G, S, D>(lua: &Lua, get: G, set: S, del: D) -> mlua::Result<Table>
where
    G: Fn(&str) -> Option<Json> + Send + 'static,
    S: Fn(String, Json) + Send + 'static,
    D: Fn(&str) + Send + 'static,
{
    let store = lua.create_table()?;
    store.set(
        "get",
        lua.create_function(move |lua, key: String| match get(&key) {
            Some(value) => json_to_lua(lua, &value).map_err(mlua::Error::external),
            None => Ok(Value::Nil),
        })?,
    )?;
    store.set(
        "set",
        lua.create_function(move |_, (key, value): (String, Value)| {
            let json = lua_to_json(&value).map_err(mlua::Error::external)?;
            set(key, json);
            Ok(())
        })?,
    )?;
    store.set(
        "del",
        lua.create_function(move |_, key: String| {
            del(&key);
            Ok(())
        })?,
    )?;
    Ok(store)
}
