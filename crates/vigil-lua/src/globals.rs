//! Globals installed in every policy VM.
//!
//! | Global | Description |
//! |--------|-------------|
//! | `print(...)` | Logs the arguments at info level |
//! | `log.debug/info/warn/error(msg)` | Logs at the given level |
//! | `json.encode(value)` / `json.decode(text)` | JSON conversion |
//! | `json.null` | Placeholder for `null` inside arrays |
//! | `set_timeout(fn, ms)` | Runs `fn` after `ms` milliseconds |
//! | `delay(ms, value?)` | Promise fulfilled with `value` after `ms` |
//! | `Promise` | See [`crate::promise`] |
//! | `fetch(url, opts?)` | See [`crate::fetch`] |
//!
//! Every log line carries the script file name in its `script` field.

use crate::bridge::{json_to_lua, lua_to_json};
use crate::jobs::JobQueue;
use crate::promise::Promise;
use crate::sandbox::Deadline;
use crate::{fetch, promise};
use mlua::{Function, Lua, MultiValue, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Installs every global for a run of `script`.
///
/// # Errors
///
/// Returns an error if the VM cannot allocate.
pub fn install(lua: &Lua, script: &str) -> mlua::Result<()> {
    let script: Arc<str> = Arc::from(script);
    register_logging(lua, &script)?;
    register_json(lua)?;
    register_timers(lua, &script)?;
    promise::register(lua)?;
    fetch::register(lua)?;
    Ok(())
}

fn join_args(args: MultiValue) -> mlua::Result<String> {
    let parts = args
        .iter()
        .map(Value::to_string)
        .collect::<mlua::Result<Vec<_>>>()?;
    Ok(parts.join("\t"))
}

fn register_logging(lua: &Lua, script: &Arc<str>) -> mlua::Result<()> {
    let s = Arc::clone(script);
    lua.globals().set(
        "print",
        lua.create_function(move |_, args: MultiValue| {
            info!(script = %s, "{}", join_args(args)?);
            Ok(())
        })?,
    )?;

    let log = lua.create_table()?;
    for level in ["debug", "info", "warn", "error"] {
        let s = Arc::clone(script);
        let f = lua.create_function(move |_, args: MultiValue| {
            let msg = join_args(args)?;
            match level {
                "debug" => debug!(script = %s, "{msg}"),
                "warn" => warn!(script = %s, "{msg}"),
                "error" => error!(script = %s, "{msg}"),
                _ => info!(script = %s, "{msg}"),
            }
            Ok(())
        })?;
        log.set(level, f)?;
    }
    lua.globals().set("log", log)
}

fn register_json(lua: &Lua) -> mlua::Result<()> {
    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|_, value: Value| {
            let json = lua_to_json(&value).map_err(mlua::Error::external)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, text: mlua::String| {
            let json: serde_json::Value =
                serde_json::from_slice(&text.as_bytes()).map_err(mlua::Error::external)?;
            json_to_lua(lua, &json).map_err(mlua::Error::external)
        })?,
    )?;
    json.set("null", Value::NULL)?;
    lua.globals().set("json", json)
}

fn millis(ms: Option<f64>) -> Duration {
    let ms = ms.unwrap_or(0.0);
    if ms.is_finite() && ms > 0.0 {
        Duration::from_secs_f64(ms / 1000.0)
    } else {
        Duration::ZERO
    }
}

fn register_timers(lua: &Lua, script: &Arc<str>) -> mlua::Result<()> {
    let s = Arc::clone(script);
    lua.globals().set(
        "set_timeout",
        lua.create_function(move |lua, (callback, ms): (Function, Option<f64>)| {
            let s = Arc::clone(&s);
            JobQueue::of(lua)?.schedule(
                millis(ms),
                Box::new(move |lua: &Lua| match callback.call::<()>(()) {
                    Ok(()) => Ok(()),
                    Err(e) if lua.app_data_ref::<Deadline>().is_some_and(|d| d.expired()) => Err(e),
                    Err(e) => {
                        warn!(script = %s, error = %e, "Timer callback failed");
                        Ok(())
                    }
                }),
            );
            Ok(())
        })?,
    )?;

    lua.globals().set(
        "delay",
        lua.create_function(|lua, (ms, value): (Option<f64>, Value)| {
            let p = Promise::new();
            let target = p.clone();
            JobQueue::of(lua)?.schedule(
                millis(ms),
                Box::new(move |lua: &Lua| target.resolve(lua, value)),
            );
            Ok(p)
        })?,
    )
}
