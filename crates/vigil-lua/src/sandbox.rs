//! Sandboxed Lua VM construction and execution limits.
//!
//! # Security Model
//!
//! Each invocation gets a brand-new VM. Only these libraries are loaded:
//! base, `string`, `table`, `math`, `utf8`, `coroutine`, and an `os` table
//! reduced to `time`, `clock` and `date`. `io`, `debug` and `package` are
//! never opened, and `load`, `loadfile`, `dofile`, `require` and
//! `collectgarbage` are removed from the base library.
//!
//! Runaway scripts are stopped by two mechanisms:
//!
//! - a memory limit set on the VM allocator
//! - an instruction-count hook that raises once the [`Deadline`] passes

use mlua::{HookTriggers, Lua, LuaOptions, StdLib, Table, Value, VmState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vigil_runtime::config::LimitsConfig;

/// Base library functions removed from every VM.
const REMOVED_GLOBALS: &[&str] = &["load", "loadfile", "dofile", "require", "collectgarbage"];

/// `os` functions kept in every VM.
const OS_WHITELIST: &[&str] = &["time", "clock", "date"];

/// Per-invocation resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub hook_interval: u32,
    pub memory_limit: usize,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

impl From<&LimitsConfig> for ExecLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            timeout: config.timeout(),
            hook_interval: config.hook_interval.max(1),
            memory_limit: config.memory_limit_bytes,
        }
    }
}

/// Wall-clock deadline shared by the hook, the job queue and `fetch`.
///
/// Once any check observes the deadline as passed, [`expired`] stays
/// true, which lets the engine classify whatever error surfaced as a
/// timeout.
///
/// [`expired`]: Deadline::expired
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
    expired: Arc<AtomicBool>,
}

impl Deadline {
    /// A deadline `budget` from now.
    #[must_use]
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
            expired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The instant the deadline passes.
    #[must_use]
    pub fn at(&self) -> Instant {
        self.at
    }

    /// The total budget this deadline was created with.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left, zero once passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Returns true if any check has observed the deadline as passed.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    /// Marks the deadline as passed.
    pub fn expire(&self) {
        self.expired.store(true, Ordering::Release);
    }

    /// Raises a Lua error if the deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns `mlua::Error::RuntimeError` once the deadline is reached.
    pub fn check(&self) -> mlua::Result<()> {
        if self.expired() || Instant::now() >= self.at {
            self.expire();
            return Err(mlua::Error::RuntimeError(format!(
                "script exceeded time limit ({:?})",
                self.budget
            )));
        }
        Ok(())
    }
}

/// Creates a sandboxed VM with the memory limit applied.
///
/// # Errors
///
/// Returns an error if the VM cannot be created or configured.
pub fn new_vm(limits: &ExecLimits) -> mlua::Result<Lua> {
    let libs = StdLib::TABLE
        | StdLib::STRING
        | StdLib::MATH
        | StdLib::UTF8
        | StdLib::COROUTINE
        | StdLib::OS;
    let lua = Lua::new_with(libs, LuaOptions::default())?;

    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(*name, Value::Nil)?;
    }

    let full_os: Table = globals.get("os")?;
    let os = lua.create_table()?;
    for name in OS_WHITELIST {
        os.raw_set(*name, full_os.get::<Value>(*name)?)?;
    }
    globals.raw_set("os", os)?;

    lua.set_memory_limit(limits.memory_limit)?;
    Ok(lua)
}

/// Installs the instruction-count hook enforcing `deadline`.
pub fn install_deadline_hook(lua: &Lua, limits: &ExecLimits, deadline: Deadline) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(limits.hook_interval),
        move |_lua, _debug| {
            deadline.check()?;
            Ok(VmState::Continue)
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> Lua {
        new_vm(&ExecLimits::default()).expect("create vm")
    }

    #[test]
    fn dangerous_globals_are_absent() {
        let lua = vm();
        for name in ["load", "loadfile", "dofile", "require", "collectgarbage", "io", "debug", "package"] {
            let v: Value = lua.globals().get(name).unwrap();
            assert!(v.is_nil(), "{name} should be nil");
        }
    }

    #[test]
    fn os_is_reduced() {
        let lua = vm();
        let (time_ok, exec_nil, remove_nil): (bool, bool, bool) = lua
            .load("return type(os.time()) == 'number', os.execute == nil, os.remove == nil")
            .eval()
            .unwrap();
        assert!(time_ok);
        assert!(exec_nil);
        assert!(remove_nil);
    }

    #[test]
    fn safe_libraries_work() {
        let lua = vm();
        let s: String = lua
            .load("return string.upper('ok') .. table.concat({1, 2}, ',') .. math.floor(2.5) .. utf8.char(72)")
            .eval()
            .unwrap();
        assert_eq!(s, "OK1,22H");
    }

    #[test]
    fn deadline_hook_stops_infinite_loop() {
        let limits = ExecLimits {
            timeout: Duration::from_millis(50),
            hook_interval: 1_000,
            ..ExecLimits::default()
        };
        let lua = new_vm(&limits).unwrap();
        let deadline = Deadline::after(limits.timeout);
        install_deadline_hook(&lua, &limits, deadline.clone());

        let result = lua.load("while true do end").exec();
        assert!(result.is_err());
        assert!(deadline.expired());
    }

    #[test]
    fn memory_limit_is_enforced() {
        let limits = ExecLimits {
            memory_limit: 2 * 1024 * 1024,
            ..ExecLimits::default()
        };
        let lua = new_vm(&limits).unwrap();
        let result = lua
            .load("local t = {} for i = 1, 1e7 do t[i] = string.rep('x', 64) .. i end")
            .exec();
        assert!(matches!(result, Err(mlua::Error::MemoryError(_))));
    }

    #[test]
    fn deadline_check_and_remaining() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(d.check().is_ok());
        assert!(!d.expired());
        assert!(d.remaining() > Duration::from_secs(59));

        let past = Deadline::after(Duration::ZERO);
        assert!(past.check().is_err());
        assert!(past.expired());
        assert_eq!(past.remaining(), Duration::ZERO);
    }
}
