//! Script cache keyed by path, invalidated by modification time.
//!
//! A script is re-read and re-checked only when its file's mtime is newer
//! than the cached copy. Compile failures are cached too, so a broken file
//! is reported on every call without being re-parsed until it changes.
//!
//! Each path has its own slot lock: concurrent calls for the same path
//! compile once, calls for different paths never wait on each other.

use crate::PolicyError;
use mlua::{Lua, LuaOptions, StdLib};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

/// A script that passed the syntax check.
#[derive(Debug)]
pub struct CompiledScript {
    pub path: PathBuf,
    pub source: Arc<str>,
    pub modified_at: SystemTime,
}

impl CompiledScript {
    /// Chunk name used in Lua error messages.
    #[must_use]
    pub fn chunk_name(&self) -> String {
        format!("@{}", self.file_name())
    }

    /// File name without directories.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

#[derive(Debug)]
enum Slot {
    Ready(Arc<CompiledScript>),
    Invalid { modified_at: SystemTime, message: String },
}

impl Slot {
    fn modified_at(&self) -> SystemTime {
        match self {
            Self::Ready(script) => script.modified_at,
            Self::Invalid { modified_at, .. } => *modified_at,
        }
    }
}

type SlotCell = Arc<Mutex<Option<Slot>>>;

/// Per-path cache of syntax-checked script sources.
///
/// What is cached is the source text, not a Lua function: a function
/// belongs to the VM that loaded it, and every invocation runs in a fresh
/// VM, so each call parses the cached source again. Bytecode is not cached
/// either, since loading binary chunks is unsafe and the sandbox only
/// accepts text. [`compile_count`](Self::compile_count) therefore counts
/// syntax checks of changed files, not per-call parses.
#[derive(Debug, Default)]
pub struct ScriptCache {
    slots: Mutex<HashMap<PathBuf, SlotCell>>,
    compiles: AtomicU64,
}

impl ScriptCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current compiled form of the script at `path`.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::ScriptNotFound`] if the file cannot be stat'ed or read
    /// - [`PolicyError::ScriptInvalid`] if it does not compile
    pub fn get_or_compile(&self, path: &Path) -> Result<Arc<CompiledScript>, PolicyError> {
        let modified_at = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| PolicyError::not_found(path, e))?;

        let cell = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(path.to_path_buf()).or_default())
        };
        let mut slot = cell.lock();

        if let Some(cached) = slot.as_ref() {
            if cached.modified_at() >= modified_at {
                debug!(path = %path.display(), "Script cache hit");
                return match cached {
                    Slot::Ready(script) => Ok(Arc::clone(script)),
                    Slot::Invalid { message, .. } => Err(PolicyError::invalid(path, message.clone())),
                };
            }
            info!(path = %path.display(), "Script changed on disk, reloading");
        }

        let source = std::fs::read_to_string(path).map_err(|e| PolicyError::not_found(path, e))?;
        self.compiles.fetch_add(1, Ordering::Relaxed);

        match check_syntax(path, &source) {
            Ok(()) => {
                let script = Arc::new(CompiledScript {
                    path: path.to_path_buf(),
                    source: Arc::from(source),
                    modified_at,
                });
                *slot = Some(Slot::Ready(Arc::clone(&script)));
                Ok(script)
            }
            Err(message) => {
                *slot = Some(Slot::Invalid {
                    modified_at,
                    message: message.clone(),
                });
                Err(PolicyError::invalid(path, message))
            }
        }
    }

    /// Number of times a changed script has been read and syntax-checked.
    #[must_use]
    pub fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    /// Forgets every cached script.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

fn check_syntax(path: &Path, source: &str) -> Result<(), String> {
    let lua = Lua::new_with(StdLib::NONE, LuaOptions::default()).map_err(|e| e.to_string())?;
    let name = path
        .file_name()
        .map(|n| format!("@{}", n.to_string_lossy()))
        .unwrap_or_else(|| "@script".to_string());
    lua.load(source)
        .set_name(name)
        .into_function()
        .map(|_| ())
        .map_err(|e| crate::error::format_lua_error(&e))
}
