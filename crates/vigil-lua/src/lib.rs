//! Lua policy scripts for vigil.
//!
//! Operators drop two scripts in the scripts directory. Each returns a
//! function that decides whether an incoming event or subscription filter
//! is accepted.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 PolicyEngine::decide()                   │
//! │                                                          │
//! │  ScriptCache ──► sandbox::new_vm ──► globals::install    │
//! │  (mtime keyed)    (limits, hook)     (log, json, timers, │
//! │                                       Promise, fetch)    │
//! │        │                                                 │
//! │        ▼                                                 │
//! │  entry(event | filter, relay, conn)                      │
//! │        │               │        │                        │
//! │        │      EventQuery, GlobalStore, SessionStore      │
//! │        ▼                                                 │
//! │  Promise? ──► jobs::drain (microtasks, timers, deadline) │
//! │        │                                                 │
//! │        ▼                                                 │
//! │  nil / "" ─► accept      "reason" ─► reject              │
//! │  any error ─► reject with an explanatory message         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Script
//!
//! ```lua
//! -- reject-event.lua
//! return function(event, relay, conn)
//!   if event.kind ~= 1 then
//!     return "we only accept kind:1 notes"
//!   end
//!   local seen = conn.store.get("seen") or 0
//!   conn.store.set("seen", seen + 1)
//!   return delay(10):next(function() return nil end)
//! end
//! ```
//!
//! # Hot Reload
//!
//! Scripts are re-read whenever their modification time advances; there is
//! no reload call.

pub mod bridge;
pub mod cache;
pub mod capabilities;
pub mod defaults;
pub mod engine;
mod error;
pub mod fetch;
pub mod globals;
pub mod jobs;
pub mod promise;
pub mod sandbox;
mod service;

pub use cache::{CompiledScript, ScriptCache};
pub use defaults::ensure_default_scripts;
pub use engine::{PolicyEngine, PolicyInput};
pub use error::{format_lua_error, PolicyError};
pub use fetch::FetchError;
pub use sandbox::ExecLimits;
pub use service::PolicyService;
