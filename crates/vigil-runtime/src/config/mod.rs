//! Configuration management with hierarchical layering.
//!
//! # Architecture
//!
//! ```text
//! Priority (highest to lowest):
//!
//! ┌──────────────────────────────────────────┐
//! │  1. Environment Variables (VIGIL_*)      │  Runtime override
//! ├──────────────────────────────────────────┤
//! │  2. Project Config (.vigil/config.toml)  │  Deployment-specific
//! ├──────────────────────────────────────────┤
//! │  3. Global Config (~/.vigil/config.toml) │  Operator defaults
//! ├──────────────────────────────────────────┤
//! │  4. Default Values (compile-time)        │  Fallback
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Config Field | Type |
//! |----------|--------------|------|
//! | `VIGIL_SCRIPTS_DIR` | `scripts.dir` | PathBuf |
//! | `VIGIL_TIMEOUT_MS` | `limits.timeout_ms` | u64 |
//! | `VIGIL_LOG_LEVEL` | `log.level` | String |
//!
//! # Example Configuration
//!
//! ```toml
//! # .vigil/config.toml
//!
//! [scripts]
//! dir = "policies"
//! event_script = "reject-event.lua"
//! filter_script = "reject-filter.lua"
//!
//! [limits]
//! timeout_ms = 5000
//! hook_interval = 10000
//! memory_limit_bytes = 67108864
//!
//! [fetch]
//! timeout_secs = 30
//! max_redirects = 10
//! max_body_bytes = 10485760
//!
//! [log]
//! level = "info"
//! ```

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use types::{FetchConfig, LimitsConfig, LogConfig, ScriptsConfig, VigilConfig};

/// Default global config directory.
pub fn default_config_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".vigil")
}

/// Default global config file path.
pub fn default_config_path() -> std::path::PathBuf {
    default_config_dir().join("config.toml")
}

/// Project config directory name.
pub const PROJECT_CONFIG_DIR: &str = ".vigil";

/// Project config file name.
pub const PROJECT_CONFIG_FILE: &str = "config.toml";
