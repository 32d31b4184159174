//! Configuration types.
//!
//! All types implement [`Default`] for compile-time fallback values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure.
///
/// This is the unified configuration after merging all layers.
///
/// # Example
///
/// ```
/// use vigil_runtime::config::VigilConfig;
///
/// let config = VigilConfig::default();
/// assert_eq!(config.limits.timeout_ms, 5_000);
/// assert_eq!(config.scripts.event_script, "reject-event.lua");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VigilConfig {
    /// Policy script locations.
    pub scripts: ScriptsConfig,

    /// Per-invocation execution limits.
    pub limits: LimitsConfig,

    /// Outbound `fetch` settings.
    pub fetch: FetchConfig,

    /// Logging settings.
    pub log: LogConfig,
}

impl VigilConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes to TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserializes from TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Merges another config into this one.
    ///
    /// Values from `other` override values in `self` only if they
    /// differ from the default. This enables layered configuration.
    pub fn merge(&mut self, other: &Self) {
        self.scripts.merge(&other.scripts);
        self.limits.merge(&other.limits);
        self.fetch.merge(&other.fetch);
        self.log.merge(&other.log);
    }
}

/// Policy script locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Directory holding the policy scripts.
    pub dir: PathBuf,

    /// File name of the event policy, relative to `dir`.
    pub event_script: String,

    /// File name of the filter policy, relative to `dir`.
    pub filter_script: String,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("scripts"),
            event_script: "reject-event.lua".into(),
            filter_script: "reject-filter.lua".into(),
        }
    }
}

impl ScriptsConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.dir != default.dir {
            self.dir = other.dir.clone();
        }
        if other.event_script != default.event_script {
            self.event_script = other.event_script.clone();
        }
        if other.filter_script != default.filter_script {
            self.filter_script = other.filter_script.clone();
        }
    }

    /// Full path of the event policy script.
    #[must_use]
    pub fn event_path(&self) -> PathBuf {
        self.dir.join(&self.event_script)
    }

    /// Full path of the filter policy script.
    #[must_use]
    pub fn filter_path(&self) -> PathBuf {
        self.dir.join(&self.filter_script)
    }
}

/// Per-invocation execution limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Wall-clock budget for one decision, in milliseconds.
    pub timeout_ms: u64,

    /// The deadline is checked every this many VM instructions.
    pub hook_interval: u32,

    /// Maximum memory a single script VM may allocate, in bytes.
    pub memory_limit_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            hook_interval: 10_000,
            memory_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

impl LimitsConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.timeout_ms != default.timeout_ms {
            self.timeout_ms = other.timeout_ms;
        }
        if other.hook_interval != default.hook_interval {
            self.hook_interval = other.hook_interval;
        }
        if other.memory_limit_bytes != default.memory_limit_bytes {
            self.memory_limit_bytes = other.memory_limit_bytes;
        }
    }

    /// The decision timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outbound `fetch` settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-request timeout in seconds.
    pub timeout_secs: u64,

    /// Redirect hops followed before giving up.
    pub max_redirects: u32,

    /// Largest response body read into a script, in bytes.
    pub max_body_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_redirects: 10,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl FetchConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.timeout_secs != default.timeout_secs {
            self.timeout_secs = other.timeout_secs;
        }
        if other.max_redirects != default.max_redirects {
            self.max_redirects = other.max_redirects;
        }
        if other.max_body_bytes != default.max_body_bytes {
            self.max_body_bytes = other.max_body_bytes;
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `"info"` or `"vigil_lua=debug"`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl LogConfig {
    fn merge(&mut self, other: &Self) {
        if other.level != Self::default().level {
            self.level = other.level.clone();
        }
    }
}
