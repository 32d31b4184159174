//! Policy engine errors.
//!
//! Every variant is converted into a rejecting [`Decision`] at the engine
//! boundary; none of them ever reaches the relay as an error value.
//!
//! [`Decision`]: vigil_types::Decision

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vigil_runtime::QueryError;
use vigil_types::{ErrorCode, TypeError};

/// Errors that can occur while deciding on an event or filter.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The script file could not be stat'ed or read.
    #[error("could not read policy script '{}': {source}", path.display())]
    ScriptNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The script failed to compile or did not return an entry function.
    #[error("invalid policy script '{}': {message}", path.display())]
    ScriptInvalid { path: PathBuf, message: String },

    /// The entry function raised an error or its promise was rejected.
    #[error("policy script failed: {0}")]
    ScriptRuntime(String),

    /// The invocation exceeded its wall-clock budget.
    #[error("policy script timed out after {0:?}")]
    ScriptTimeout(Duration),

    /// A script value could not be read as a filter.
    #[error("malformed filter: {0}")]
    MalformedFilter(#[from] TypeError),

    /// A value has no representation on the other side of the bridge.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// The storage collaborator reported an error.
    #[error("query failed: {0}")]
    QueryFailed(#[from] QueryError),

    /// Failure inside the Lua VM outside of script code.
    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),
}

impl PolicyError {
    /// Creates a script-not-found error.
    pub fn not_found(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ScriptNotFound {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid-script error.
    pub fn invalid(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ScriptInvalid {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an unsupported-type error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::UnsupportedType(what.into())
    }

    /// The rejection reason shown to the client.
    ///
    /// Only the script's file name is included, never the full path.
    #[must_use]
    pub fn rejection_message(&self) -> String {
        match self {
            Self::ScriptNotFound { path, .. } => {
                format!("error: could not read policy script {}", file_name(path))
            }
            Self::ScriptInvalid { message, .. } => format!("error: invalid policy script: {message}"),
            Self::ScriptRuntime(message) => format!("error: {message}"),
            Self::ScriptTimeout(_) => "error: policy script timed out".to_string(),
            Self::Lua(e) => format!("error: {}", format_lua_error(e)),
            other => format!("error: {other}"),
        }
    }
}

impl ErrorCode for PolicyError {
    fn code(&self) -> &'static str {
        match self {
            Self::ScriptNotFound { .. } => "SCRIPT_NOT_FOUND",
            Self::ScriptInvalid { .. } => "SCRIPT_INVALID",
            Self::ScriptRuntime(_) => "SCRIPT_RUNTIME_ERROR",
            Self::ScriptTimeout(_) => "SCRIPT_TIMEOUT",
            Self::MalformedFilter(_) => "SCRIPT_MALFORMED_FILTER",
            Self::UnsupportedType(_) => "SCRIPT_UNSUPPORTED_TYPE",
            Self::QueryFailed(_) => "SCRIPT_QUERY_FAILED",
            Self::Lua(_) => "SCRIPT_LUA",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::ScriptNotFound { .. } | Self::ScriptTimeout(_) => true,
            Self::QueryFailed(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Renders a Lua error for humans, unwrapping callback wrappers.
///
/// Stack tracebacks are cut off; they belong in logs, not in rejections.
pub fn format_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => strip_traceback(msg).to_string(),
        mlua::Error::CallbackError { cause, .. } => format_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("compile error: {message}"),
        mlua::Error::MemoryError(msg) => format!("memory limit exceeded: {msg}"),
        mlua::Error::ExternalError(e) => e.to_string(),
        mlua::Error::WithContext { context, cause } => {
            format!("{context}: {}", format_lua_error(cause))
        }
        _ => err.to_string(),
    }
}

fn strip_traceback(msg: &str) -> &str {
    msg.split_once("\nstack traceback:")
        .map_or(msg, |(head, _)| head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vigil_types::assert_error_codes;

    #[test]
    fn all_codes_are_script_prefixed() {
        assert_error_codes(
            &[
                PolicyError::not_found("/x", std::io::Error::other("gone")),
                PolicyError::invalid("/x", "bad"),
                PolicyError::ScriptRuntime("boom".into()),
                PolicyError::ScriptTimeout(Duration::from_secs(1)),
                PolicyError::MalformedFilter(TypeError::invalid_field("kinds", "array")),
                PolicyError::unsupported("function"),
                PolicyError::QueryFailed(QueryError::Failed("x".into())),
                PolicyError::Lua(mlua::Error::RuntimeError("x".into())),
            ],
            "SCRIPT_",
        );
    }

    #[test]
    fn rejection_message_hides_directory() {
        let err = PolicyError::not_found(
            "/srv/secret/reject-event.lua",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        let msg = err.rejection_message();
        assert_eq!(msg, "error: could not read policy script reject-event.lua");
        assert!(!msg.contains("/srv/secret"));
        assert!(err.to_string().contains("/srv/secret"));
    }

    #[test]
    fn format_unwraps_callback_error() {
        let inner = mlua::Error::RuntimeError("inner".into());
        let wrapped = mlua::Error::CallbackError {
            traceback: "tb".into(),
            cause: Arc::new(inner),
        };
        assert_eq!(format_lua_error(&wrapped), "inner");
    }

    #[test]
    fn format_drops_stack_traceback() {
        let err = mlua::Error::RuntimeError(
            "kaboom\nstack traceback:\n\t[C]: in function 'error'\n\treject-event.lua:1: in ?".into(),
        );
        assert_eq!(format_lua_error(&err), "kaboom");

        let lua = mlua::Lua::new();
        let raised = lua.load("error('raised', 0)").exec().unwrap_err();
        assert_eq!(format_lua_error(&raised), "raised");
    }

    #[test]
    fn format_external_error_uses_display() {
        let err = mlua::Error::external(PolicyError::unsupported("thread"));
        assert_eq!(format_lua_error(&err), "unsupported type: thread");
    }

    #[test]
    fn recoverability() {
        assert!(PolicyError::ScriptTimeout(Duration::from_millis(1)).is_recoverable());
        assert!(!PolicyError::invalid("/x", "y").is_recoverable());
        assert!(PolicyError::QueryFailed(QueryError::Unavailable("db".into())).is_recoverable());
    }
}
