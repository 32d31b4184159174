//! Unified error interface for vigil.
//!
//! Every error enum in the workspace implements [`ErrorCode`] so that the
//! engine can log a stable, machine-readable code next to the human text.
//!
//! # Example
//!
//! ```
//! use vigil_types::ErrorCode;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     NotFound(String),
//!     Timeout,
//! }
//!
//! impl ErrorCode for MyError {
//!     fn code(&self) -> &'static str {
//!         match self {
//!             Self::NotFound(_) => "NOT_FOUND",
//!             Self::Timeout => "TIMEOUT",
//!         }
//!     }
//!
//!     fn is_recoverable(&self) -> bool {
//!         matches!(self, Self::Timeout)
//!     }
//! }
//!
//! let err = MyError::Timeout;
//! assert_eq!(err.code(), "TIMEOUT");
//! assert!(err.is_recoverable());
//! ```

use thiserror::Error;

/// Machine-readable error code interface.
///
/// # Code Format
///
/// - **UPPER_SNAKE_CASE**: e.g. `"SCRIPT_TIMEOUT"`
/// - **Namespace-prefixed**: e.g. `"TYPE_"`, `"CONFIG_"`, `"SCRIPT_"`
/// - **Stable**: codes are part of the log contract and never change
///
/// # Recoverability
///
/// An error is recoverable when retrying (or the operator fixing a file)
/// may succeed without a code change: timeouts, missing scripts,
/// transient store failures.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;

    /// Returns whether the error is recoverable.
    fn is_recoverable(&self) -> bool;
}

/// Errors produced while decoding domain types from their wire form.
#[derive(Debug, Error)]
pub enum TypeError {
    /// The input was not valid JSON or did not have the expected shape.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    /// A recognized filter key holds a value of the wrong shape.
    #[error("invalid filter field '{field}': expected {expected}")]
    InvalidFilterField {
        field: String,
        expected: &'static str,
    },
}

impl TypeError {
    /// Creates an invalid filter field error.
    pub fn invalid_field(field: impl Into<String>, expected: &'static str) -> Self {
        Self::InvalidFilterField {
            field: field.into(),
            expected,
        }
    }
}

impl ErrorCode for TypeError {
    fn code(&self) -> &'static str {
        match self {
            Self::Json(_) => "TYPE_INVALID_JSON",
            Self::InvalidFilterField { .. } => "TYPE_INVALID_FILTER",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Validates that an error code follows the workspace conventions.
///
/// # Panics
///
/// Panics with a descriptive message if the code is empty, lacks the
/// expected prefix, or is not UPPER_SNAKE_CASE.
///
/// # Example
///
/// ```
/// use vigil_types::{ErrorCode, assert_error_code};
///
/// #[derive(Debug)]
/// enum MyError { Timeout }
///
/// impl ErrorCode for MyError {
///     fn code(&self) -> &'static str { "MY_TIMEOUT" }
///     fn is_recoverable(&self) -> bool { true }
/// }
///
/// assert_error_code(&MyError::Timeout, "MY_");
/// ```
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();

    assert!(!code.is_empty(), "Error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "Error code '{}' must start with prefix '{}'",
        code,
        expected_prefix
    );
    assert!(
        is_upper_snake_case(code),
        "Error code '{}' must be UPPER_SNAKE_CASE",
        code
    );
}

/// Validates multiple error codes at once.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    if s.is_empty() || s.starts_with('_') || s.ends_with('_') || s.contains("__") {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
