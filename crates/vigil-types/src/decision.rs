//! Policy decisions.

use serde::Serialize;
use std::fmt;

/// Message carried by a decision before any script outcome overwrote it.
pub const DEFAULT_REJECTION: &str = "failed to run policy script";

/// Message substituted when a rejection would otherwise carry no reason.
pub const FALLBACK_REJECTION: &str = "blocked: rejected by policy";

/// The accept/reject verdict of one policy invocation.
///
/// Construction keeps two invariants:
///
/// - an accepted decision never carries a message
/// - a rejected decision always carries a non-empty message
///
/// ```
/// use vigil_types::Decision;
///
/// assert!(!Decision::accept().is_rejected());
/// assert_eq!(Decision::reject("nope").message(), "nope");
/// assert!(!Decision::reject("").message().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    reject: bool,
    message: String,
}

impl Decision {
    /// Accepts the event or filter.
    #[must_use]
    pub fn accept() -> Self {
        Self {
            reject: false,
            message: String::new(),
        }
    }

    /// Rejects with `message`, substituting [`FALLBACK_REJECTION`] when empty.
    #[must_use]
    pub fn reject(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            FALLBACK_REJECTION.to_string()
        } else {
            message
        };
        Self {
            reject: true,
            message,
        }
    }

    /// The fail-closed default: reject with [`DEFAULT_REJECTION`].
    #[must_use]
    pub fn fail_closed() -> Self {
        Self::reject(DEFAULT_REJECTION)
    }

    /// Returns true if the input was rejected.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.reject
    }

    /// Returns true if the input was accepted.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        !self.reject
    }

    /// Rejection reason; empty for accepted decisions.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Splits into `(reject, message)`, the shape relay hooks expect.
    #[must_use]
    pub fn into_parts(self) -> (bool, String) {
        (self.reject, self.message)
    }
}

impl Default for Decision {
    fn default() -> Self {
        Self::fail_closed()
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reject {
            write!(f, "reject: {}", self.message)
        } else {
            f.write_str("accept")
        }
    }
}
