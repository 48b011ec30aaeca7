//! Error types for hosted cluster lifecycle tests
//!
//! Errors carry enough context (condition names, elapsed time, object names)
//! to produce a useful test failure message without extra logging at the
//! call site.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for harness operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Optimistic concurrency conflict on write
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Kind of the object being written
        kind: String,
        /// namespace/name of the object
        name: String,
        /// Server or store message
        message: String,
    },

    /// A convergence condition did not hold before the deadline
    #[error(
        "timed out after {elapsed:?} waiting for {condition}{}",
        last_error_suffix(.last_error)
    )]
    Timeout {
        /// Human-readable description of what was awaited
        condition: String,
        /// Time spent polling
        elapsed: Duration,
        /// Last transient error the predicate reported, if any
        last_error: Option<String>,
    },

    /// Polling was cancelled through the scenario's cancellation token
    #[error("cancelled after {elapsed:?} while waiting for {condition}")]
    Cancelled {
        /// Human-readable description of what was awaited
        condition: String,
        /// Time spent polling before cancellation
        elapsed: Duration,
    },

    /// Kubeconfig payload could not be parsed or turned into a client
    #[error("kubeconfig error: {message}")]
    Kubeconfig {
        /// Description of what failed
        message: String,
    },

    /// Guest API rejected or could not use the supplied credentials
    #[error("authentication failed: {message}")]
    Authentication {
        /// Description of what failed
        message: String,
    },

    /// A check inside a validation step did not hold
    #[error("assertion failed: {message}")]
    Assertion {
        /// Description of the failed expectation
        message: String,
    },

    /// Invalid configuration or cluster request
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}

impl Error {
    /// Create a conflict error for an object
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a kubeconfig error
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            message: msg.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication {
            message: msg.into(),
        }
    }

    /// Create an assertion error
    pub fn assertion(msg: impl Into<String>) -> Self {
        Self::Assertion {
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for write conflicts, whether reported by the store or the API server
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// True for requests the API server refused (RBAC or admission)
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 403)
    }

    /// True for "object does not exist (yet)" API errors
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Errors that continued polling can never resolve
    ///
    /// Transient API failures keep a poll going; these abort it at once and
    /// fail the step.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Assertion { .. }
                | Self::Authentication { .. }
                | Self::Validation { .. }
                | Self::Kubeconfig { .. }
                | Self::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_includes_condition_elapsed_and_last_error() {
        let err = Error::Timeout {
            condition: "kubeconfig secret clusters/demo-admin-kubeconfig".to_string(),
            elapsed: Duration::from_secs(30),
            last_error: Some("connection refused".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("30s"));
        assert!(msg.contains("kubeconfig secret clusters/demo-admin-kubeconfig"));
        assert!(msg.contains("last error: connection refused"));
    }

    #[test]
    fn timeout_message_without_last_error() {
        let err = Error::Timeout {
            condition: "nodes".to_string(),
            elapsed: Duration::from_secs(1),
            last_error: None,
        };
        assert!(!err.to_string().contains("last error"));
    }

    #[test]
    fn api_409_is_a_conflict() {
        let err = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
        assert!(!err.is_terminal());
    }

    #[test]
    fn api_403_is_forbidden() {
        let err = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "violates PodSecurity \"restricted:latest\"".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }));
        assert!(err.is_forbidden());
        assert!(!err.is_conflict());
        assert!(!Error::assertion("x").is_forbidden());
    }

    #[test]
    fn terminal_classification() {
        assert!(Error::assertion("x").is_terminal());
        assert!(Error::authentication("x").is_terminal());
        assert!(!Error::conflict("Secret", "a/b", "stale").is_terminal());
        assert!(!Error::internal("flaky").is_terminal());
    }
}
