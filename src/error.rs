//! Error Types
//!
//! Failures raised by the connection guard, the domain resolver and the pool
//! manager. Host-side failures arrive as [`HostError`] and are translated at
//! the call site into the variant that matches what the caller asked for.

use crate::host::HostError;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, HyperError>;

/// Error types for hypervisor operations
#[derive(Debug, thiserror::Error)]
pub enum HyperError {
    /// Open/reconnect failed, or the connection is present but unresponsive
    #[error("Connection error: {0}")]
    Connection(String),

    /// Domain or pool lookup miss
    #[error("{kind} not found: {key}: {reason}")]
    NotFound {
        kind: &'static str,
        key: String,
        reason: String,
    },

    /// Malformed XML, or the host rejected a define/create call
    #[error("Definition rejected: {0}")]
    Definition(String),

    /// Pool removal aborted while deleting volumes
    #[error("Pool '{pool}' removal aborted at volume '{volume}': {reason}")]
    PartialDeletion {
        pool: String,
        volume: String,
        reason: String,
    },

    /// Any other host call failure
    #[error("Host error: {0}")]
    Host(#[from] HostError),
}

impl HyperError {
    pub(crate) fn connection(err: impl std::fmt::Display) -> Self {
        HyperError::Connection(err.to_string())
    }

    pub(crate) fn not_found(kind: &'static str, key: &str, err: impl std::fmt::Display) -> Self {
        HyperError::NotFound {
            kind,
            key: key.to_string(),
            reason: err.to_string(),
        }
    }

    /// Whether this error means the host could not be reached
    pub fn is_connection(&self) -> bool {
        matches!(self, HyperError::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = HyperError::not_found("Domain", "web-1", "no such domain");
        assert_eq!(err.to_string(), "Domain not found: web-1: no such domain");
        assert!(!err.is_connection());
    }

    #[test]
    fn test_host_error_conversion() {
        let err: HyperError = HostError::Operation("boom".to_string()).into();
        assert!(matches!(err, HyperError::Host(_)));
    }
}
