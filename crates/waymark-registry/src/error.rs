//! Registry error types
//!
//! TigerStyle: Explicit error variants with context.
//!
//! Errors are `Clone` so background tasks can publish them on a broadcast
//! failure channel as well as log them.

use crate::store::LeaseId;
use thiserror::Error;

/// Registry-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Coordination store unreachable or rejected the call
    #[error("store unavailable during {operation}: {reason}")]
    StoreUnavailable { operation: String, reason: String },

    /// Coordination store call exceeded its timeout
    #[error("store {operation} timed out after {timeout_ms}ms")]
    StoreTimeout { operation: String, timeout_ms: u64 },

    /// Store session was closed
    #[error("store session closed")]
    StoreClosed,

    /// Requested revision has been compacted away
    #[error("revision {requested} compacted, oldest retained is {compact_revision}")]
    Compacted {
        requested: u64,
        compact_revision: u64,
    },

    /// Lease does not exist (expired or revoked)
    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: LeaseId },

    /// Registration could not be completed
    #[error("registration of {key} failed: {reason}")]
    RegistrationFailed { key: String, reason: String },

    /// Registrar already holds a registration
    #[error("already registered under {key}")]
    AlreadyRegistered { key: String },

    /// Record payload could not be parsed
    #[error("invalid record at {key}: {reason}")]
    InvalidRecord { key: String, reason: String },

    /// Watch on a prefix could not be re-established
    #[error("watch on {prefix} failed after {attempts} attempts: {reason}")]
    WatchFailed {
        prefix: String,
        attempts: u32,
        reason: String,
    },

    /// Lease renewal stopped and could not be recovered
    #[error("keepalive for {key} (lease {lease_id}) lost: {reason}")]
    KeepaliveLost {
        key: String,
        lease_id: LeaseId,
        reason: String,
    },

    /// Component already started
    #[error("already started")]
    AlreadyStarted,

    /// Configuration rejected
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// Internal registry error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RegistryError {
    /// Create a store unavailable error
    pub fn store_unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a registration failed error
    pub fn registration_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid record error
    pub fn invalid_record(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error indicates a retriable condition
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::StoreTimeout { .. } | Self::Compacted { .. }
        )
    }
}

impl From<waymark_core::Error> for RegistryError {
    fn from(err: waymark_core::Error) -> Self {
        Self::Config {
            reason: err.to_string(),
        }
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::invalid_record("/svc/a", "missing field `ip`");
        assert!(err.to_string().contains("/svc/a"));
        assert!(err.to_string().contains("ip"));
    }

    #[test]
    fn test_error_retriable() {
        let timeout = RegistryError::StoreTimeout {
            operation: "get".into(),
            timeout_ms: 1000,
        };
        assert!(timeout.is_retriable());

        let invalid = RegistryError::invalid_record("/svc/a", "bad json");
        assert!(!invalid.is_retriable());
    }

    #[test]
    fn test_from_core_error() {
        let core = waymark_core::Error::invalid_configuration("registration.ttl_secs", "0");
        let err: RegistryError = core.into();
        assert!(matches!(err, RegistryError::Config { .. }));
    }
}
