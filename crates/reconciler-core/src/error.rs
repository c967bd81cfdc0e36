//! Error types for installer operations.
//!
//! The taxonomy follows how far a failure is allowed to travel:
//!
//! - [`ValidationError`]: a malformed resource, dropped at registration
//! - [`ExecutionError`]: returned by processors, classified transient or permanent
//! - [`PersistenceError`]: the tracking store could not flush a change
//! - [`InstallerError`]: the only errors a producer sees synchronously

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::resource::ResourceKind;

/// Result type alias for facade operations.
pub type InstallerResult<T> = Result<T, InstallerError>;

/// Result type alias for processor calls.
pub type ExecResult<T> = Result<T, ExecutionError>;

/// Result type alias for tracking store operations.
pub type PersistResult<T> = Result<T, PersistenceError>;

/// A producer resource that cannot be registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Resource has a blank id.
    #[error("Resource has no id")]
    MissingId,

    /// Resource has a blank entity id.
    #[error("Resource '{id}' has no entity id")]
    MissingEntityId {
        /// The resource id.
        id: String,
    },

    /// Resource type name does not resolve to a kind.
    #[error("Resource '{id}' has unresolvable type '{resource_type}'")]
    UnknownKind {
        /// The resource id.
        id: String,
        /// The type name the producer supplied.
        resource_type: String,
    },
}

/// Failure signalled by a processor, or by dispatch itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Worth retrying later (e.g. a dependency is not resolvable yet).
    #[error("Transient failure: {reason}")]
    Transient {
        /// Why the operation failed.
        reason: String,
    },

    /// Will never succeed as submitted (e.g. malformed payload).
    #[error("Permanent failure: {reason}")]
    Permanent {
        /// Why the operation failed.
        reason: String,
    },

    /// No processor is registered for the resource kind.
    #[error("No processor registered for kind '{kind}'")]
    NoProcessor {
        /// The kind that could not be dispatched.
        kind: ResourceKind,
    },
}

impl ExecutionError {
    /// Creates a transient error.
    pub fn transient(reason: impl Into<String>) -> Self {
        ExecutionError::Transient {
            reason: reason.into(),
        }
    }

    /// Creates a permanent error.
    pub fn permanent(reason: impl Into<String>) -> Self {
        ExecutionError::Permanent {
            reason: reason.into(),
        }
    }

    /// Returns true if the task should be re-queued.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::Transient { .. })
    }
}

/// The tracking store failed to make a change durable.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Record could not be serialized.
    #[error("Failed to encode record for '{entity_id}': {message}")]
    Encode {
        /// The entity being written.
        entity_id: String,
        /// Error message.
        message: String,
    },

    /// Record on disk could not be parsed.
    #[error("Failed to decode record {path}: {message}")]
    Decode {
        /// The offending file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Record was written by an incompatible format version.
    #[error("Unsupported record version {version} in {path}")]
    UnsupportedVersion {
        /// The offending file.
        path: PathBuf,
        /// Version found in the record.
        version: u32,
    },

    /// Backend-specific failure.
    #[error("Backend failure: {message}")]
    Backend {
        /// Error message.
        message: String,
    },
}

impl PersistenceError {
    /// Creates an I/O error for a path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        PersistenceError::Backend {
            message: message.into(),
        }
    }

    /// Returns true if writing the same record again may succeed.
    ///
    /// Encoding failures and rejected file names fail identically every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            PersistenceError::Io { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::InvalidFilename | io::ErrorKind::InvalidInput
            ),
            PersistenceError::Backend { .. } => true,
            PersistenceError::Encode { .. }
            | PersistenceError::Decode { .. }
            | PersistenceError::UnsupportedVersion { .. } => false,
        }
    }
}

/// Errors surfaced synchronously by the installer facade.
#[derive(Debug, Error)]
pub enum InstallerError {
    /// Scheme is empty or contains a colon.
    #[error("Invalid scheme '{scheme}': {reason}")]
    InvalidScheme {
        /// The rejected scheme.
        scheme: String,
        /// Why it was rejected.
        reason: String,
    },

    /// `update_resources` was called before `register_resources`.
    #[error("Scheme '{scheme}' has not registered its resource set")]
    SchemeNotRegistered {
        /// The scheme.
        scheme: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Tracking store failure during startup.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl InstallerError {
    /// Creates an invalid scheme error.
    pub fn invalid_scheme(scheme: impl Into<String>, reason: impl Into<String>) -> Self {
        InstallerError::InvalidScheme {
            scheme: scheme.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        InstallerError::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_classification() {
        assert!(ExecutionError::transient("dependency missing").is_retryable());
        assert!(!ExecutionError::permanent("bad manifest").is_retryable());
        assert!(!ExecutionError::NoProcessor {
            kind: ResourceKind::Config
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ExecutionError::NoProcessor {
            kind: ResourceKind::Module,
        };
        assert_eq!(err.to_string(), "No processor registered for kind 'module'");

        let err = InstallerError::invalid_scheme("a:b", "scheme must not contain ':'");
        assert_eq!(
            err.to_string(),
            "Invalid scheme 'a:b': scheme must not contain ':'"
        );
    }

    #[test]
    fn test_persistence_error_source() {
        use std::error::Error as _;

        let err = PersistenceError::io(
            "/tmp/x",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/x"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_persistence_error_classification() {
        assert!(PersistenceError::backend("disk full").is_retryable());
        assert!(PersistenceError::io(
            "/tmp/x",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied")
        )
        .is_retryable());
        assert!(!PersistenceError::io(
            "/tmp/x",
            io::Error::new(io::ErrorKind::InvalidFilename, "File name too long")
        )
        .is_retryable());
        assert!(!PersistenceError::Encode {
            entity_id: "e1".to_string(),
            message: "key must be a string".to_string(),
        }
        .is_retryable());
    }
}
