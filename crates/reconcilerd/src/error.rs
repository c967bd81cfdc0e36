//! Daemon error types.

use std::io;
use std::path::PathBuf;

use reconciler_core::InstallerError;
use thiserror::Error;

/// Result type alias for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration file could not be read or parsed.
    #[error("Failed to load daemon configuration {path}: {message}")]
    Config {
        /// The configuration file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Manifest or a file it references could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// The file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Manifest is not valid JSON or has the wrong shape.
    #[error("Invalid manifest {path}: {message}")]
    Manifest {
        /// The manifest file.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// File watcher could not be set up.
    #[error("Failed to watch {path}: {message}")]
    Watch {
        /// The watched directory.
        path: PathBuf,
        /// Watcher error message.
        message: String,
    },

    /// Installer rejected the call.
    #[error(transparent)]
    Installer(#[from] InstallerError),
}

impl DaemonError {
    /// Creates a read error.
    pub fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }
}
