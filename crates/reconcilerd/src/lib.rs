//! reconcilerd - reconciling installer daemon
//!
//! Hosts an [`Installer`](reconciler_core::Installer) with filesystem
//! processors and a manifest-file producer.

mod config;
mod error;
mod manifest;
mod processors;

pub use config::DaemonConfig;
pub use error::{DaemonError, DaemonResult};
pub use manifest::{Manifest, ManifestEntry, ManifestProducer};
pub use processors::{ConfigFileProcessor, ModuleFileProcessor};
