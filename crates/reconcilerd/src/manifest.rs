//! Manifest file producer.
//!
//! A manifest is a JSON document naming a scheme and listing its resources:
//!
//! ```json
//! {
//!   "scheme": "manifest",
//!   "resources": [
//!     { "id": "bundles/a.jar", "type": "module", "entity_id": "org.example.a",
//!       "file": "bundles/a.jar" },
//!     { "id": "log.cfg", "type": "config", "entity_id": "org.example.log",
//!       "payload": { "format": "structured", "data": { "level": "info" } } }
//!   ]
//! }
//! ```
//!
//! `file` entries are read relative to the manifest's directory and become
//! the module's byte payload. The whole set is re-registered whenever the
//! manifest or a referenced file changes content; a deleted manifest
//! withdraws it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use reconciler_core::{InstallableResource, Installer, Payload, RegistrationAck};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DaemonError, DaemonResult};

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// The declared resource
    #[serde(flatten)]
    pub resource: InstallableResource,
    /// File holding the payload bytes, relative to the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Parsed manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Scheme the resources are registered under
    pub scheme: String,
    /// Declared resources
    #[serde(default)]
    pub resources: Vec<ManifestEntry>,
}

impl Manifest {
    /// Reads and parses a manifest file.
    pub fn load(path: &Path) -> DaemonResult<Self> {
        let raw = fs::read(path).map_err(|e| DaemonError::read(path, e))?;
        Self::parse(path, &raw)
    }

    /// Parses manifest content read from `path`.
    pub fn parse(path: &Path, raw: &[u8]) -> DaemonResult<Self> {
        serde_json::from_slice(raw).map_err(|e| DaemonError::Manifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Resolves `file` entries against `base_dir` and returns the resources.
    pub fn into_resources(self, base_dir: &Path) -> DaemonResult<Vec<InstallableResource>> {
        self.resources
            .into_iter()
            .map(|entry| {
                let mut resource = entry.resource;
                if let Some(file) = entry.file {
                    let path = base_dir.join(file);
                    let bytes = fs::read(&path).map_err(|e| DaemonError::read(&path, e))?;
                    resource.payload = Payload::Bytes(bytes);
                }
                Ok(resource)
            })
            .collect()
    }
}

/// Registers a manifest file's contents whenever they change.
///
/// Changes are detected by a digest over the manifest and the files it
/// references, so rewrites that keep the modification time are still seen.
pub struct ManifestProducer {
    path: PathBuf,
    installer: Arc<Installer>,
    last_digest: Option<String>,
    scheme: Option<String>,
}

impl ManifestProducer {
    /// Creates a producer for `path`; nothing is read until the first poll.
    pub fn new(path: impl Into<PathBuf>, installer: Arc<Installer>) -> Self {
        Self {
            path: path.into(),
            installer,
            last_digest: None,
            scheme: None,
        }
    }

    /// Returns the manifest path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn base_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Registers the manifest if its content changed since the last poll.
    ///
    /// Returns the acknowledgement when something was registered.
    pub fn poll(&mut self) -> DaemonResult<Option<RegistrationAck>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return self.withdraw(),
            Err(e) => return Err(DaemonError::read(&self.path, e)),
        };
        let manifest = Manifest::parse(&self.path, &raw)?;
        let scheme = manifest.scheme.clone();
        let resources = manifest.into_resources(self.base_dir())?;

        let digest = content_digest(&raw, &resources);
        if self.last_digest.as_deref() == Some(digest.as_str()) {
            return Ok(None);
        }
        debug!(
            "Manifest {} declares {} resources under '{}'",
            self.path.display(),
            resources.len(),
            scheme
        );

        // A renamed scheme leaves the old one's resources behind otherwise.
        if let Some(previous) = self.scheme.take().filter(|p| *p != scheme) {
            info!("Manifest scheme changed from '{}' to '{}'", previous, scheme);
            self.installer.register_resources(&previous, Vec::new())?;
        }

        let ack = self.installer.register_resources(&scheme, resources)?;
        self.last_digest = Some(digest);
        self.scheme = Some(scheme);
        info!(
            "Registered manifest {}: {} accepted, {} dropped, {} tasks",
            self.path.display(),
            ack.accepted,
            ack.dropped.len(),
            ack.tasks_created
        );
        Ok(Some(ack))
    }

    fn withdraw(&mut self) -> DaemonResult<Option<RegistrationAck>> {
        self.last_digest = None;
        match self.scheme.take() {
            Some(scheme) => {
                warn!(
                    "Manifest {} removed, withdrawing scheme '{}'",
                    self.path.display(),
                    scheme
                );
                Ok(Some(self.installer.register_resources(&scheme, Vec::new())?))
            }
            None => Ok(None),
        }
    }

    /// Watches the manifest's directory; every filesystem event in it is
    /// forwarded as a poll request.
    fn watch(&self) -> DaemonResult<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
        let dir = self.base_dir().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if matches!(event.kind, EventKind::Access(_)) => {}
                Ok(_) => {
                    let _ = tx.send(());
                }
                Err(e) => error!("Manifest watcher error: {}", e),
            },
            Config::default(),
        )
        .map_err(|e| DaemonError::Watch {
            path: dir.clone(),
            message: e.to_string(),
        })?;
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .map_err(|e| DaemonError::Watch {
                path: dir.clone(),
                message: e.to_string(),
            })?;

        info!("Watching manifest directory {}", dir.display());
        Ok((watcher, rx))
    }

    /// Re-registers on filesystem events until `shutdown` is cancelled.
    ///
    /// `interval` is a fallback poll for when events are missed or the
    /// watcher could not be set up. Errors are logged and retried on the
    /// next event or tick; the last good registration stays in effect
    /// meanwhile.
    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        let (_watcher, mut events) = match self.watch() {
            Ok((watcher, events)) => (Some(watcher), Some(events)),
            Err(e) => {
                warn!("{}; falling back to polling every {:?}", e, interval);
                (None, None)
            }
        };

        let mut ticker = tokio::time::interval(interval);
        loop {
            let from_event = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => false,
                Some(()) = recv_event(&mut events) => true,
            };
            if from_event {
                // One write usually raises several events.
                tokio::time::sleep(EVENT_SETTLE).await;
                if let Some(events) = events.as_mut() {
                    while events.try_recv().is_ok() {}
                }
            }
            if let Err(e) = self.poll() {
                error!("Manifest poll failed: {}", e);
            }
        }
        info!("Manifest watcher stopped");
    }
}

/// Delay after a filesystem event before the manifest is read.
const EVENT_SETTLE: Duration = Duration::from_millis(50);

async fn recv_event(events: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

fn content_digest(raw: &[u8], resources: &[InstallableResource]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    for resource in resources {
        hasher.update(resource.payload.digest().as_bytes());
    }
    hex::encode(hasher.finalize())
}

impl std::fmt::Debug for ManifestProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestProducer")
            .field("path", &self.path)
            .field("scheme", &self.scheme)
            .field("last_digest", &self.last_digest)
            .finish()
    }
}
