//! Installer wired to scripted processors and a flaky store

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use reconciler_core::{
    InstallEvent, Installer, InstallerConfig, InstallerResult, ProcessorRegistry, TrackingStore,
};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::fixtures::{FlakyBackend, ScriptedProcessor};
use crate::verification::{EventLog, StoreVerifier};

/// Upper bound on passes in [`InstallerHarness::settle`].
pub const SETTLE_MAX_PASSES: usize = 64;

/// Configuration for deterministic tests: no backoff, a grace period
/// that never ends on its own, and three attempts per task.
pub fn test_config() -> InstallerConfig {
    InstallerConfig {
        max_attempts: 3,
        retry_backoff_ms: 0,
        max_retry_backoff_ms: 0,
        grace_period_secs: 3600,
        idle_interval_ms: 10,
        state_dir: PathBuf::from("unused"),
    }
}

/// An installer plus handles on everything around it.
pub struct InstallerHarness {
    /// Installer under test
    pub installer: Arc<Installer>,
    /// Processor for module resources
    pub modules: Arc<ScriptedProcessor>,
    /// Processor for configuration resources
    pub configs: Arc<ScriptedProcessor>,
    /// Shared tracking backend
    pub backend: FlakyBackend,
    config: InstallerConfig,
    events: Mutex<UnboundedReceiver<InstallEvent>>,
}

impl InstallerHarness {
    /// Starts an installer over an empty store with [`test_config`].
    pub fn start() -> InstallerResult<Self> {
        Self::with_config(test_config())
    }

    /// Starts an installer over an empty store.
    pub fn with_config(config: InstallerConfig) -> InstallerResult<Self> {
        Self::assemble(
            config,
            FlakyBackend::new(),
            Arc::new(ScriptedProcessor::modules()),
            Arc::new(ScriptedProcessor::configs()),
        )
    }

    /// Starts an installer over an existing backend.
    pub fn with_backend(config: InstallerConfig, backend: FlakyBackend) -> InstallerResult<Self> {
        Self::assemble(
            config,
            backend,
            Arc::new(ScriptedProcessor::modules()),
            Arc::new(ScriptedProcessor::configs()),
        )
    }

    /// Simulates a process restart: a fresh installer over the same
    /// durable records and the same runtime.
    pub fn restart(&self) -> InstallerResult<Self> {
        Self::assemble(
            self.config.clone(),
            self.backend.clone(),
            Arc::clone(&self.modules),
            Arc::clone(&self.configs),
        )
    }

    /// Starts an installer from explicit parts.
    pub fn assemble(
        config: InstallerConfig,
        backend: FlakyBackend,
        modules: Arc<ScriptedProcessor>,
        configs: Arc<ScriptedProcessor>,
    ) -> InstallerResult<Self> {
        let processors = ProcessorRegistry::new()
            .with(Arc::clone(&modules) as _)
            .with(Arc::clone(&configs) as _);
        let store = TrackingStore::open(backend.clone())?;
        let installer = Installer::new(config.clone(), store, processors)?;
        let events = installer.subscribe();

        Ok(Self {
            installer: Arc::new(installer),
            modules,
            configs,
            backend,
            config,
            events: Mutex::new(events),
        })
    }

    /// Runs passes until nothing is ready; returns the number of passes.
    pub async fn settle(&self) -> usize {
        self.installer.run_until_idle(SETTLE_MAX_PASSES).await.len()
    }

    /// Drains the events published since the last call.
    pub fn drain_events(&self) -> EventLog {
        let mut rx = self.events.lock();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        EventLog::new(events)
    }

    /// Returns a verifier over the installer's tracking store.
    pub fn store(&self) -> StoreVerifier<'_> {
        StoreVerifier::new(self.installer.store())
    }
}

impl std::fmt::Debug for InstallerHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallerHarness")
            .field("installer", &self.installer)
            .field("backend", &self.backend)
            .finish()
    }
}
