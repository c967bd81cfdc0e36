//! Filesystem-backed processors.
//!
//! The runtime is a directory tree: modules become files under
//! `<root>/modules/`, configurations JSON documents under `<root>/config/`.
//! Entity ids are used as file names after replacing path separators.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reconciler_core::{
    ExecResult, ExecutionError, ProcessorState, RegisteredResource, ResourceKind,
    ResourceProcessor,
};
use serde_json::json;
use tempfile::NamedTempFile;
use tracing::debug;

fn file_name(entity_id: &str) -> ExecResult<String> {
    match entity_id {
        "" | "." | ".." => Err(ExecutionError::permanent(format!(
            "entity id '{}' cannot name a runtime file",
            entity_id
        ))),
        _ => Ok(entity_id.replace(['/', '\\'], "_")),
    }
}

fn io_failure(path: &Path, e: io::Error) -> ExecutionError {
    ExecutionError::transient(format!("{}: {}", path.display(), e))
}

/// Writes through a uniquely named temporary file in the same directory, so
/// a crash never leaves a torn file and no other entity's file is touched.
fn write_atomically(path: &Path, content: &[u8]) -> ExecResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_failure(parent, e))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| io_failure(parent, e))?;
    tmp.write_all(content)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| io_failure(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| io_failure(path, e.error))?;
    Ok(())
}

fn remove_if_present(path: &Path) -> ExecResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_failure(path, e)),
    }
}

fn state_for(path: &Path, resource: &RegisteredResource, size: usize) -> ProcessorState {
    let mut state = ProcessorState::new();
    state.insert("path".to_string(), json!(path.display().to_string()));
    state.insert("source".to_string(), json!(resource.url));
    state.insert("size".to_string(), json!(size));
    state
}

/// Installs module payload bytes as `<root>/modules/<entity>`.
#[derive(Debug, Clone)]
pub struct ModuleFileProcessor {
    dir: PathBuf,
}

impl ModuleFileProcessor {
    /// Creates a processor rooted at `runtime_dir`.
    pub fn new(runtime_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: runtime_dir.as_ref().join("modules"),
        }
    }

    /// Returns the file an entity is installed to.
    pub fn path_for(&self, entity_id: &str) -> ExecResult<PathBuf> {
        Ok(self.dir.join(file_name(entity_id)?))
    }
}

#[async_trait]
impl ResourceProcessor for ModuleFileProcessor {
    fn name(&self) -> &str {
        "module-files"
    }

    fn kinds(&self) -> Vec<ResourceKind> {
        vec![ResourceKind::Module]
    }

    async fn install_or_update(
        &self,
        resource: &RegisteredResource,
        _prior: Option<&ProcessorState>,
    ) -> ExecResult<ProcessorState> {
        let bytes = resource.payload.as_bytes().ok_or_else(|| {
            ExecutionError::permanent(format!("{} has no byte payload", resource.url))
        })?;

        let path = self.path_for(&resource.entity_id)?;
        write_atomically(&path, bytes)?;
        debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(state_for(&path, resource, bytes.len()))
    }

    async fn uninstall(&self, entity_id: &str, _prior: &ProcessorState) -> ExecResult<()> {
        remove_if_present(&self.path_for(entity_id)?)
    }
}

/// Installs configuration properties as `<root>/config/<entity>.json`.
#[derive(Debug, Clone)]
pub struct ConfigFileProcessor {
    dir: PathBuf,
}

impl ConfigFileProcessor {
    /// Creates a processor rooted at `runtime_dir`.
    pub fn new(runtime_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: runtime_dir.as_ref().join("config"),
        }
    }

    /// Returns the file an entity is installed to.
    pub fn path_for(&self, entity_id: &str) -> ExecResult<PathBuf> {
        Ok(self.dir.join(format!("{}.json", file_name(entity_id)?)))
    }
}

#[async_trait]
impl ResourceProcessor for ConfigFileProcessor {
    fn name(&self) -> &str {
        "config-files"
    }

    fn kinds(&self) -> Vec<ResourceKind> {
        vec![ResourceKind::Config]
    }

    async fn install_or_update(
        &self,
        resource: &RegisteredResource,
        _prior: Option<&ProcessorState>,
    ) -> ExecResult<ProcessorState> {
        let properties = resource.payload.as_properties().ok_or_else(|| {
            ExecutionError::permanent(format!("{} has no structured payload", resource.url))
        })?;
        let encoded = serde_json::to_vec_pretty(properties)
            .map_err(|e| ExecutionError::permanent(e.to_string()))?;

        let path = self.path_for(&resource.entity_id)?;
        write_atomically(&path, &encoded)?;
        debug!("Wrote {} properties to {}", properties.len(), path.display());
        Ok(state_for(&path, resource, properties.len()))
    }

    async fn uninstall(&self, entity_id: &str, _prior: &ProcessorState) -> ExecResult<()> {
        remove_if_present(&self.path_for(entity_id)?)
    }
}
