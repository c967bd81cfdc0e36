//! Durable tracking of what has been applied to the runtime.
//!
//! The [`TrackingStore`] keeps one [`TrackedEntity`] per entity id. Writes go
//! to the backend first and only then to the in-memory view, under the same
//! lock, so a reported success always means the change is on stable storage
//! and the two views never diverge.
//!
//! Two backends are provided:
//!
//! - [`FileBackend`]: one JSON record per entity, written via temp file,
//!   fsync and rename so a single-key put/remove is atomic
//! - [`MemoryBackend`]: non-durable, for tests and embedding

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{PersistResult, PersistenceError};
use crate::resource::{RegisteredResource, ResourceKind};

/// Current on-disk record format version.
pub const RECORD_VERSION: u32 = 1;

/// Opaque attributes a processor attaches to an installed entity.
pub type ProcessorState = BTreeMap<String, serde_json::Value>;

/// Last operation applied to a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LastOperation {
    /// Entity is present in the runtime
    Installed,
    /// Entity was taken out of the runtime
    Removed,
}

/// Persisted state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    /// Logical target id
    pub entity_id: String,
    /// Kind of the active resource, used to dispatch uninstalls
    pub kind: ResourceKind,
    /// URL of the resource that was applied
    pub active_resource_id: String,
    /// Digest of the resource that was applied
    pub digest: String,
    /// Processor-assigned attributes
    #[serde(default)]
    pub processor_state: ProcessorState,
    /// Last operation applied
    pub last_operation: LastOperation,
    /// When the record was last changed
    pub timestamp: DateTime<Utc>,
}

impl TrackedEntity {
    /// Creates the record for a successfully installed resource.
    pub fn installed(resource: &RegisteredResource, processor_state: ProcessorState) -> Self {
        Self {
            entity_id: resource.entity_id.clone(),
            kind: resource.kind,
            active_resource_id: resource.url.clone(),
            digest: resource.digest.clone(),
            processor_state,
            last_operation: LastOperation::Installed,
            timestamp: Utc::now(),
        }
    }

    /// Returns true if the entity is present in the runtime.
    pub fn is_installed(&self) -> bool {
        self.last_operation == LastOperation::Installed
    }

    /// Returns true if `resource` is exactly what this record says is applied.
    pub fn matches(&self, resource: &RegisteredResource) -> bool {
        self.is_installed()
            && self.digest == resource.digest
            && self.active_resource_id == resource.url
    }
}

/// Storage behind a [`TrackingStore`].
///
/// Implementations must not return `Ok` from `write` or `delete` before the
/// change is durable.
pub trait TrackingBackend: Send + Sync {
    /// Returns a short name for logging.
    fn name(&self) -> &str;

    /// Loads every record.
    fn load_all(&self) -> PersistResult<Vec<TrackedEntity>>;

    /// Durably writes one record, replacing any previous one.
    fn write(&self, entity: &TrackedEntity) -> PersistResult<()>;

    /// Durably deletes one record. Deleting a missing record succeeds.
    fn delete(&self, entity_id: &str) -> PersistResult<()>;
}

/// Versioned envelope written to disk.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    version: u32,
    entity: TrackedEntity,
}

/// File-per-entity backend.
///
/// File names are the hex SHA-256 of the entity id, so ids of any length or
/// content map to a fixed-size name. The id itself lives inside the record.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Opens (and creates if needed) a store directory.
    pub fn open(dir: impl Into<PathBuf>) -> PersistResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| PersistenceError::io(&dir, e))?;
        info!("Tracking store directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Returns the store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, entity_id: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(entity_id.as_bytes()));
        self.dir.join(format!("{}.json", name))
    }

    fn sync_dir(&self) -> PersistResult<()> {
        File::open(&self.dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| PersistenceError::io(&self.dir, e))
    }

    fn read_record(path: &Path) -> PersistResult<TrackedEntity> {
        let raw = fs::read(path).map_err(|e| PersistenceError::io(path, e))?;
        let record: StoredRecord =
            serde_json::from_slice(&raw).map_err(|e| PersistenceError::Decode {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if record.version != RECORD_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: record.version,
            });
        }
        Ok(record.entity)
    }
}

impl TrackingBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    fn load_all(&self) -> PersistResult<Vec<TrackedEntity>> {
        let mut entities = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| PersistenceError::io(&self.dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| PersistenceError::io(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(entity) => entities.push(entity),
                Err(e) => {
                    // A torn or foreign record must not block startup.
                    warn!("Skipping unreadable tracking record: {}", e);
                }
            }
        }

        Ok(entities)
    }

    fn write(&self, entity: &TrackedEntity) -> PersistResult<()> {
        let path = self.record_path(&entity.entity_id);
        let tmp = path.with_extension("json.tmp");

        let record = StoredRecord {
            version: RECORD_VERSION,
            entity: entity.clone(),
        };
        let encoded = serde_json::to_vec_pretty(&record).map_err(|e| PersistenceError::Encode {
            entity_id: entity.entity_id.clone(),
            message: e.to_string(),
        })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| PersistenceError::io(&tmp, e))?;
        file.write_all(&encoded)
            .and_then(|_| file.sync_all())
            .map_err(|e| PersistenceError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| PersistenceError::io(&path, e))?;
        self.sync_dir()
    }

    fn delete(&self, entity_id: &str) -> PersistResult<()> {
        let path = self.record_path(entity_id);
        match fs::remove_file(&path) {
            Ok(()) => self.sync_dir(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(&path, e)),
        }
    }
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<String, TrackedEntity>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-populated with records.
    pub fn with_records(records: impl IntoIterator<Item = TrackedEntity>) -> Self {
        let backend = Self::new();
        {
            let mut map = backend.records.lock();
            for r in records {
                map.insert(r.entity_id.clone(), r);
            }
        }
        backend
    }
}

impl TrackingBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn load_all(&self) -> PersistResult<Vec<TrackedEntity>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn write(&self, entity: &TrackedEntity) -> PersistResult<()> {
        self.records
            .lock()
            .insert(entity.entity_id.clone(), entity.clone());
        Ok(())
    }

    fn delete(&self, entity_id: &str) -> PersistResult<()> {
        self.records.lock().remove(entity_id);
        Ok(())
    }
}

/// Durable entity-id → [`TrackedEntity`] map.
pub struct TrackingStore {
    backend: Box<dyn TrackingBackend>,
    cache: Mutex<HashMap<String, TrackedEntity>>,
}

impl TrackingStore {
    /// Opens a store, loading every record from the backend.
    pub fn open(backend: impl TrackingBackend + 'static) -> PersistResult<Self> {
        Self::open_boxed(Box::new(backend))
    }

    /// Opens a store over an already boxed backend.
    pub fn open_boxed(backend: Box<dyn TrackingBackend>) -> PersistResult<Self> {
        let records = backend.load_all()?;
        info!(
            "Loaded {} tracked entities from {} backend",
            records.len(),
            backend.name()
        );
        let cache = records
            .into_iter()
            .map(|r| (r.entity_id.clone(), r))
            .collect();
        Ok(Self {
            backend,
            cache: Mutex::new(cache),
        })
    }

    /// Opens an empty in-memory store.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryBackend::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the record for an entity.
    pub fn get(&self, entity_id: &str) -> Option<TrackedEntity> {
        self.cache.lock().get(entity_id).cloned()
    }

    /// Durably writes a record.
    ///
    /// On error the in-memory view is left untouched.
    pub fn put(&self, entity: TrackedEntity) -> PersistResult<()> {
        let mut cache = self.cache.lock();
        self.backend.write(&entity)?;
        debug!(
            "Tracked {} -> {} ({})",
            entity.entity_id, entity.active_resource_id, entity.digest
        );
        cache.insert(entity.entity_id.clone(), entity);
        Ok(())
    }

    /// Durably removes a record.
    ///
    /// On error the in-memory view is left untouched.
    pub fn remove(&self, entity_id: &str) -> PersistResult<Option<TrackedEntity>> {
        let mut cache = self.cache.lock();
        self.backend.delete(entity_id)?;
        debug!("Untracked {}", entity_id);
        Ok(cache.remove(entity_id))
    }

    /// Returns every tracked entity id.
    pub fn keys(&self) -> BTreeSet<String> {
        self.cache.lock().keys().cloned().collect()
    }

    /// Returns the number of tracked entities.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

impl std::fmt::Debug for TrackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingStore")
            .field("backend", &self.backend.name())
            .field("entities", &self.len())
            .finish()
    }
}
