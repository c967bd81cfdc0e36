//! Installable resource model.
//!
//! Producers hand the installer [`InstallableResource`]s: loosely-typed
//! descriptions carrying a type name, an optional digest and a payload.
//! Registration validates each one into a [`RegisteredResource`], which
//! carries the producer scheme, a resolved [`ResourceKind`] and a digest that
//! is always present.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Priority assigned to resources that do not declare one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Kind of artifact a resource describes.
///
/// Each kind is handled by exactly one registered processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Deployable module (bundle, jar, plugin archive)
    Module,
    /// Structured configuration object keyed by pid
    Config,
    /// Anything else a processor has been registered for
    Other,
}

impl ResourceKind {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Module => "module",
            ResourceKind::Config => "config",
            ResourceKind::Other => "other",
        }
    }

    /// Resolves a producer-supplied type name.
    ///
    /// Matching is case-insensitive and accepts the common aliases producers
    /// use (`bundle`, `jar`, `properties`, `file`...). Returns `None` for
    /// names that map to no kind.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "module" | "bundle" | "jar" => Some(ResourceKind::Module),
            "config" | "configuration" | "properties" | "cfg" => Some(ResourceKind::Config),
            "other" | "file" => Some(ResourceKind::Other),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource content: raw bytes for modules, a property map for configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "data", rename_all = "lowercase")]
pub enum Payload {
    /// Opaque artifact bytes
    Bytes(Vec<u8>),
    /// Structured configuration properties
    Structured(BTreeMap<String, serde_json::Value>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Bytes(Vec::new())
    }
}

impl Payload {
    /// Computes a SHA-256 fingerprint of the payload as lowercase hex.
    ///
    /// Structured payloads are hashed entry by entry in key order, each key
    /// and compact JSON value length-prefixed, so the fingerprint does not
    /// depend on insertion order.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            Payload::Bytes(bytes) => {
                hasher.update(b"bytes:");
                hasher.update(bytes);
            }
            Payload::Structured(map) => {
                hasher.update(b"structured:");
                for (key, value) in map {
                    let value = value.to_string();
                    for part in [key.as_bytes(), value.as_bytes()] {
                        hasher.update((part.len() as u64).to_le_bytes());
                        hasher.update(part);
                    }
                }
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Returns the byte content, if this is a byte payload.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::Structured(_) => None,
        }
    }

    /// Returns the property map, if this is a structured payload.
    pub fn as_properties(&self) -> Option<&BTreeMap<String, serde_json::Value>> {
        match self {
            Payload::Structured(map) => Some(map),
            Payload::Bytes(_) => None,
        }
    }
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// A resource as declared by a producer.
///
/// This is the unvalidated input of `register_resources` and
/// `update_resources`. It deserializes directly from manifest files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallableResource {
    /// Producer-scoped identifier (usually a path or URI)
    pub id: String,
    /// Type name, resolved to a [`ResourceKind`] on registration
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical target (module symbolic name, config pid)
    #[serde(default)]
    pub entity_id: String,
    /// Higher values win when several resources target one entity
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Content fingerprint; computed from the payload when absent
    #[serde(default)]
    pub digest: Option<String>,
    /// Artifact content
    #[serde(default)]
    pub payload: Payload,
}

impl InstallableResource {
    /// Creates a resource with the default priority and an empty payload.
    pub fn new(
        id: impl Into<String>,
        resource_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            entity_id: entity_id.into(),
            priority: DEFAULT_PRIORITY,
            digest: None,
            payload: Payload::default(),
        }
    }

    /// Creates a module resource.
    pub fn module(id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(id, ResourceKind::Module.as_str(), entity_id)
    }

    /// Creates a configuration resource.
    pub fn config(id: impl Into<String>, pid: impl Into<String>) -> Self {
        Self::new(id, ResourceKind::Config.as_str(), pid)
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets an explicit digest.
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    /// Sets a byte payload.
    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.payload = Payload::Bytes(bytes.into());
        self
    }

    /// Adds a configuration property, switching to a structured payload.
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        match &mut self.payload {
            Payload::Structured(map) => {
                map.insert(key.into(), value);
            }
            Payload::Bytes(_) => {
                let mut map = BTreeMap::new();
                map.insert(key.into(), value);
                self.payload = Payload::Structured(map);
            }
        }
        self
    }
}

/// Builds the installer-wide address of a resource.
pub fn resource_url(scheme: &str, id: &str) -> String {
    format!("{}:{}", scheme, id)
}

/// A validated resource owned by the installer.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredResource {
    /// `scheme:id`
    pub url: String,
    /// Producer scheme
    pub scheme: String,
    /// Producer-scoped identifier
    pub id: String,
    /// Resolved kind
    pub kind: ResourceKind,
    /// Declared priority
    pub priority: i32,
    /// Content fingerprint
    pub digest: String,
    /// Artifact content
    pub payload: Payload,
    /// Logical target
    pub entity_id: String,
}

impl RegisteredResource {
    /// Validates a producer resource.
    ///
    /// Fails when the id or entity id is blank or the type name resolves to
    /// no kind. A missing or blank digest is filled from the payload.
    pub fn validate(scheme: &str, resource: InstallableResource) -> Result<Self, ValidationError> {
        let id = resource.id.trim();
        if id.is_empty() {
            return Err(ValidationError::MissingId);
        }
        let entity_id = resource.entity_id.trim();
        if entity_id.is_empty() {
            return Err(ValidationError::MissingEntityId { id: id.to_string() });
        }
        let kind = ResourceKind::from_type_name(&resource.resource_type).ok_or_else(|| {
            ValidationError::UnknownKind {
                id: id.to_string(),
                resource_type: resource.resource_type.clone(),
            }
        })?;

        let digest = match resource.digest.as_deref().map(str::trim) {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => resource.payload.digest(),
        };

        Ok(Self {
            url: resource_url(scheme, id),
            scheme: scheme.to_string(),
            id: id.to_string(),
            kind,
            priority: resource.priority,
            digest,
            payload: resource.payload,
            entity_id: entity_id.to_string(),
        })
    }

    /// Returns true if `other` has the same address and content.
    pub fn same_content(&self, other: &RegisteredResource) -> bool {
        self.url == other.url && self.digest == other.digest && self.entity_id == other.entity_id
    }
}

impl fmt::Display for RegisteredResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {}, priority {}, digest {})",
            self.url, self.kind, self.entity_id, self.priority, self.digest
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_aliases() {
        assert_eq!(ResourceKind::from_type_name("bundle"), Some(ResourceKind::Module));
        assert_eq!(ResourceKind::from_type_name("JAR"), Some(ResourceKind::Module));
        assert_eq!(ResourceKind::from_type_name(" properties "), Some(ResourceKind::Config));
        assert_eq!(ResourceKind::from_type_name("file"), Some(ResourceKind::Other));
        assert_eq!(ResourceKind::from_type_name("script"), None);
    }

    #[test]
    fn test_validate_builds_url_and_kind() {
        let r = RegisteredResource::validate(
            "fs",
            InstallableResource::module("/apps/a.jar", "org.example.a").with_digest("d1"),
        )
        .unwrap();

        assert_eq!(r.url, "fs:/apps/a.jar");
        assert_eq!(r.kind, ResourceKind::Module);
        assert_eq!(r.digest, "d1");
        assert_eq!(r.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let err = RegisteredResource::validate("fs", InstallableResource::module("", "e")).unwrap_err();
        assert_eq!(err, ValidationError::MissingId);

        let err = RegisteredResource::validate("fs", InstallableResource::module("r", " ")).unwrap_err();
        assert!(matches!(err, ValidationError::MissingEntityId { .. }));

        let err = RegisteredResource::validate("fs", InstallableResource::new("r", "script", "e"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownKind { .. }));
    }

    #[test]
    fn test_digest_computed_from_payload() {
        let a = RegisteredResource::validate(
            "fs",
            InstallableResource::module("r", "e").with_bytes(b"abc".to_vec()),
        )
        .unwrap();
        let b = RegisteredResource::validate(
            "fs",
            InstallableResource::module("r", "e").with_bytes(b"abd".to_vec()),
        )
        .unwrap();

        assert_eq!(a.digest.len(), 64);
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_structured_digest_ignores_insertion_order() {
        let a = InstallableResource::config("c", "pid")
            .with_property("x", json!(1))
            .with_property("y", json!("two"));
        let b = InstallableResource::config("c", "pid")
            .with_property("y", json!("two"))
            .with_property("x", json!(1));

        assert_eq!(a.payload.digest(), b.payload.digest());
    }

    #[test]
    fn test_structured_digest_separates_keys_and_values() {
        let a = InstallableResource::config("c", "pid").with_property("ab", json!("c"));
        let b = InstallableResource::config("c", "pid").with_property("a", json!("bc"));
        let empty = InstallableResource::config("c", "pid");

        assert_ne!(a.payload.digest(), b.payload.digest());
        assert_ne!(a.payload.digest(), empty.payload.digest());
    }

    #[test]
    fn test_manifest_deserialization_defaults() {
        let r: InstallableResource = serde_json::from_str(
            r#"{"id": "a.cfg", "type": "config", "entity_id": "org.example.pid"}"#,
        )
        .unwrap();

        assert_eq!(r.priority, DEFAULT_PRIORITY);
        assert_eq!(r.digest, None);
        assert_eq!(r.payload, Payload::Bytes(vec![]));
    }
}
