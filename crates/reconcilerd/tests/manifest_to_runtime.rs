//! Manifest changes flowing through the installer to the runtime directory.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use reconciler_core::{Installer, InstallerConfig, ProcessorRegistry};
use reconcilerd::{ConfigFileProcessor, ManifestProducer, ModuleFileProcessor};
use serde_json::json;
use tempfile::TempDir;

fn write_manifest(path: &Path, value: serde_json::Value) {
    fs::write(path, serde_json::to_vec_pretty(&value).unwrap()).unwrap();
}

fn open_installer(state: &Path, runtime: &Path) -> Arc<Installer> {
    let config = InstallerConfig {
        retry_backoff_ms: 0,
        max_retry_backoff_ms: 0,
        state_dir: state.to_path_buf(),
        ..Default::default()
    };
    let processors = ProcessorRegistry::new()
        .with(Arc::new(ModuleFileProcessor::new(runtime)))
        .with(Arc::new(ConfigFileProcessor::new(runtime)));
    Arc::new(Installer::open(config, processors).unwrap())
}

#[tokio::test]
async fn test_manifest_drives_runtime_directory() {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("state");
    let runtime = dir.path().join("runtime");
    let manifest = dir.path().join("manifest.json");
    fs::write(dir.path().join("a.jar"), b"module a v1").unwrap();

    write_manifest(
        &manifest,
        json!({"scheme": "manifest", "resources": [
            {"id": "a.jar", "type": "module", "entity_id": "org.a", "file": "a.jar"},
            {"id": "log.cfg", "type": "config", "entity_id": "org.log",
             "payload": {"format": "structured", "data": {"level": "info"}}}
        ]}),
    );

    let installer = open_installer(&state, &runtime);
    let mut producer = ManifestProducer::new(&manifest, Arc::clone(&installer));
    producer.poll().unwrap();
    installer.run_until_idle(16).await;

    let module_path = runtime.join("modules").join("org.a");
    let config_path = runtime.join("config").join("org.log.json");
    assert_eq!(fs::read(&module_path).unwrap(), b"module a v1");
    let config: serde_json::Value =
        serde_json::from_slice(&fs::read(&config_path).unwrap()).unwrap();
    assert_eq!(config, json!({"level": "info"}));

    // New module bytes, configuration withdrawn.
    fs::write(dir.path().join("a.jar"), b"module a v2").unwrap();
    write_manifest(
        &manifest,
        json!({"scheme": "manifest", "resources": [
            {"id": "a.jar", "type": "module", "entity_id": "org.a", "file": "a.jar"}
        ]}),
    );
    producer.poll().unwrap();
    installer.run_until_idle(16).await;

    assert_eq!(fs::read(&module_path).unwrap(), b"module a v2");
    assert!(!config_path.exists());

    let stats = installer.stats();
    assert_eq!(stats.installed, 2);
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.uninstalled, 1);
}

#[tokio::test]
async fn test_restart_with_shrunken_manifest_removes_orphans() {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("state");
    let runtime = dir.path().join("runtime");
    let manifest = dir.path().join("manifest.json");

    write_manifest(
        &manifest,
        json!({"scheme": "manifest", "resources": [
            {"id": "a.jar", "type": "module", "entity_id": "org.a", "digest": "a1"},
            {"id": "b.jar", "type": "module", "entity_id": "org.b", "digest": "b1"}
        ]}),
    );
    {
        let installer = open_installer(&state, &runtime);
        ManifestProducer::new(&manifest, Arc::clone(&installer))
            .poll()
            .unwrap();
        installer.run_until_idle(16).await;
        assert!(runtime.join("modules").join("org.b").exists());
    }

    write_manifest(
        &manifest,
        json!({"scheme": "manifest", "resources": [
            {"id": "a.jar", "type": "module", "entity_id": "org.a", "digest": "a1"}
        ]}),
    );
    let installer = open_installer(&state, &runtime);
    ManifestProducer::new(&manifest, Arc::clone(&installer))
        .poll()
        .unwrap();
    assert_eq!(installer.reconcile_unconfirmed(), 1);
    installer.run_until_idle(16).await;

    assert!(runtime.join("modules").join("org.a").exists());
    assert!(!runtime.join("modules").join("org.b").exists());
    assert!(installer.store().get("org.b").is_none());
    assert_eq!(installer.stats().skipped, 1);
}
