//! End-to-end properties of the installer
//!
//! Each test drives the installer through register/update calls and
//! reconciliation passes, then checks the runtime (processor calls), the
//! tracking store and the published outcomes.

use pretty_assertions::assert_eq;
use reconciler_core::{ExecutionError, OverrideRule, TaskOperation, TaskOutcome};
use reconciler_test::{module_fixtures::module, InstallerHarness, ProcessorCall};

/// Registering the same set twice changes nothing the second time.
///
/// 1. Register one module and settle: one install.
/// 2. Register the identical set again: no task, no call, no event.
#[tokio::test]
async fn test_registration_is_idempotent() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;

    let ack = env
        .installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    assert_eq!(ack.tasks_created, 1);
    env.settle().await;
    env.store().assert_installed("org.a", "d1")?;
    assert_eq!(env.modules.call_count(), 1);
    env.drain_events();

    let ack = env
        .installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    assert_eq!(ack.tasks_created, 0);
    assert_eq!(ack.unchanged, 1);
    assert_eq!(env.settle().await, 0);

    assert_eq!(env.modules.call_count(), 1);
    assert!(env.drain_events().is_empty());
    Ok(())
}

/// The active resource of an entity is always the highest-priority
/// candidate, with scheme order breaking ties.
#[tokio::test]
async fn test_override_selects_winner() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;

    env.installer
        .register_resources("b-scheme", vec![module("x.jar", "org.x", "db", 5)])?;
    env.installer
        .register_resources("a-scheme", vec![module("x.jar", "org.x", "da", 5)])?;
    env.installer
        .register_resources("low", vec![module("x.jar", "org.x", "dl", 1)])?;
    env.settle().await;

    env.store().assert_active("org.x", "a-scheme:x.jar")?;
    env.store().assert_installed("org.x", "da")?;

    let state = env.installer.installation_state();
    let candidates = &state["org.x"].candidates;
    assert_eq!(
        candidates.iter().map(|c| c.url.as_str()).collect::<Vec<_>>(),
        vec!["a-scheme:x.jar", "b-scheme:x.jar", "low:x.jar"]
    );
    assert!(candidates[0].active);
    Ok(())
}

/// A higher-priority scheme takes an entity over with an update, and the
/// entity falls back to the original resource when it goes away. The
/// entity is never uninstalled along the way.
///
/// 1. P registers R1 (priority 5) for E1: installed.
/// 2. Q registers R2 (priority 10) for E1: updated to R2.
/// 3. Q withdraws R2: updated back to R1.
#[tokio::test]
async fn test_priority_takeover_and_fallback() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;

    env.installer
        .register_resources("p", vec![module("r1", "e1", "d1", 5)])?;
    env.settle().await;
    env.store().assert_active("e1", "p:r1")?;

    env.installer
        .register_resources("q", vec![module("r2", "e1", "d2", 10)])?;
    env.settle().await;
    env.store().assert_active("e1", "q:r2")?;

    env.installer.register_resources("q", vec![])?;
    env.settle().await;
    env.store().assert_active("e1", "p:r1")?;
    env.store().assert_installed("e1", "d1")?;

    let events = env.drain_events();
    assert_eq!(
        events.outcomes_for("e1"),
        vec![
            TaskOutcome::Installed,
            TaskOutcome::Updated,
            TaskOutcome::Updated
        ]
    );
    assert_eq!(events.uninstall_count("e1"), 0);
    assert!(env
        .modules
        .calls_for("e1")
        .iter()
        .all(|c| matches!(c, ProcessorCall::InstallOrUpdate { .. })));
    Ok(())
}

/// Install, uninstall and reinstall of the same digest each reach the
/// runtime exactly once.
#[tokio::test]
async fn test_install_uninstall_reinstall_round_trip() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.settle().await;
    env.installer.register_resources("fs", vec![])?;
    env.settle().await;
    env.store().assert_absent("org.a")?;

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.settle().await;
    env.store().assert_installed("org.a", "d1")?;

    let calls = env.modules.calls_for("org.a");
    assert_eq!(calls.len(), 3);
    assert!(matches!(calls[1], ProcessorCall::Uninstall { .. }));
    assert!(matches!(
        calls[2],
        ProcessorCall::InstallOrUpdate { update: false, .. }
    ));
    assert_eq!(
        env.drain_events().outcomes_for("org.a"),
        vec![
            TaskOutcome::Installed,
            TaskOutcome::Uninstalled,
            TaskOutcome::Installed
        ]
    );
    Ok(())
}

/// A resource registered and withdrawn before any pass never reaches the
/// runtime; the cancelled install is reported as superseded.
#[tokio::test]
async fn test_install_then_withdraw_collapses() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.installer.register_resources("fs", vec![])?;
    env.settle().await;

    assert_eq!(env.modules.call_count(), 0);
    env.store().assert_absent("org.a")?;

    let events = env.drain_events();
    assert_eq!(
        events.outcomes_for("org.a"),
        vec![TaskOutcome::Superseded, TaskOutcome::Skipped]
    );
    Ok(())
}

/// Two digest changes before a pass merge into one update of the latest.
#[tokio::test]
async fn test_back_to_back_updates_merge() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d2", 5)])?;
    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d3", 5)])?;
    assert_eq!(env.installer.dump_pending_tasks().len(), 1);

    env.settle().await;
    assert_eq!(env.modules.call_count(), 1);
    env.store().assert_installed("org.a", "d3")?;
    Ok(())
}

/// Transient failures are retried until the attempt cap, then reported
/// exactly once as a permanent failure.
///
/// 1. Script three transient failures (max attempts 3).
/// 2. Settle: three processor calls, three retries, one failure.
#[tokio::test]
async fn test_transient_failures_exhaust_attempts() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    env.modules.fail_transiently("org.a", 3);

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.settle().await;

    assert_eq!(env.modules.call_count(), 3);
    env.store().assert_absent("org.a")?;

    let events = env.drain_events();
    events.assert_count("org.a", "retrying", 3, |o| {
        matches!(o, TaskOutcome::Retrying { .. })
    })?;
    events.assert_failed_once("org.a")?;

    let last = events.for_entity("org.a").last().cloned();
    match last.map(|e| e.outcome) {
        Some(TaskOutcome::FailedPermanent { reason }) => {
            assert!(reason.starts_with("gave up after 3 attempts"));
        }
        other => panic!("expected a permanent failure, got {:?}", other),
    }
    assert!(!env.installer.has_pending_tasks());
    Ok(())
}

/// Fewer transient failures than the cap end in success.
#[tokio::test]
async fn test_transient_failure_then_success() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    env.modules.fail_transiently("org.a", 2);

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.settle().await;

    env.store().assert_installed("org.a", "d1")?;
    let events = env.drain_events();
    assert_eq!(events.count("org.a", TaskOutcome::is_success), 1);
    assert_eq!(events.count("org.a", TaskOutcome::is_failure), 0);
    Ok(())
}

/// A permanent error is not retried.
#[tokio::test]
async fn test_permanent_failure_not_retried() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    env.modules
        .fail_next("org.a", ExecutionError::permanent("invalid manifest"));

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.settle().await;

    assert_eq!(env.modules.call_count(), 1);
    env.drain_events().assert_failed_once("org.a")?;
    Ok(())
}

/// A retry in flight is superseded by newer work for its entity.
#[tokio::test]
async fn test_newer_registration_supersedes_retry() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    env.modules.fail_transiently("org.a", 1);

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.installer.run_pass().await;
    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d2", 5)])?;
    env.settle().await;

    env.store().assert_installed("org.a", "d2")?;
    let events = env.drain_events();
    assert_eq!(events.count("org.a", TaskOutcome::is_failure), 0);
    Ok(())
}

/// Replacing the override rules re-selects winners and applies them.
#[tokio::test]
async fn test_override_rules_replacement() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    env.installer.register_resources(
        "base",
        vec![module("core.jar", "org.core", "base", 10)],
    )?;
    env.installer.register_resources(
        "patch",
        vec![module("core.jar", "org.core", "patch", 1)],
    )?;
    env.settle().await;
    env.store().assert_active("org.core", "base:core.jar")?;

    let created = env
        .installer
        .replace_override_rules(vec![OverrideRule::new("patch", 100)]);
    assert_eq!(created, 1);
    env.settle().await;
    env.store().assert_active("org.core", "patch:core.jar")?;

    env.installer.replace_override_rules(vec![]);
    env.settle().await;
    env.store().assert_active("org.core", "base:core.jar")?;
    Ok(())
}

/// A delta update removes and adds resources without re-sending the set.
#[tokio::test]
async fn test_update_resources_delta() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    assert!(env
        .installer
        .update_resources("fs", vec![module("a.jar", "org.a", "d1", 5)], &[])
        .is_err());

    env.installer.register_resources(
        "fs",
        vec![
            module("a.jar", "org.a", "d1", 5),
            module("b.jar", "org.b", "d1", 5),
        ],
    )?;
    env.settle().await;

    let ack = env.installer.update_resources(
        "fs",
        vec![module("c.jar", "org.c", "d1", 5)],
        &["fs:a.jar".to_string()],
    )?;
    assert_eq!(ack.removed, 1);
    env.settle().await;

    env.store().assert_absent("org.a")?;
    env.store().assert_installed("org.b", "d1")?;
    env.store().assert_installed("org.c", "d1")?;

    let events = env.drain_events();
    let uninstall = events
        .for_entity("org.a")
        .find(|e| e.operation == TaskOperation::Uninstall)
        .cloned();
    assert_eq!(
        uninstall.map(|e| e.outcome),
        Some(TaskOutcome::Uninstalled)
    );
    Ok(())
}

/// Configuration and module resources dispatch to their own processors.
#[tokio::test]
async fn test_kinds_dispatch_to_their_processor() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    env.installer.register_resources(
        "fs",
        vec![
            module("a.jar", "org.a", "d1", 5),
            reconciler_test::config_fixtures::logging("info"),
        ],
    )?;
    env.settle().await;

    assert_eq!(env.modules.call_count(), 1);
    assert_eq!(env.configs.call_count(), 1);
    assert_eq!(
        env.configs.calls()[0].entity_id(),
        "org.example.logging"
    );
    Ok(())
}
