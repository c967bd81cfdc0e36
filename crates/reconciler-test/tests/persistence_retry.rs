//! Tracking store failures after a successful processor call
//!
//! When the runtime change landed but the record could not be written, only
//! the write is retried; the processor is not called again.

use pretty_assertions::assert_eq;
use reconciler_core::TaskOutcome;
use reconciler_test::{module_fixtures::module, InstallerHarness};

/// A failed write after install is retried on its own.
///
/// 1. Make the next write fail and register one module.
/// 2. Settle: one processor call, PersistRetry then Installed.
#[tokio::test]
async fn test_failed_write_retries_write_only() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    env.backend.fail_writes(1);

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.settle().await;

    assert_eq!(env.modules.call_count(), 1);
    assert_eq!(env.backend.write_count(), 1);
    env.store().assert_installed("org.a", "d1")?;

    let outcomes = env.drain_events().outcomes_for("org.a");
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes[0], TaskOutcome::PersistRetry { .. }));
    assert_eq!(outcomes[1], TaskOutcome::Installed);
    Ok(())
}

/// A failed delete after uninstall is retried on its own.
#[tokio::test]
async fn test_failed_delete_retries_delete_only() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.settle().await;
    env.drain_events();

    env.backend.fail_deletes(2);
    env.installer.register_resources("fs", vec![])?;
    env.settle().await;

    env.store().assert_absent("org.a")?;
    assert_eq!(env.backend.records().len(), 0);
    assert_eq!(env.modules.calls_for("org.a").len(), 2);

    let events = env.drain_events();
    events.assert_count("org.a", "persist retry", 2, |o| {
        matches!(o, TaskOutcome::PersistRetry { .. })
    })?;
    assert_eq!(
        events.outcomes_for("org.a").last(),
        Some(&TaskOutcome::Uninstalled)
    );
    Ok(())
}

/// Work queued behind an outstanding write waits for it.
///
/// 1. Install d1 with the write failing.
/// 2. Register d2 before the next pass.
/// 3. Settle: the d1 record lands first, then d2 is applied as an update.
#[tokio::test]
async fn test_newer_work_waits_for_outstanding_write() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    env.backend.fail_writes(1);

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.installer.run_pass().await;
    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d2", 5)])?;
    assert_eq!(env.installer.dump_pending_tasks().len(), 2);

    env.settle().await;
    env.store().assert_installed("org.a", "d2")?;

    let outcomes = env.drain_events().outcomes_for("org.a");
    assert_eq!(
        &outcomes[1..],
        &[TaskOutcome::Installed, TaskOutcome::Updated]
    );
    assert_eq!(env.modules.calls_for("org.a").len(), 2);
    Ok(())
}

/// Store write failures are not counted against the attempt cap.
#[tokio::test]
async fn test_persist_retries_outlast_attempt_cap() -> anyhow::Result<()> {
    let env = InstallerHarness::start()?;
    env.backend.fail_writes(5);

    env.installer
        .register_resources("fs", vec![module("a.jar", "org.a", "d1", 5)])?;
    env.settle().await;

    env.store().assert_installed("org.a", "d1")?;
    env.drain_events()
        .assert_count("org.a", "failed", 0, TaskOutcome::is_failure)?;
    Ok(())
}
