//! Integration tests for live migration.

mod harness;

use std::time::Duration;

use harness::TestCluster;
use vmctl_controller::runtime::MigrationBehavior;
use vmctl_model::{
    AbortStatus, ConditionType, Disk, ErrorKind, InstanceTemplate, MigrationConfig,
    MigrationPhase, PrintableStatus, Resource, RunMode,
};

#[tokio::test]
async fn test_migration_moves_instance() {
    let tc = TestCluster::spawn();
    let key = tc.create_policy("vm1", RunMode::Always).await;
    let before = tc.wait_running(&key).await;
    let source = before.status.node_name.clone().unwrap();

    let request = tc.actions.migrate(&key, None).await.unwrap();
    assert_eq!(request.spec.instance_name, "vm1");
    let request = tc
        .actions
        .wait_for_migration_terminal(&request.key(), &harness::settle_within())
        .await
        .unwrap();
    assert_eq!(request.phase(), MigrationPhase::Succeeded);

    let after = tc.actions.get_instance(&key).await.unwrap();
    assert_eq!(after.meta.uid, before.meta.uid);
    assert!(after.is_running());

    let state = after.status.migration_state.clone().unwrap();
    assert_eq!(state.migration_uid, request.meta.uid);
    assert_eq!(state.source_node, source);
    assert_ne!(state.target_node, source);
    assert!(state.completed);
    assert!(!state.failed);
    assert!(state.end_timestamp.unwrap() > state.start_timestamp.unwrap());
    assert_eq!(state.progress.data_remaining_bytes, 0);

    assert_eq!(after.status.node_name.as_deref(), Some(state.target_node.as_str()));
    assert_eq!(
        tc.runtime.node_of(after.meta.uid).await.as_deref(),
        Some(state.target_node.as_str())
    );
    assert_eq!(request.status.target_node.as_deref(), Some(state.target_node.as_str()));
    assert_eq!(request.status.migration_state.as_ref(), Some(&state));

    // A finished attempt does not block the next one.
    let back = tc.actions.migrate(&key, None).await.unwrap();
    let back = tc
        .actions
        .wait_for_migration_terminal(&back.key(), &harness::settle_within())
        .await
        .unwrap();
    assert_eq!(back.phase(), MigrationPhase::Succeeded);
    assert_eq!(
        tc.runtime.node_of(after.meta.uid).await.as_deref(),
        Some(source.as_str())
    );

    tc.shutdown().await;
}

#[tokio::test]
async fn test_stalled_migration_is_aborted() {
    let tc = TestCluster::spawn();
    tc.runtime.set_migration_behavior(MigrationBehavior::Stall).await;
    let key = tc.create_policy("vm1", RunMode::Always).await;
    let before = tc.wait_running(&key).await;

    let config = MigrationConfig {
        progress_timeout_secs: Some(1),
        completion_timeout_per_gib_secs: None,
    };
    let request = tc.actions.migrate(&key, Some(config)).await.unwrap();
    let request = tc
        .actions
        .wait_for_migration_terminal(&request.key(), &harness::settle_within())
        .await
        .unwrap();
    assert_eq!(request.phase(), MigrationPhase::Failed);
    assert!(request
        .status
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("no transfer progress")));

    let after = tc.actions.get_instance(&key).await.unwrap();
    let state = after.status.migration_state.clone().unwrap();
    assert!(state.completed);
    assert!(state.failed);
    assert_eq!(after.meta.uid, before.meta.uid);
    assert!(after.is_running());
    assert_eq!(after.status.node_name, before.status.node_name);
    assert!(!tc.runtime.has_transfer(after.meta.uid).await);

    tc.shutdown().await;
}

#[tokio::test]
async fn test_running_transfer_is_polled_once_per_interval() {
    let tc = TestCluster::spawn_with(harness::loops_every(Duration::from_millis(200)));
    tc.runtime.set_migration_behavior(MigrationBehavior::Hold).await;
    let key = tc.create_policy("vm1", RunMode::Always).await;
    tc.wait_running(&key).await;

    let request = tc.actions.migrate(&key, None).await.unwrap();
    let request_key = request.key();
    tc.wait_until("transfer to start", || async {
        tc.cluster
            .migrations
            .find(&request_key)
            .await
            .filter(|m| m.phase() == MigrationPhase::Running)
    })
    .await;

    let before = tc.cluster.revision();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let writes = tc.cluster.revision() - before;
    assert!(writes <= 15, "{writes} writes in 1s while a transfer ran");

    let instance = tc.actions.get_instance(&key).await.unwrap();
    let state = instance.status.migration_state.unwrap();
    assert!(!state.completed);
    assert!(state.progress.data_processed_bytes > 0);

    tc.shutdown().await;
}

#[tokio::test]
async fn test_deleting_request_cancels_transfer() {
    let tc = TestCluster::spawn();
    tc.runtime.set_migration_behavior(MigrationBehavior::Hold).await;
    let key = tc.create_policy("vm1", RunMode::Always).await;
    let before = tc.wait_running(&key).await;

    let request = tc.actions.migrate(&key, None).await.unwrap();
    let request_key = request.key();
    tc.wait_until("transfer to start", || async {
        tc.cluster
            .migrations
            .find(&request_key)
            .await
            .filter(|m| m.phase() == MigrationPhase::Running)
    })
    .await;
    tc.wait_until("policy to report Migrating", || async {
        let policy = tc.actions.get_policy(&key).await.ok()?;
        (policy.status.printable_status == PrintableStatus::Migrating).then_some(())
    })
    .await;

    let err = tc.actions.migrate(&key, None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);

    tc.actions.delete_migration(&request_key).await.unwrap();
    let after = tc
        .wait_until("abort to finish", || async {
            tc.cluster.instances.find(&key).await.filter(|i| {
                i.status
                    .migration_state
                    .as_ref()
                    .is_some_and(|m| m.abort_status == AbortStatus::AbortSucceeded)
            })
        })
        .await;

    let state = after.status.migration_state.clone().unwrap();
    assert!(state.abort_requested);
    assert!(state.completed);
    assert!(state.failed);
    assert_eq!(after.meta.uid, before.meta.uid);
    assert!(after.is_running());
    assert_eq!(after.status.node_name, before.status.node_name);
    assert!(!tc.runtime.has_transfer(after.meta.uid).await);

    tc.shutdown().await;
}

#[tokio::test]
async fn test_stopping_instance_fails_migration() {
    let tc = TestCluster::spawn();
    tc.runtime.set_migration_behavior(MigrationBehavior::Hold).await;
    let key = tc.create_policy("vm1", RunMode::Always).await;
    tc.wait_running(&key).await;

    let request = tc.actions.migrate(&key, None).await.unwrap();
    let request_key = request.key();
    tc.wait_until("transfer to start", || async {
        tc.cluster
            .migrations
            .find(&request_key)
            .await
            .filter(|m| m.phase() == MigrationPhase::Running)
    })
    .await;

    tc.actions.stop(&key, Some(0)).await.unwrap();
    let request = tc
        .actions
        .wait_for_migration_terminal(&request_key, &harness::settle_within())
        .await
        .unwrap();
    assert_eq!(request.phase(), MigrationPhase::Failed);

    tc.actions
        .wait_for_deletion(&key, &harness::settle_within())
        .await
        .unwrap();

    tc.shutdown().await;
}

#[tokio::test]
async fn test_migration_waits_for_restored_host() {
    let tc = TestCluster::spawn();
    let key = tc.create_policy("vm1", RunMode::Always).await;
    let first = tc.wait_running(&key).await;
    let lost = first.status.node_name.clone().unwrap();

    tc.runtime.lose_node(&lost).await;
    let second = tc.wait_replaced(&key, &first).await;
    let source = second.status.node_name.clone().unwrap();
    assert_ne!(source, lost);

    let request = tc.actions.migrate(&key, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let pending = tc.cluster.migrations.get(&request.key()).await.unwrap();
    assert_eq!(pending.phase(), MigrationPhase::Pending);

    tc.runtime.restore_node(&lost).await;
    let request = tc
        .actions
        .wait_for_migration_terminal(&request.key(), &harness::settle_within())
        .await
        .unwrap();
    assert_eq!(request.phase(), MigrationPhase::Succeeded);
    assert_eq!(request.status.target_node.as_deref(), Some(lost.as_str()));
    assert_eq!(
        tc.runtime.node_of(second.meta.uid).await.as_deref(),
        Some(lost.as_str())
    );

    tc.shutdown().await;
}

#[tokio::test]
async fn test_local_disk_rejects_migration() {
    let tc = TestCluster::spawn();
    let template = InstanceTemplate {
        disks: vec![Disk::shared("rootdisk"), Disk::local("scratch")],
        ..InstanceTemplate::default()
    };
    let key = tc.create_policy_with("vm1", RunMode::Always, template).await;
    let instance = tc.wait_running(&key).await;
    assert!(!instance.status.is_true(ConditionType::IsMigratable));

    let err = tc.actions.migrate(&key, None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::DisksNotLiveMigratable);
    assert!(tc.actions.list_migrations(harness::NAMESPACE).await.is_empty());
    let after = tc.actions.get_instance(&key).await.unwrap();
    assert!(after.status.migration_state.is_none());

    tc.shutdown().await;
}

#[tokio::test]
async fn test_migration_of_stopped_machine_is_rejected() {
    let tc = TestCluster::spawn();
    let key = tc.create_policy("vm1", RunMode::Halted).await;

    let err = tc.actions.migrate(&key, None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);

    tc.shutdown().await;
}
