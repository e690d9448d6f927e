//! Startup recovery of interrupted workspace and cluster jobs

use fleet_operator::controller::{RecoveryAction, recover, workspace};
use fleet_operator::crd::{FleetCluster, LifecycleState};

use crate::common::*;

fn sorted<T: Ord>(mut items: Vec<T>) -> Vec<T> {
    items.sort();
    items
}

#[tokio::test]
async fn test_dispatches_by_recorded_state() {
    let mut stale = ready_cluster("c1");
    stale.status.as_mut().unwrap().workspaces = vec!["ws-old".to_string()];

    let h = Harness::new(
        vec![
            workspace_in("ws-a", "c1", LifecycleState::Creating),
            workspace_in("ws-b", "c1", LifecycleState::Updating),
            workspace_in("ws-c", "c1", LifecycleState::Deleting),
            workspace_in("ws-d", "c1", LifecycleState::Ready),
            workspace_in("ws-e", "c1", LifecycleState::Failed),
        ],
        vec![stale],
    )
    .await;
    // Keep the teardown of ws-c from unregistering it before the lists are rebuilt
    h.provisioner.hold();

    let report = recover(&h.ctx).await;
    assert_eq!(report.failures, 0);
    assert!(report.clusters.is_empty());
    assert_eq!(
        sorted(report.workspaces),
        vec![
            ("ws-a".to_string(), RecoveryAction::Create),
            ("ws-b".to_string(), RecoveryAction::Update),
            ("ws-c".to_string(), RecoveryAction::Delete),
        ]
    );
    assert_eq!(
        h.cluster_workspaces("c1").await,
        vec!["ws-a", "ws-b", "ws-c", "ws-d", "ws-e"]
    );

    h.provisioner.release();
    h.settle().await;

    assert_eq!(h.workspace_state("ws-a").await, Some(LifecycleState::Ready));
    assert_eq!(h.workspace_state("ws-b").await, Some(LifecycleState::Ready));
    assert_eq!(h.workspace_state("ws-c").await, None);
    assert_eq!(h.workspace_state("ws-d").await, Some(LifecycleState::Ready));
    assert_eq!(h.workspace_state("ws-e").await, Some(LifecycleState::Failed));
    assert_eq!(
        h.cluster_workspaces("c1").await,
        vec!["ws-a", "ws-b", "ws-d", "ws-e"]
    );
}

#[tokio::test]
async fn test_unprovisioned_cluster_is_created() {
    // Recorded but never given a state
    let fresh = FleetCluster::new("c2", cluster_spec());
    let h = Harness::new(vec![], vec![fresh, cluster_in("c3", LifecycleState::Deleting)]).await;

    let report = recover(&h.ctx).await;
    assert_eq!(
        sorted(report.clusters),
        vec![
            ("c2".to_string(), RecoveryAction::Create),
            ("c3".to_string(), RecoveryAction::Delete),
        ]
    );

    h.settle().await;
    assert_eq!(h.cluster_state("c2").await, Some(LifecycleState::Ready));
    assert_eq!(h.cluster_state("c3").await, None);
    assert!(h.provisioner.has_state_workspace("cl-c2"));
}

#[tokio::test]
async fn test_running_job_counts_as_failure() {
    let h = Harness::new(vec![], vec![ready_cluster("c1")]).await;
    h.provisioner.hold();
    workspace::create(&h.ctx, "ws1", workspace_spec("c1")).await.unwrap();

    let report = recover(&h.ctx).await;
    assert_eq!(report.failures, 1);
    assert!(report.workspaces.is_empty());

    h.provisioner.release();
    h.settle().await;
    assert_eq!(h.workspace_state("ws1").await, Some(LifecycleState::Ready));
    assert_eq!(h.provisioner.applies().len(), 1);
}

#[tokio::test]
async fn test_orphaned_workspace_does_not_stop_recovery() {
    let h = Harness::new(
        vec![
            workspace_in("ws1", "gone", LifecycleState::Ready),
            workspace_in("ws2", "c1", LifecycleState::Ready),
        ],
        vec![ready_cluster("c1")],
    )
    .await;

    let report = recover(&h.ctx).await;
    assert_eq!(report, Default::default());
    assert_eq!(h.cluster_workspaces("c1").await, vec!["ws2"]);
}
