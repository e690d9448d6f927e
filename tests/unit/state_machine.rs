//! Unit tests for lifecycle transitions and deployment observation

use fleet_operator::controller::state_machine::{
    LifecycleEvent, LifecycleStateMachine, ReplicaCounts, TransitionResult, observe_deployment,
};
use fleet_operator::crd::{DeploymentState, LifecycleState};

use LifecycleEvent as E;
use LifecycleState as S;

fn target(machine: &LifecycleStateMachine, from: S, event: E) -> Option<S> {
    match machine.transition(from, event) {
        TransitionResult::Success { to, .. } => Some(to),
        _ => None,
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_full_create_update_delete_cycle() {
        let machine = LifecycleStateMachine::new();
        let mut state = S::Unknown;
        for (event, expected) in [
            (E::CreateRequested, S::Creating),
            (E::JobSucceeded, S::Ready),
            (E::UpdateRequested, S::Updating),
            (E::JobSucceeded, S::Ready),
            (E::DeleteRequested, S::Deleting),
        ] {
            state = target(&machine, state, event).unwrap();
            assert_eq!(state, expected);
        }
        assert!(matches!(
            machine.transition(state, E::JobSucceeded),
            TransitionResult::Removed { from: S::Deleting, .. }
        ));
    }

    #[test]
    fn test_failed_jobs_land_in_failed() {
        let machine = LifecycleStateMachine::new();
        for from in [S::Creating, S::Updating, S::Deleting] {
            assert_eq!(target(&machine, from, E::JobFailed), Some(S::Failed));
        }
    }

    #[test]
    fn test_failed_resource_can_be_retried() {
        let machine = LifecycleStateMachine::new();
        assert_eq!(target(&machine, S::Failed, E::UpdateRequested), Some(S::Updating));
        assert_eq!(target(&machine, S::Failed, E::DeleteRequested), Some(S::Deleting));
        assert!(!machine.can_transition(S::Failed, E::CreateRequested));
    }

    #[test]
    fn test_replays_after_restart_are_valid() {
        let machine = LifecycleStateMachine::new();
        assert_eq!(target(&machine, S::Creating, E::CreateRequested), Some(S::Creating));
        assert_eq!(target(&machine, S::Updating, E::UpdateRequested), Some(S::Updating));
        assert_eq!(target(&machine, S::Deleting, E::DeleteRequested), Some(S::Deleting));
    }

    #[test]
    fn test_nothing_leaves_deleting_but_teardown_outcomes() {
        let machine = LifecycleStateMachine::new();
        let mut events = machine.valid_events(S::Deleting);
        events.sort_by_key(|e| e.to_string());
        assert_eq!(events, vec![E::DeleteRequested, E::JobFailed, E::JobSucceeded]);
    }

    #[test]
    fn test_job_outcomes_need_a_running_operation() {
        let machine = LifecycleStateMachine::new();
        for from in [S::Unknown, S::Ready, S::Failed] {
            for event in [E::JobSucceeded, E::JobFailed] {
                assert_eq!(
                    machine.transition(from, event),
                    TransitionResult::InvalidTransition { current: from, event }
                );
            }
        }
    }
}

mod deployment_observation_tests {
    use super::*;

    fn counts(observed: i32, ready: i32) -> Option<ReplicaCounts> {
        Some(ReplicaCounts { observed, ready })
    }

    #[test]
    fn test_missing_workload_is_starting() {
        assert_eq!(
            observe_deployment(false, None, DeploymentState::Running),
            DeploymentState::Starting
        );
    }

    #[test]
    fn test_rollout_after_running() {
        assert_eq!(
            observe_deployment(false, counts(3, 1), DeploymentState::Running),
            DeploymentState::Updating
        );
        assert_eq!(
            observe_deployment(false, counts(3, 0), DeploymentState::Running),
            DeploymentState::NotReady
        );
        assert_eq!(
            observe_deployment(false, counts(3, 3), DeploymentState::NotReady),
            DeploymentState::Running
        );
    }

    #[test]
    fn test_zero_replicas_never_running() {
        assert_eq!(
            observe_deployment(false, counts(0, 0), DeploymentState::Unknown),
            DeploymentState::Starting
        );
    }

    #[test]
    fn test_terminating_wins() {
        assert_eq!(
            observe_deployment(true, counts(2, 2), DeploymentState::Running),
            DeploymentState::Deleting
        );
    }
}
