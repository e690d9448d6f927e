// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for lifecycle transitions and input handling
//!
//! These tests use proptest to generate random inputs and verify that:
//! 1. The state machine never panics and only reaches states in its table
//! 2. Deployment states follow the replica counts
//! 3. Name validation accepts exactly the DNS-safe names
//! 4. Update merging and environment building preserve their invariants

use proptest::prelude::*;

use fleet_operator::controller::env::efs_mount_targets;
use fleet_operator::controller::state_machine::{
    LifecycleEvent, LifecycleStateMachine, TransitionResult, deployment_state,
};
use fleet_operator::controller::upgrade::update_image_tag;
use fleet_operator::controller::validation::{
    MAX_NAME_LEN, is_valid_name, merge_workspace_update, validate_name,
};
use fleet_operator::crd::{DeploymentState, FleetWorkspaceSpec, LifecycleState};

// =============================================================================
// Strategy generators
// =============================================================================

fn lifecycle_state() -> impl Strategy<Value = LifecycleState> {
    prop_oneof![
        Just(LifecycleState::Unknown),
        Just(LifecycleState::Creating),
        Just(LifecycleState::Ready),
        Just(LifecycleState::Updating),
        Just(LifecycleState::Deleting),
        Just(LifecycleState::Failed),
    ]
}

fn lifecycle_event() -> impl Strategy<Value = LifecycleEvent> {
    prop_oneof![
        Just(LifecycleEvent::CreateRequested),
        Just(LifecycleEvent::UpdateRequested),
        Just(LifecycleEvent::DeleteRequested),
        Just(LifecycleEvent::JobSucceeded),
        Just(LifecycleEvent::JobFailed),
    ]
}

fn deployment_state_strategy() -> impl Strategy<Value = DeploymentState> {
    prop_oneof![
        Just(DeploymentState::Unknown),
        Just(DeploymentState::Starting),
        Just(DeploymentState::Running),
        Just(DeploymentState::NotReady),
        Just(DeploymentState::Updating),
    ]
}

/// Names that should pass validation
fn valid_name() -> impl Strategy<Value = String> {
    "[a-z]([a-z0-9-]{0,30}[a-z0-9])?"
}

fn workspace_spec() -> impl Strategy<Value = FleetWorkspaceSpec> {
    (
        "[a-z][a-z0-9]{0,8}",
        "(|v[0-9]\\.[0-9])",
        "[a-z0-9]{0,12}",
        any::<bool>(),
        "(|small|large)",
        "(|main|v[0-9])",
    )
        .prop_map(
            |(cluster_name, image_tag, api_token, enable_web, quota_group, git_ref)| {
                FleetWorkspaceSpec {
                    cluster_name,
                    git_ref,
                    image_tag,
                    api_token,
                    enable_web,
                    quota_group,
                }
            },
        )
}

fn image_reference() -> impl Strategy<Value = String> {
    "([a-z0-9.]{1,12}(:[0-9]{2,5})?/)?[a-z][a-z0-9-]{0,10}(:[a-z0-9.]{1,8})?"
}

// =============================================================================
// Property-based tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: Every state/event pair yields a result that agrees with can_transition
    #[test]
    fn prop_transition_agrees_with_table(state in lifecycle_state(), event in lifecycle_event()) {
        let sm = LifecycleStateMachine::new();
        let result = sm.transition(state, event);

        let allowed = result.is_success();
        prop_assert_eq!(allowed, sm.can_transition(state, event));
        prop_assert_eq!(allowed, sm.valid_events(state).contains(&event));
    }

    /// Property: Removal is only reached by a successful teardown
    #[test]
    fn prop_removal_only_from_deleting(state in lifecycle_state(), event in lifecycle_event()) {
        let sm = LifecycleStateMachine::new();
        if let TransitionResult::Removed { from, event } = sm.transition(state, event) {
            prop_assert_eq!(from, LifecycleState::Deleting);
            prop_assert_eq!(event, LifecycleEvent::JobSucceeded);
        }
    }

    /// Property: A failed job always lands in Failed
    #[test]
    fn prop_failed_job_marks_failed(state in lifecycle_state()) {
        let sm = LifecycleStateMachine::new();
        match sm.transition(state, LifecycleEvent::JobFailed) {
            TransitionResult::Success { to, .. } => prop_assert_eq!(to, LifecycleState::Failed),
            TransitionResult::Removed { .. } => prop_assert!(false, "JobFailed never removes"),
            TransitionResult::InvalidTransition { .. } => {
                prop_assert!(state.is_terminal() || state == LifecycleState::Unknown);
            }
        }
    }

    /// Property: Applying only valid events never gets stuck, and deletion is
    /// always reachable until the resource is removed
    #[test]
    fn prop_random_walk_stays_in_table(events in prop::collection::vec(lifecycle_event(), 0..40)) {
        let sm = LifecycleStateMachine::new();
        let mut state = LifecycleState::Unknown;

        for event in events {
            prop_assert!(sm.can_transition(state, LifecycleEvent::DeleteRequested));
            match sm.transition(state, event) {
                TransitionResult::Success { from, to, .. } => {
                    prop_assert_eq!(from, state);
                    state = to;
                }
                TransitionResult::Removed { .. } => break,
                TransitionResult::InvalidTransition { current, .. } => {
                    prop_assert_eq!(current, state);
                }
            }
        }
    }

    /// Property: All replicas ready means Running, and the classification
    /// never reports Unknown or Deleting
    #[test]
    fn prop_deployment_state_follows_replicas(
        observed in 0i32..10,
        ready_offset in 0i32..10,
        previous in deployment_state_strategy(),
    ) {
        let ready = observed.saturating_sub(ready_offset).max(0);
        let state = deployment_state(observed, ready, previous);

        if observed > 0 && ready == observed {
            prop_assert_eq!(state, DeploymentState::Running);
        } else {
            prop_assert_ne!(state, DeploymentState::Running);
        }
        prop_assert_ne!(state, DeploymentState::Unknown);
        prop_assert_ne!(state, DeploymentState::Deleting);
    }

    /// Property: Generated DNS-safe names are accepted
    #[test]
    fn prop_valid_names_accepted(name in valid_name()) {
        prop_assert!(is_valid_name(&name));
        prop_assert!(validate_name("workspace", &name).is_ok());
    }

    /// Property: validate_name and is_valid_name always agree
    #[test]
    fn prop_validation_consistent(name in "\\PC{0,40}") {
        prop_assert_eq!(is_valid_name(&name), validate_name("cluster", &name).is_ok());
        if name.len() > MAX_NAME_LEN {
            prop_assert!(!is_valid_name(&name));
        }
    }

    /// Property: Any upper case letter makes a name invalid
    #[test]
    fn prop_upper_case_rejected(prefix in valid_name(), upper in "[A-Z]") {
        let name = format!("{prefix}{upper}");
        prop_assert!(!is_valid_name(&name));
    }

    /// Property: Merging never changes the quota group and never leaves the
    /// image tag or cluster empty
    #[test]
    fn prop_merge_preserves_fixed_fields(current in workspace_spec(), requested in workspace_spec()) {
        let current = current.with_defaults();
        let merged = merge_workspace_update(&current, &requested);

        prop_assert_eq!(&merged.quota_group, &current.quota_group);
        prop_assert!(!merged.image_tag.is_empty());
        prop_assert!(!merged.cluster_name.is_empty());
        prop_assert_eq!(merged.enable_web, requested.enable_web);
        prop_assert_eq!(&merged.git_ref, &requested.git_ref);
    }

    /// Property: Every subnet gets exactly one mount target
    #[test]
    fn prop_mount_targets_cover_subnets(subnets in prop::collection::vec("subnet-[a-f0-9]{4}", 0..6)) {
        let targets = efs_mount_targets(&subnets);
        let braced = targets.starts_with('{') && targets.ends_with('}');
        prop_assert!(braced, "mount targets are not an HCL map: {}", targets);
        prop_assert_eq!(targets.matches("subnet_id").count(), subnets.len());
        for (i, subnet) in subnets.iter().enumerate() {
            let expected = format!("\"az-{}\"={{\"subnet_id\"=\"{}\"}}", i, subnet);
            prop_assert!(targets.contains(&expected));
        }
    }

    /// Property: Re-tagging keeps the repository and is idempotent
    #[test]
    fn prop_image_tag_replaced(image in image_reference(), tag in "v[0-9]{1,2}\\.[0-9]{1,2}") {
        let updated = update_image_tag(&image, &tag);
        let suffix = format!(":{tag}");
        prop_assert!(updated.ends_with(&suffix));
        prop_assert_eq!(update_image_tag(&updated, &tag), updated.clone());

        let repository = updated.trim_end_matches(&suffix);
        prop_assert!(image.starts_with(repository));
    }
}

// =============================================================================
// Edge cases
// =============================================================================

mod edge_case_tests {
    use super::*;

    #[test]
    fn test_empty_name_rejected() {
        assert!(!is_valid_name(""));
        assert!(validate_name("workspace", "").is_err());
    }

    #[test]
    fn test_trailing_hyphen_rejected() {
        assert!(!is_valid_name("ws-"));
        assert!(!is_valid_name("-ws"));
        assert!(is_valid_name("w-s"));
    }

    #[test]
    fn test_deployment_with_no_replicas_is_not_running() {
        assert_eq!(
            deployment_state(0, 0, DeploymentState::Running),
            DeploymentState::NotReady
        );
        assert_eq!(
            deployment_state(0, 0, DeploymentState::Unknown),
            DeploymentState::Starting
        );
    }
}
