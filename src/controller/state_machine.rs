//! Lifecycle state machines
//!
//! Workspaces and clusters move through [`LifecycleState`] via an explicit
//! transition table driven by [`LifecycleEvent`]s. Only transitions listed in
//! the table are allowed; everything else is reported as invalid so callers can
//! refuse the request instead of silently overwriting state.
//!
//! Deployments have no table. Their state is recomputed on every reconcile from
//! the workload's replica counts, see [`deployment_state`].

use std::fmt;

use crate::crd::{DeploymentState, LifecycleState};

/// Events that move a workspace or cluster through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// A create (or a replay of one after restart) was accepted
    CreateRequested,
    /// A spec update was accepted
    UpdateRequested,
    /// Teardown was requested
    DeleteRequested,
    /// The provisioning job for the current operation succeeded
    JobSucceeded,
    /// The provisioning job failed, panicked or timed out
    JobFailed,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::CreateRequested => write!(f, "CreateRequested"),
            LifecycleEvent::UpdateRequested => write!(f, "UpdateRequested"),
            LifecycleEvent::DeleteRequested => write!(f, "DeleteRequested"),
            LifecycleEvent::JobSucceeded => write!(f, "JobSucceeded"),
            LifecycleEvent::JobFailed => write!(f, "JobFailed"),
        }
    }
}

/// Where a transition leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    State(LifecycleState),
    /// The resource is removed from the store
    Removed,
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: Target,
    pub event: LifecycleEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: LifecycleState,
        to: LifecycleState,
        event: LifecycleEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to: Target::State(to),
            event,
            description,
        }
    }

    const fn removal(from: LifecycleState, event: LifecycleEvent, description: &'static str) -> Self {
        Self {
            from,
            to: Target::Removed,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq)]
pub enum TransitionResult {
    Success {
        from: LifecycleState,
        to: LifecycleState,
        event: LifecycleEvent,
        description: &'static str,
    },
    /// The resource should be removed
    Removed {
        from: LifecycleState,
        event: LifecycleEvent,
    },
    InvalidTransition {
        current: LifecycleState,
        event: LifecycleEvent,
    },
}

impl TransitionResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, TransitionResult::InvalidTransition { .. })
    }
}

/// Transition table for workspaces and clusters
pub struct LifecycleStateMachine {
    transitions: Vec<Transition>,
}

impl Default for LifecycleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleStateMachine {
    pub fn new() -> Self {
        use LifecycleEvent as E;
        use LifecycleState as S;

        Self {
            transitions: vec![
                // === Creation ===
                Transition::new(S::Unknown, S::Creating, E::CreateRequested, "Creation accepted"),
                Transition::new(
                    S::Creating,
                    S::Creating,
                    E::CreateRequested,
                    "Creation dispatched again after restart",
                ),
                Transition::new(S::Creating, S::Ready, E::JobSucceeded, "Creation completed"),
                Transition::new(S::Creating, S::Failed, E::JobFailed, "Creation failed"),
                // === Update ===
                Transition::new(S::Ready, S::Updating, E::UpdateRequested, "Update accepted"),
                Transition::new(S::Failed, S::Updating, E::UpdateRequested, "Update of a failed resource"),
                Transition::new(
                    S::Updating,
                    S::Updating,
                    E::UpdateRequested,
                    "Update accepted while another was pending",
                ),
                Transition::new(
                    S::Creating,
                    S::Updating,
                    E::UpdateRequested,
                    "Update accepted before creation finished",
                ),
                Transition::new(S::Updating, S::Ready, E::JobSucceeded, "Update completed"),
                Transition::new(S::Updating, S::Failed, E::JobFailed, "Update failed"),
                // === Deletion, allowed from every state ===
                Transition::new(S::Unknown, S::Deleting, E::DeleteRequested, "Deletion requested"),
                Transition::new(
                    S::Creating,
                    S::Deleting,
                    E::DeleteRequested,
                    "Deletion requested during creation",
                ),
                Transition::new(S::Ready, S::Deleting, E::DeleteRequested, "Deletion requested"),
                Transition::new(
                    S::Updating,
                    S::Deleting,
                    E::DeleteRequested,
                    "Deletion requested during update",
                ),
                Transition::new(
                    S::Failed,
                    S::Deleting,
                    E::DeleteRequested,
                    "Deletion of a failed resource",
                ),
                Transition::new(
                    S::Deleting,
                    S::Deleting,
                    E::DeleteRequested,
                    "Deletion dispatched again after restart",
                ),
                Transition::removal(S::Deleting, E::JobSucceeded, "Teardown completed"),
                Transition::new(S::Deleting, S::Failed, E::JobFailed, "Teardown failed"),
            ],
        }
    }

    /// Attempt to transition from `current` on `event`
    pub fn transition(&self, current: LifecycleState, event: LifecycleEvent) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(Transition {
                to: Target::State(to),
                description,
                ..
            }) => TransitionResult::Success {
                from: current,
                to: *to,
                event,
                description: *description,
            },
            Some(Transition {
                to: Target::Removed, ..
            }) => TransitionResult::Removed {
                from: current,
                event,
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    pub fn can_transition(&self, from: LifecycleState, event: LifecycleEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    /// All events accepted in `state`
    pub fn valid_events(&self, state: LifecycleState) -> Vec<LifecycleEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }
}

/// Classify a deployment from its workload's replica counts.
///
/// `previous` is the state recorded by the last reconcile. A deployment that
/// has never run stays `Starting` until every observed replica is ready.
pub fn deployment_state(observed: i32, ready: i32, previous: DeploymentState) -> DeploymentState {
    if observed > 0 && observed == ready {
        DeploymentState::Running
    } else if previous == DeploymentState::Unknown || previous == DeploymentState::Starting {
        DeploymentState::Starting
    } else if ready == 0 {
        DeploymentState::NotReady
    } else {
        DeploymentState::Updating
    }
}

/// Replica counts reported by a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub observed: i32,
    pub ready: i32,
}

/// State of a deployment given what is known about it
///
/// Terminating always wins; a missing workload means it is still being created.
pub fn observe_deployment(
    terminating: bool,
    workload: Option<ReplicaCounts>,
    previous: DeploymentState,
) -> DeploymentState {
    if terminating {
        return DeploymentState::Deleting;
    }
    match workload {
        Some(counts) => deployment_state(counts.observed, counts.ready, previous),
        None => DeploymentState::Starting,
    }
}
