pub mod cluster;
pub mod context;
pub mod env;
pub mod error;
pub mod reconciler;
pub mod recovery;
pub mod state_machine;
pub mod status;
pub mod sync_loop;
pub mod upgrade;
pub mod validation;
pub mod workspace;

pub use context::{Context, DeploymentContext, OrchestrationSettings};
pub use error::{Error, ErrorContext, Result};
pub use reconciler::{FINALIZER, RETRY_INTERVAL, reconcile_deployment};
pub use recovery::{RecoveryAction, RecoveryReport, recover};
pub use state_machine::{LifecycleEvent, LifecycleStateMachine, TransitionResult};
pub use status::{HasLifecycle, StatusManager};
pub use sync_loop::ReconcileLoop;
pub use upgrade::{
    DRAIN_POLL_INTERVAL, ImageUpdater, KubeImageUpdater, run_self_upgrade, upgrade_when_idle,
    wait_for_idle,
};
pub use validation::{is_valid_name, validate_name};
