pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod provision;
pub mod resources;
pub mod store;
pub mod worker;

pub use config::{OperatorConfig, StoreBackend};
pub use controller::{Context, DeploymentContext, Error, ReconcileLoop, Result, recover};
pub use crd::{FleetCluster, FleetDeployment, FleetWorkspace, LifecycleState};
pub use health::{HealthState, Metrics};
pub use store::{MemoryBackend, VersionedStore};
pub use worker::Worker;
