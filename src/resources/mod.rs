pub mod common;
pub mod ingress;
pub mod service;
pub mod volume;
pub mod workload;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, standard_labels};
pub use ingress::IngressSettings;
