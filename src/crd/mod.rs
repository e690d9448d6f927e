mod cluster;
mod deployment;
mod state;
mod workspace;

pub use cluster::*;
pub use deployment::*;
pub use state::*;
pub use workspace::*;
