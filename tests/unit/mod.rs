// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the fleet operator
//!
//! This module contains unit tests for:
//! - The versioned store and its backups
//! - The per-key job worker
//! - Lifecycle state machine transitions
//! - Workspace and cluster orchestration against a fake provisioner
//! - Crash recovery
//! - Deployment reconciliation
//! - Drain and self-upgrade

#[path = "../common/mod.rs"]
mod common;

mod backup;
mod recovery;
mod state_machine;
mod upgrade;
mod worker;
