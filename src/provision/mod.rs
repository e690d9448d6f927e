//! Provisioning backend abstraction
//!
//! Orchestration drives infrastructure through two collaborators:
//!
//! - [`WorkdirPreparer`] materializes a version-controlled template at a git ref
//! - [`Provisioner`] manages provisioning-state workspaces and applies or destroys
//!   a prepared working directory
//!
//! Errors are classified so callers can treat repeated actions as success
//! ("already exists", "already unlocked") when replaying work after a restart.

mod script;
mod workdir;

pub use script::ScriptProvisioner;
pub use workdir::GitWorkdir;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::worker::LogSink;

/// Lines of command output kept for error messages
const ERROR_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} is already unlocked")]
    AlreadyUnlocked(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("git reference {0} not found")]
    ReferenceNotFound(String),

    #[error("{subject} failed with exit code {exit_code:?}: {message}")]
    Failed {
        subject: String,
        exit_code: Option<i32>,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ProvisionError::AlreadyExists(_))
    }

    pub fn is_already_unlocked(&self) -> bool {
        matches!(self, ProvisionError::AlreadyUnlocked(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisionError::NotFound(_))
    }
}

/// Classify the output of a failed command
pub fn classify_failure(subject: &str, exit_code: Option<i32>, output: &str) -> ProvisionError {
    let lower = output.to_lowercase();
    if lower.contains("already exists") || lower.contains("already been taken") {
        ProvisionError::AlreadyExists(subject.to_string())
    } else if lower.contains("already unlocked") {
        ProvisionError::AlreadyUnlocked(subject.to_string())
    } else if lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("doesn't exist")
    {
        ProvisionError::NotFound(subject.to_string())
    } else {
        let lines: Vec<&str> = output.lines().collect();
        let tail = lines[lines.len().saturating_sub(ERROR_TAIL_LINES)..].join("\n");
        ProvisionError::Failed {
            subject: subject.to_string(),
            exit_code,
            message: tail,
        }
    }
}

/// Treat "already exists" as success
pub fn ignore_already_exists(result: Result<(), ProvisionError>) -> Result<(), ProvisionError> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

/// Treat "already unlocked" as success
pub fn ignore_already_unlocked(result: Result<(), ProvisionError>) -> Result<(), ProvisionError> {
    match result {
        Err(e) if e.is_already_unlocked() => Ok(()),
        other => other,
    }
}

/// One apply or destroy run
#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    /// Provisioning-state workspace holding the run's state
    pub workspace: String,
    /// Prepared working directory
    pub dir: PathBuf,
    /// Environment passed to the template scripts
    pub env: BTreeMap<String, String>,
}

/// Values reported by a successful apply
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisionOutput {
    pub values: BTreeMap<String, serde_json::Value>,
}

impl ProvisionOutput {
    pub fn string(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn strings(&self, key: &str) -> Vec<String> {
        self.values
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// External provisioning backend
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the provisioning-state workspace for a resource
    async fn create_workspace(&self, workspace: &str) -> Result<(), ProvisionError>;

    async fn delete_workspace(&self, workspace: &str) -> Result<(), ProvisionError>;

    /// Release a state lock left behind by an interrupted run
    async fn force_unlock(&self, workspace: &str) -> Result<(), ProvisionError>;

    /// Create or update infrastructure
    async fn apply(
        &self,
        request: &ProvisionRequest,
        log: &LogSink,
    ) -> Result<ProvisionOutput, ProvisionError>;

    /// Tear infrastructure down
    async fn destroy(&self, request: &ProvisionRequest, log: &LogSink) -> Result<(), ProvisionError>;
}

/// Materializes provisioning templates
#[async_trait]
pub trait WorkdirPreparer: Send + Sync {
    /// Prepare a fresh working directory for `name` from `template` at
    /// `git_ref` (empty for the default branch)
    async fn prepare(&self, name: &str, template: &str, git_ref: &str)
    -> Result<PathBuf, ProvisionError>;

    /// Remove the working directory of `name`
    async fn cleanup(&self, name: &str);
}
