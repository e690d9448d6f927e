//! Working directories cloned from the template repository

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ProvisionError, WorkdirPreparer, classify_failure};

/// Prepares working directories with a shallow `git clone` of the template repo
pub struct GitWorkdir {
    repo: String,
    root: PathBuf,
    token: Option<String>,
}

impl GitWorkdir {
    pub fn new(repo: impl Into<String>, root: impl Into<PathBuf>, token: Option<String>) -> Self {
        Self {
            repo: repo.into(),
            root: root.into(),
            token,
        }
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn clone_command(&self, git_ref: &str, dest: &Path) -> Command {
        let mut cmd = Command::new("git");
        cmd.kill_on_drop(true).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(token) = &self.token {
            cmd.arg("-c")
                .arg(format!("http.extraHeader=Authorization: Bearer {token}"));
        }
        cmd.arg("clone").arg("--depth").arg("1");
        if !git_ref.is_empty() {
            cmd.arg("--branch").arg(git_ref);
        }
        cmd.arg(&self.repo).arg(dest);
        cmd
    }
}

/// A clone of a missing branch or tag reports the ref, anything else is generic
fn classify_clone_failure(git_ref: &str, exit_code: Option<i32>, output: &str) -> ProvisionError {
    let lower = output.to_lowercase();
    let missing_ref = (lower.contains("remote branch") && lower.contains("not found"))
        || lower.contains("could not find remote branch");
    if !git_ref.is_empty() && missing_ref {
        return ProvisionError::ReferenceNotFound(git_ref.to_string());
    }
    match classify_failure("git clone", exit_code, output) {
        // The repository itself is missing; not an idempotency marker
        ProvisionError::NotFound(_) => ProvisionError::Failed {
            subject: "git clone".to_string(),
            exit_code,
            message: output.trim().to_string(),
        },
        other => other,
    }
}

#[async_trait]
impl WorkdirPreparer for GitWorkdir {
    async fn prepare(
        &self,
        name: &str,
        template: &str,
        git_ref: &str,
    ) -> Result<PathBuf, ProvisionError> {
        let dest = self.dir(name);
        if tokio::fs::try_exists(&dest).await? {
            tokio::fs::remove_dir_all(&dest).await?;
        }
        tokio::fs::create_dir_all(&self.root).await?;

        let output = self.clone_command(git_ref, &dest).output().await?;
        if !output.status.success() {
            let text = String::from_utf8_lossy(&output.stderr);
            return Err(classify_clone_failure(git_ref, output.status.code(), &text));
        }

        debug!(name, template, git_ref, dir = %dest.display(), "Prepared working directory");
        Ok(dest.join(template))
    }

    async fn cleanup(&self, name: &str) {
        let dir = self.dir(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(%error, dir = %dir.display(), "Failed to remove working directory"),
        }
    }
}
