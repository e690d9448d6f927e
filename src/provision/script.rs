//! Provisioner driven by template scripts and the terraform CLI
//!
//! A prepared working directory contains `install.sh` and `uninstall.sh`. They
//! run with the request's environment plus `TF_WORKSPACE` naming the state
//! workspace. State workspaces are managed by
//! `workspace.sh <create|delete|unlock> <name>` in the state directory. Every
//! child process is killed when its job is aborted.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    ERROR_TAIL_LINES, ProvisionError, ProvisionOutput, ProvisionRequest, Provisioner,
    classify_failure,
};
use crate::worker::LogSink;

pub const INSTALL_SCRIPT: &str = "install.sh";
pub const UNINSTALL_SCRIPT: &str = "uninstall.sh";
pub const STATE_SCRIPT: &str = "workspace.sh";

pub struct ScriptProvisioner {
    state_dir: PathBuf,
    terraform: String,
    token: Option<String>,
}

impl ScriptProvisioner {
    pub fn new(state_dir: impl Into<PathBuf>, token: Option<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            terraform: "terraform".to_string(),
            token,
        }
    }

    /// Use a different terraform binary
    pub fn with_terraform(mut self, terraform: impl Into<String>) -> Self {
        self.terraform = terraform.into();
        self
    }

    fn command(&self, program: &str, dir: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.current_dir(dir).kill_on_drop(true);
        if let Some(token) = &self.token {
            cmd.env("TF_API_TOKEN", token);
        }
        cmd
    }

    fn state_command(&self, action: &str, workspace: &str) -> Command {
        let mut cmd = self.command("sh", &self.state_dir);
        cmd.arg(STATE_SCRIPT).arg(action).arg(workspace);
        cmd
    }

    fn script_command(&self, script: &str, request: &ProvisionRequest) -> Command {
        let mut cmd = self.command("sh", &request.dir);
        cmd.arg(script)
            .envs(&request.env)
            .env("TF_WORKSPACE", &request.workspace);
        cmd
    }

    async fn read_outputs(&self, request: &ProvisionRequest) -> ProvisionOutput {
        let dir = &request.dir;
        let mut cmd = self.command(&self.terraform, dir);
        cmd.arg("output")
            .arg("-json")
            .env("TF_WORKSPACE", &request.workspace);

        let text = match run_captured(cmd, "terraform output").await {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, dir = %dir.display(), "Could not read provisioning outputs");
                return ProvisionOutput::default();
            }
        };

        match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&text) {
            Ok(raw) => ProvisionOutput {
                // terraform wraps each output as {"value": ..., "type": ...}
                values: raw
                    .into_iter()
                    .map(|(k, v)| match v.get("value") {
                        Some(value) => (k, value.clone()),
                        None => (k, v),
                    })
                    .collect(),
            },
            Err(error) => {
                warn!(%error, "Provisioning outputs are not valid JSON");
                ProvisionOutput::default()
            }
        }
    }
}

/// Run to completion and return combined output, classifying failures
async fn run_captured(mut cmd: Command, subject: &str) -> Result<String, ProvisionError> {
    let output = cmd.output().await?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(text)
    } else {
        Err(classify_failure(subject, output.status.code(), &text))
    }
}

/// Run to completion, streaming every output line into `log`
async fn run_streaming(
    mut cmd: Command,
    subject: &str,
    log: &LogSink,
) -> Result<(), ProvisionError> {
    let mut child = cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;
    debug!(subject, pid = ?child.id(), "Started provisioning command");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (out_tail, err_tail) = tokio::join!(pump(stdout, log), pump(stderr, log));
    let status = child.wait().await?;

    if status.success() {
        return Ok(());
    }

    let mut tail: Vec<String> = out_tail?.into_iter().collect();
    tail.extend(err_tail?);
    Err(classify_failure(subject, status.code(), &tail.join("\n")))
}

async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    log: &LogSink,
) -> std::io::Result<VecDeque<String>> {
    let mut tail = VecDeque::with_capacity(ERROR_TAIL_LINES);
    let Some(reader) = reader else {
        return Ok(tail);
    };

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if tail.len() == ERROR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.clone());
        log.line(line);
    }
    Ok(tail)
}

#[async_trait]
impl Provisioner for ScriptProvisioner {
    async fn create_workspace(&self, workspace: &str) -> Result<(), ProvisionError> {
        run_captured(self.state_command("create", workspace), workspace).await?;
        Ok(())
    }

    async fn delete_workspace(&self, workspace: &str) -> Result<(), ProvisionError> {
        run_captured(self.state_command("delete", workspace), workspace).await?;
        Ok(())
    }

    async fn force_unlock(&self, workspace: &str) -> Result<(), ProvisionError> {
        run_captured(self.state_command("unlock", workspace), workspace).await?;
        Ok(())
    }

    async fn apply(
        &self,
        request: &ProvisionRequest,
        log: &LogSink,
    ) -> Result<ProvisionOutput, ProvisionError> {
        run_streaming(self.script_command(INSTALL_SCRIPT, request), INSTALL_SCRIPT, log).await?;
        Ok(self.read_outputs(request).await)
    }

    async fn destroy(&self, request: &ProvisionRequest, log: &LogSink) -> Result<(), ProvisionError> {
        run_streaming(self.script_command(UNINSTALL_SCRIPT, request), UNINSTALL_SCRIPT, log).await
    }
}
