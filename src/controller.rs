//! Instance lifecycle commands issued by the supervisor
//!
//! Stop, configure and start are external tools. [`ShellController`] runs
//! them from the `[commands]` templates; tests substitute their own
//! [`InstanceController`].

use crate::config::CommandConfig;
use crate::error::{Error, Result};
use crate::manifest::DeployTarget;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[async_trait]
pub trait InstanceController: Send + Sync {
    /// Stop any running instance; stopping an absent instance succeeds
    async fn stop(&self, target: &DeployTarget) -> Result<()>;

    /// Regenerate the target's on-disk configuration
    async fn configure(&self, target: &DeployTarget) -> Result<()>;

    /// Launch the instance without waiting for it to become ready
    async fn start(&self, target: &DeployTarget) -> Result<()>;

    /// Command an operator can run to retry a target by hand
    fn retry_command(&self, target: &DeployTarget) -> String;
}

/// A tokenised command template with `{deploy_id}` and `{env}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    words: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let words = shell_words::split(template)
            .map_err(|e| Error::config(format!("invalid command '{}': {}", template, e)))?;
        if words.is_empty() {
            return Err(Error::config("command template is empty"));
        }
        Ok(Self { words })
    }

    /// Substitute placeholders token by token
    pub fn render(&self, deploy_id: &str, env: &str) -> Vec<String> {
        self.words
            .iter()
            .map(|w| w.replace("{deploy_id}", deploy_id).replace("{env}", env))
            .collect()
    }

    /// Rendered command as a single shell-quoted line
    pub fn display(&self, deploy_id: &str, env: &str) -> String {
        shell_words::join(self.render(deploy_id, env))
    }
}

/// Runs lifecycle commands as child processes
#[derive(Debug, Clone)]
pub struct ShellController {
    stop: CommandTemplate,
    configure: CommandTemplate,
    start: CommandTemplate,
    env: String,
    working_dir: Option<PathBuf>,
}

impl ShellController {
    pub fn new(commands: &CommandConfig, env: &str) -> Result<Self> {
        Ok(Self {
            stop: CommandTemplate::parse(&commands.stop)?,
            configure: CommandTemplate::parse(&commands.configure)?,
            start: CommandTemplate::parse(&commands.start)?,
            env: env.to_string(),
            working_dir: None,
        })
    }

    /// Run commands from this directory (builder pattern)
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self, template: &CommandTemplate, target: &DeployTarget) -> Command {
        let words = template.render(&target.deploy_id, &self.env);
        let mut cmd = Command::new(&words[0]);
        cmd.args(&words[1..]);
        cmd.stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(host) = &target.replica_host {
            cmd.env("REPLICA_HOST", host);
        }
        cmd
    }

    fn bring_up(target: &DeployTarget, phase: &'static str, message: String) -> Error {
        Error::BringUp {
            deploy_id: target.deploy_id.clone(),
            phase,
            message,
        }
    }
}

#[async_trait]
impl InstanceController for ShellController {
    async fn stop(&self, target: &DeployTarget) -> Result<()> {
        let output = self
            .command(&self.stop, target)
            .output()
            .await
            .map_err(|e| Self::bring_up(target, "teardown", e.to_string()))?;

        if !output.status.success() {
            // Nothing was running under this id
            debug!(
                deploy_id = %target.deploy_id,
                status = %output.status,
                "Stop command exited non-zero"
            );
        }
        Ok(())
    }

    async fn configure(&self, target: &DeployTarget) -> Result<()> {
        let output = self
            .command(&self.configure, target)
            .output()
            .await
            .map_err(|e| Self::bring_up(target, "configure", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::bring_up(
                target,
                "configure",
                format!("{} ({})", output.status, stderr.trim()),
            ));
        }
        Ok(())
    }

    async fn start(&self, target: &DeployTarget) -> Result<()> {
        let mut cmd = self.command(&self.start, target);
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| Self::bring_up(target, "start", e.to_string()))?;
        let pid = child.id().unwrap_or(0);
        info!(deploy_id = %target.deploy_id, pid, "Instance started");

        // Reap the child so it does not linger as a zombie
        let deploy_id = target.deploy_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(deploy_id = %deploy_id, "Start command exited")
                }
                Ok(status) => warn!(deploy_id = %deploy_id, %status, "Start command failed"),
                Err(e) => warn!(deploy_id = %deploy_id, error = %e, "Failed to wait on start command"),
            }
        });
        Ok(())
    }

    fn retry_command(&self, target: &DeployTarget) -> String {
        self.start.display(&target.deploy_id, &self.env)
    }
}
