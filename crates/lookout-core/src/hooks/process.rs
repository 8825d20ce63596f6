//! Real process launcher backed by `tokio::process`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::{EvalError, Result, TargetDescriptor};

use super::{LaunchContext, TargetLauncher, TargetProcess};

/// How long `terminate` waits for the child to exit after the kill signal.
const TERMINATE_WAIT: Duration = Duration::from_secs(5);

/// Launches target applications as child processes, exporting the channel
/// address and session id so the embedded shim can connect back.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TargetLauncher for ProcessLauncher {
    async fn launch(
        &self,
        target: &TargetDescriptor,
        context: &LaunchContext,
    ) -> Result<TargetProcess> {
        let Some(executable) = &target.executable else {
            // Already-running target: only the channel handshake attaches.
            debug!(target = %target.name, "no executable configured, expecting external process");
            return Ok(TargetProcess::external());
        };

        if !executable.exists() {
            return Err(EvalError::Attach(format!(
                "executable not found: {}",
                executable.display()
            )));
        }

        let mut command = Command::new(executable);
        command
            .args(&target.args)
            .envs(&target.env)
            .env(super::ENV_CHANNEL_ADDR, context.channel_addr.to_string())
            .env(super::ENV_SESSION_ID, context.session_id.to_string())
            .kill_on_drop(true);
        if let Some(cwd) = &target.cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| EvalError::Attach(format!("failed to launch {}: {e}", target.name)))?;
        let pid = child.id();
        info!(target = %target.name, pid, "target process started");

        Ok(TargetProcess::spawned(child))
    }

    async fn terminate(&self, process: &mut TargetProcess) {
        let Some(child) = process.child.as_mut() else {
            return;
        };
        if let Err(error) = child.start_kill() {
            // Already exited is the common case here.
            debug!(%error, "kill signal not delivered");
        }
        match tokio::time::timeout(TERMINATE_WAIT, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "target process exited"),
            Ok(Err(error)) => warn!(%error, "failed waiting for target process"),
            Err(_) => warn!("target process did not exit within {TERMINATE_WAIT:?}"),
        }
        process.child = None;
    }
}
