//! Hook manager: attaches instrumentation to target processes and owns the
//! channel lifecycle.
//!
//! The manager is the sole mutator of attachment state for a given target.
//! Re-attaching the same session to an already-instrumented target is
//! idempotent (the existing handle is returned); attaching a *different*
//! session to it is rejected, since concurrent evaluation of one target is
//! undefined behavior.

pub mod process;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::channel::{ChannelServer, SessionChannel};
use crate::domain::{ChannelMessage, EvalError, Result, SessionId, TargetDescriptor};

pub use process::ProcessLauncher;

/// Environment variable carrying the channel address to the injected shim.
pub const ENV_CHANNEL_ADDR: &str = "LOOKOUT_CHANNEL_ADDR";
/// Environment variable carrying the session id to the injected shim.
pub const ENV_SESSION_ID: &str = "LOOKOUT_SESSION_ID";

/// Launch-time context handed to the launcher.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub channel_addr: SocketAddr,
    pub session_id: SessionId,
}

/// A located or launched target process.
#[derive(Debug)]
pub struct TargetProcess {
    child: Option<Child>,
}

impl TargetProcess {
    /// A target the launcher did not spawn (already running).
    pub fn external() -> Self {
        Self { child: None }
    }

    /// A freshly spawned child process.
    pub fn spawned(child: Child) -> Self {
        Self { child: Some(child) }
    }

    /// OS pid, when the launcher spawned the process.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

/// Seam between the hook manager and the operating system, so evaluation
/// logic can be exercised without real processes.
#[async_trait]
pub trait TargetLauncher: Send + Sync {
    /// Locate or launch the target process.
    async fn launch(
        &self,
        target: &TargetDescriptor,
        context: &LaunchContext,
    ) -> Result<TargetProcess>;

    /// Stop a launched process. Best-effort; never fails.
    async fn terminate(&self, process: &mut TargetProcess);
}

/// Handle for one attachment to a target process.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentHandle {
    pub attachment_id: uuid::Uuid,
    pub target_name: String,
    pub session_id: SessionId,
    pub pid: Option<u32>,
}

/// Handle for one loaded observation script.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptHandle {
    pub attachment_id: uuid::Uuid,
    pub session_id: SessionId,
}

struct Attachment {
    handle: AttachmentHandle,
    process: Mutex<Option<TargetProcess>>,
}

/// Attaches instrumentation to target processes and owns the channel.
pub struct HookManager {
    channel: Arc<ChannelServer>,
    launcher: Arc<dyn TargetLauncher>,
    attachments: DashMap<String, Arc<Attachment>>,
}

impl HookManager {
    pub fn new(channel: Arc<ChannelServer>, launcher: Arc<dyn TargetLauncher>) -> Self {
        Self {
            channel,
            launcher,
            attachments: DashMap::new(),
        }
    }

    /// Address the injected shim connects back to.
    pub fn channel_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    /// Locate or launch the target and install instrumentation state.
    ///
    /// Idempotent per session: a second attach for the same target and
    /// session returns the existing handle without spawning anything. A
    /// second attach for the same target under a *different* session fails
    /// with [`EvalError::AlreadyInstrumented`].
    pub async fn attach(
        &self,
        session_id: &SessionId,
        target: &TargetDescriptor,
    ) -> Result<AttachmentHandle> {
        if let Some(existing) = self.attachments.get(&target.name) {
            return if existing.handle.session_id == *session_id {
                debug!(target = %target.name, "re-attach is idempotent");
                Ok(existing.handle.clone())
            } else {
                Err(EvalError::AlreadyInstrumented(target.name.clone()))
            };
        }

        let context = LaunchContext {
            channel_addr: self.channel.local_addr(),
            session_id: session_id.clone(),
        };
        let mut process = self.launcher.launch(target, &context).await?;

        let handle = AttachmentHandle {
            attachment_id: uuid::Uuid::new_v4(),
            target_name: target.name.clone(),
            session_id: session_id.clone(),
            pid: process.pid(),
        };

        // Two sessions racing for the same target: first insert wins, the
        // loser tears its process down and reports the conflict.
        match self.attachments.entry(target.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.launcher.terminate(&mut process).await;
                Err(EvalError::AlreadyInstrumented(target.name.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Attachment {
                    handle: handle.clone(),
                    process: Mutex::new(Some(process)),
                }));
                info!(target = %target.name, session_id = %session_id, "attached");
                Ok(handle)
            }
        }
    }

    /// Inject the observation script and establish the logical channel.
    ///
    /// Stages the source for (re)injection on every transport connect, then
    /// waits for the script's `start_success` within `load_timeout`.
    pub async fn load_script(
        &self,
        handle: &AttachmentHandle,
        source: &str,
        load_timeout: Duration,
    ) -> Result<(ScriptHandle, SessionChannel)> {
        let mut endpoint = self.channel.open_session(&handle.session_id);
        self.channel.stage_inject(&handle.session_id, source)?;

        if !endpoint.wait_ready(load_timeout).await {
            self.channel.close_session(&handle.session_id);
            return Err(EvalError::ScriptLoad(format!(
                "no start_success within {load_timeout:?}"
            )));
        }

        debug!(session_id = %handle.session_id, "observation script initialized");
        let script = ScriptHandle {
            attachment_id: handle.attachment_id,
            session_id: handle.session_id.clone(),
        };
        Ok((script, endpoint))
    }

    /// Unload the observation script: best-effort teardown notice to the
    /// script, then close the logical session.
    pub fn unload_script(&self, script: &ScriptHandle, endpoint: &SessionChannel) {
        if let Err(error) = endpoint.send(ChannelMessage::unload()) {
            debug!(session_id = %script.session_id, %error, "unload notice not delivered");
        }
        self.channel.close_session(&script.session_id);
    }

    /// Release the attachment and stop the target process if this manager
    /// launched it. Idempotent; runs on every session exit path.
    pub async fn detach(&self, handle: &AttachmentHandle) {
        let Some((_, attachment)) = self
            .attachments
            .remove_if(&handle.target_name, |_, a| {
                a.handle.attachment_id == handle.attachment_id
            })
        else {
            return;
        };

        let process = match attachment.process.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut process) = process {
            self.launcher.terminate(&mut process).await;
        } else {
            warn!(target = %handle.target_name, "detach found no process handle");
        }
        info!(target = %handle.target_name, session_id = %handle.session_id, "detached");
    }
}
