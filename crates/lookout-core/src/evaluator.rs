//! The evaluation state machine.
//!
//! One [`SessionEvaluator::run`] call owns one session end to end:
//!
//! ```text
//! Created -> Armed -> Monitoring -> EvaluationRequested -> Completed
//!                  \__________________________________/-> Failed | TimedOut
//! ```
//!
//! `Failed` and `TimedOut` are reachable from any non-terminal state. Exactly
//! one [`Report`] is produced per run, and target teardown happens exactly
//! once on every path, including failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};

use crate::channel::SessionChannel;
use crate::collector::ResultCollector;
use crate::domain::{
    reserved, ChannelMessage, ReasonCode, Report, Session, SessionState, TaskSpec, Verdict,
};
use crate::hooks::{AttachmentHandle, HookManager, ScriptHandle};
use crate::metrics::METRICS;
use crate::obs;
use crate::restore;

/// External control signals delivered to a running session.
#[derive(Debug)]
pub enum ControlSignal {
    /// Request final evaluation now, regardless of trigger state.
    EvaluateNow,
    /// Abort the session.
    Cancel { reason: String },
}

/// Caller-side handle for signalling a running session.
#[derive(Clone)]
pub struct EvaluatorHandle {
    control: mpsc::UnboundedSender<ControlSignal>,
}

impl EvaluatorHandle {
    /// Create a handle and the receiver half passed to
    /// [`SessionEvaluator::run`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlSignal>) {
        let (control, rx) = mpsc::unbounded_channel();
        (Self { control }, rx)
    }

    /// Request final evaluation. A no-op once the session is terminal.
    pub fn request_evaluation(&self) {
        let _ = self.control.send(ControlSignal::EvaluateNow);
    }

    /// Abort the session. A no-op once the session is terminal.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.control.send(ControlSignal::Cancel {
            reason: reason.into(),
        });
    }
}

/// What ended the monitoring phase.
enum MonitorExit {
    Trigger,
    EvaluateNow,
    TimedOut,
    ChannelLost,
    Cancelled(String),
}

/// What ended the final-state capture.
enum CaptureExit {
    /// Terminal event received, or the channel dropped (degraded proceed).
    Done { grace_elapsed: bool },
    Cancelled(String),
}

/// Terminal facts of a session, folded into the report.
struct Terminal {
    state: SessionState,
    reason: ReasonCode,
    verdict: Option<Verdict>,
    grace_elapsed: bool,
    error: Option<String>,
}

impl Terminal {
    fn failed(reason: ReasonCode, error: impl Into<String>) -> Self {
        Self {
            state: SessionState::Failed,
            reason,
            verdict: None,
            grace_elapsed: false,
            error: Some(error.into()),
        }
    }

    fn timed_out() -> Self {
        Self {
            state: SessionState::TimedOut,
            reason: ReasonCode::Timeout,
            verdict: None,
            grace_elapsed: false,
            error: None,
        }
    }
}

/// Instrumentation plumbing to tear down after the terminal state is known.
#[derive(Default)]
struct Teardown {
    attachment: Option<AttachmentHandle>,
    script: Option<(ScriptHandle, SessionChannel)>,
}

/// Drives evaluation sessions over a shared hook manager and collector.
pub struct SessionEvaluator {
    hooks: Arc<HookManager>,
    collector: Arc<ResultCollector>,
}

impl SessionEvaluator {
    pub fn new(hooks: Arc<HookManager>, collector: Arc<ResultCollector>) -> Self {
        Self { hooks, collector }
    }

    /// Run one task to completion and produce its report.
    ///
    /// This is the only producer of the session's report; every exit path of
    /// the state machine funnels through the single assembly at the end.
    pub async fn run(
        &self,
        task: &TaskSpec,
        control: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> Report {
        let mut session = Session::new(&task.task_id);
        let span = obs::session_span(session.session_id.as_str());
        self.drive(&mut session, task, control).instrument(span).await
    }

    /// Body of [`run`], instrumented with the session span. Kept separate so
    /// the span follows the future instead of an entered guard being held
    /// across `.await` points, which would make the future `!Send`.
    async fn drive(
        &self,
        session: &mut Session,
        task: &TaskSpec,
        control: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> Report {
        obs::emit_session_started(session.session_id.as_str(), &task.task_id);

        let started_at = Utc::now();
        self.collector.bind_session(&session.session_id);

        let (terminal, teardown) = self.execute(session, task, control).await;

        if let Some((script, endpoint)) = &teardown.script {
            self.hooks.unload_script(script, endpoint);
        }
        if let Some(attachment) = &teardown.attachment {
            self.hooks.detach(attachment).await;
        }

        let events = self.collector.snapshot(&session.session_id);
        self.collector.remove_session(&session.session_id);

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        self.transition(session, terminal.state);
        obs::emit_report_produced(
            session.session_id.as_str(),
            terminal.state,
            terminal.reason,
            duration_ms,
        );
        METRICS.inc_sessions_completed();
        METRICS.flush();

        Report {
            task_id: task.task_id.clone(),
            session_id: session.session_id.clone(),
            state: terminal.state,
            reason: terminal.reason,
            verdict: terminal.verdict,
            grace_elapsed: terminal.grace_elapsed,
            events,
            started_at,
            finished_at,
            duration_ms,
            error: terminal.error,
        }
    }

    /// All non-terminal phases. Returns the terminal facts plus whatever
    /// instrumentation was set up and must be torn down.
    async fn execute(
        &self,
        session: &mut Session,
        task: &TaskSpec,
        mut control: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> (Terminal, Teardown) {
        let mut teardown = Teardown::default();
        // The coarse budget covers the whole session, arming included.
        let deadline = Instant::now() + Duration::from_millis(task.config.timeout_ms);

        // Created -> Armed: restore context data, then attach to the target.
        for entry in &task.config.context_data {
            if let Err(error) = restore::restore_context_data(&entry.from, &entry.to) {
                return (
                    Terminal::failed(ReasonCode::AttachFailed, format!("context restore: {error}")),
                    teardown,
                );
            }
            if task.config.clear_storage_on_restore {
                restore::clear_user_storage(&entry.to, false);
            }
        }
        let attach = self.hooks.attach(&session.session_id, &task.target);
        let attachment = match tokio::time::timeout_at(deadline, attach).await {
            Ok(Ok(attachment)) => attachment,
            Ok(Err(error)) => {
                return (
                    Terminal::failed(ReasonCode::AttachFailed, error.to_string()),
                    teardown,
                );
            }
            Err(_) => return (Terminal::timed_out(), teardown),
        };
        teardown.attachment = Some(attachment.clone());
        self.transition(session, SessionState::Armed);

        // Armed -> Monitoring: inject the script and wait for start_success.
        // The load timeout is capped by what remains of the coarse budget, so
        // a slow load cannot hold the session past its deadline.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return (Terminal::timed_out(), teardown);
        }
        let load_timeout = Duration::from_millis(task.config.load_timeout_ms).min(remaining);
        let (script, mut endpoint) = match self
            .hooks
            .load_script(&attachment, &task.script_source, load_timeout)
            .await
        {
            Ok(loaded) => loaded,
            Err(_) if Instant::now() >= deadline => {
                return (Terminal::timed_out(), teardown);
            }
            Err(error) => {
                return (
                    Terminal::failed(ReasonCode::ScriptLoadFailed, error.to_string()),
                    teardown,
                );
            }
        };
        self.transition(session, SessionState::Monitoring);

        let exit = self.monitor(session, task, &mut endpoint, &mut control, deadline).await;
        let reason = match exit {
            MonitorExit::Trigger => ReasonCode::TriggerMatched,
            MonitorExit::EvaluateNow => ReasonCode::EvaluateNow,
            MonitorExit::TimedOut => {
                teardown.script = Some((script, endpoint));
                return (Terminal::timed_out(), teardown);
            }
            MonitorExit::ChannelLost => {
                teardown.script = Some((script, endpoint));
                return (
                    Terminal::failed(ReasonCode::ChannelLost, "channel closed while monitoring"),
                    teardown,
                );
            }
            MonitorExit::Cancelled(cause) => {
                teardown.script = Some((script, endpoint));
                return (Terminal::failed(ReasonCode::Cancelled, cause), teardown);
            }
        };

        // Monitoring -> EvaluationRequested: ask the script for final state
        // and wait out the grace window. The coarse budget no longer applies.
        self.transition(session, SessionState::EvaluationRequested);
        let capture = self
            .capture_final_state(session, task, &mut endpoint, &mut control)
            .await;
        teardown.script = Some((script, endpoint));
        let grace_elapsed = match capture {
            CaptureExit::Done { grace_elapsed } => grace_elapsed,
            CaptureExit::Cancelled(cause) => {
                return (Terminal::failed(ReasonCode::Cancelled, cause), teardown);
            }
        };

        // Verdict over a consistent snapshot of everything recorded.
        let events = self.collector.snapshot(&session.session_id);
        let terminal = match (task.verdict)(&events) {
            Ok(verdict) => Terminal {
                state: SessionState::Completed,
                reason,
                verdict: Some(verdict),
                grace_elapsed,
                error: None,
            },
            Err(error) => Terminal {
                grace_elapsed,
                ..Terminal::failed(ReasonCode::VerdictFailed, error)
            },
        };
        (terminal, teardown)
    }

    /// Monitoring phase: record events until a trigger match, an external
    /// signal, channel loss, or the coarse deadline.
    ///
    /// The select is biased so that when a trigger-matching event and an
    /// evaluate-now signal are both pending, the trigger wins and the report
    /// says so.
    async fn monitor(
        &self,
        session: &Session,
        task: &TaskSpec,
        endpoint: &mut SessionChannel,
        control: &mut mpsc::UnboundedReceiver<ControlSignal>,
        deadline: Instant,
    ) -> MonitorExit {
        let mut control_open = true;
        loop {
            tokio::select! {
                biased;

                inbound = endpoint.recv() => {
                    let Some(inbound) = inbound else {
                        return MonitorExit::ChannelLost;
                    };
                    let event = self.collector.record(
                        &session.session_id,
                        inbound.message,
                        inbound.received_at,
                    );
                    if let Some(trigger) = &task.config.trigger {
                        if trigger.matches(&event) {
                            debug!(seq = event.seq, event_type = %event.event_type, "trigger matched");
                            return MonitorExit::Trigger;
                        }
                    }
                }

                signal = control.recv(), if control_open => {
                    match signal {
                        Some(ControlSignal::EvaluateNow) => return MonitorExit::EvaluateNow,
                        Some(ControlSignal::Cancel { reason }) => {
                            return MonitorExit::Cancelled(reason);
                        }
                        // All handles dropped; keep monitoring on the
                        // remaining conditions.
                        None => control_open = false,
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    return MonitorExit::TimedOut;
                }
            }
        }
    }

    /// EvaluationRequested phase: send `evaluate` and record events until the
    /// script's `evaluate_on_completion`, bounded by the grace window.
    /// Cancellation stays observable here, same as while monitoring.
    async fn capture_final_state(
        &self,
        session: &Session,
        task: &TaskSpec,
        endpoint: &mut SessionChannel,
        control: &mut mpsc::UnboundedReceiver<ControlSignal>,
    ) -> CaptureExit {
        if let Err(error) = endpoint.send(ChannelMessage::evaluate()) {
            // No transport to ask; judge whatever was already recorded.
            warn!(%error, "final-state request not delivered");
            return CaptureExit::Done {
                grace_elapsed: false,
            };
        }

        let grace_deadline =
            Instant::now() + Duration::from_millis(task.config.grace_timeout_ms);
        let mut control_open = true;
        loop {
            tokio::select! {
                biased;

                inbound = endpoint.recv() => {
                    let Some(inbound) = inbound else {
                        // Channel lost after the request: degraded proceed.
                        return CaptureExit::Done { grace_elapsed: false };
                    };
                    let event = self.collector.record(
                        &session.session_id,
                        inbound.message,
                        inbound.received_at,
                    );
                    if event.event_type == reserved::EVALUATE_ON_COMPLETION {
                        return CaptureExit::Done { grace_elapsed: false };
                    }
                }

                signal = control.recv(), if control_open => {
                    match signal {
                        Some(ControlSignal::Cancel { reason }) => {
                            return CaptureExit::Cancelled(reason);
                        }
                        // Evaluation is already underway.
                        Some(ControlSignal::EvaluateNow) => {}
                        None => control_open = false,
                    }
                }

                _ = tokio::time::sleep_until(grace_deadline) => {
                    warn!(session_id = %session.session_id, "grace window elapsed");
                    return CaptureExit::Done { grace_elapsed: true };
                }
            }
        }
    }

    fn transition(&self, session: &mut Session, to: SessionState) {
        obs::emit_state_transition(session.session_id.as_str(), session.state, to);
        session.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelServer;
    use crate::domain::{
        EvalError, Result as EvalResult, SessionId, TargetDescriptor, TaskConfig,
        TriggerPattern,
    };
    use crate::hooks::{LaunchContext, TargetLauncher, TargetProcess};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    struct FakeLauncher {
        terminations: AtomicUsize,
    }

    #[async_trait]
    impl TargetLauncher for FakeLauncher {
        async fn launch(
            &self,
            _target: &TargetDescriptor,
            _context: &LaunchContext,
        ) -> EvalResult<TargetProcess> {
            Ok(TargetProcess::external())
        }

        async fn terminate(&self, _process: &mut TargetProcess) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        launcher: Arc<FakeLauncher>,
        evaluator: SessionEvaluator,
    }

    async fn harness() -> Harness {
        let channel = Arc::new(ChannelServer::bind("127.0.0.1:0").await.expect("bind"));
        let launcher = Arc::new(FakeLauncher {
            terminations: AtomicUsize::new(0),
        });
        let hooks = Arc::new(HookManager::new(channel, launcher.clone()));
        let evaluator = SessionEvaluator::new(hooks, Arc::new(ResultCollector::new()));
        Harness {
            launcher,
            evaluator,
        }
    }

    /// Verdict that passes iff an `open_file` event was recorded.
    fn open_file_verdict() -> crate::domain::VerdictFn {
        Arc::new(|events: &[crate::domain::Event]| {
            let matched = events.iter().any(|e| e.event_type == "open_file");
            Ok(if matched {
                Verdict::pass(json!({"matched": "open_file"}))
            } else {
                Verdict::fail(Value::Null)
            })
        })
    }

    fn task(config: TaskConfig) -> TaskSpec {
        TaskSpec::new(
            "task01_search",
            TargetDescriptor::existing("editor"),
            "hook.observe();",
            config,
            open_file_verdict(),
        )
    }

    fn quick_config() -> TaskConfig {
        TaskConfig {
            timeout_ms: 10_000,
            grace_timeout_ms: 2_000,
            load_timeout_ms: 2_000,
            ..TaskConfig::default()
        }
    }

    /// Scripted target side: performs the handshake, acknowledges injection,
    /// sends `events` while monitoring, and on `evaluate` sends `final_events`
    /// followed by `evaluate_on_completion` (unless `mute_on_evaluate`).
    struct ScriptSim {
        events: Vec<ChannelMessage>,
        final_events: Vec<ChannelMessage>,
        mute_on_evaluate: bool,
    }

    impl ScriptSim {
        async fn run(self, addr: std::net::SocketAddr, session_id: SessionId) {
            let mut client = RawClient::connect(addr, &session_id).await;
            client
                .send(&ChannelMessage::new(reserved::START_SUCCESS))
                .await;
            for event in &self.events {
                client.send(event).await;
            }

            while let Some(message) = client.recv_opt().await {
                match message.event_type.as_str() {
                    reserved::EVALUATE if !self.mute_on_evaluate => {
                        for event in &self.final_events {
                            client.send(event).await;
                        }
                        client
                            .send(&ChannelMessage::new(reserved::EVALUATE_ON_COMPLETION))
                            .await;
                    }
                    reserved::UNLOAD => return,
                    _ => {}
                }
            }
        }
    }

    /// The evaluator owns session-id generation, so the script discovers it
    /// the way a real shim does: the launcher exports it at launch time.
    /// Tests shortcut that by spawning the sim from a launcher wrapper.
    struct ScriptedLauncher {
        inner: Arc<FakeLauncher>,
        addr: std::net::SocketAddr,
        sim: std::sync::Mutex<Option<ScriptSim>>,
    }

    #[async_trait]
    impl TargetLauncher for ScriptedLauncher {
        async fn launch(
            &self,
            target: &TargetDescriptor,
            context: &LaunchContext,
        ) -> EvalResult<TargetProcess> {
            if let Some(sim) = self.sim.lock().unwrap().take() {
                tokio::spawn(sim.run(self.addr, context.session_id.clone()));
            }
            self.inner.launch(target, context).await
        }

        async fn terminate(&self, process: &mut TargetProcess) {
            self.inner.terminate(process).await;
        }
    }

    async fn scripted_harness(sim: ScriptSim) -> Harness {
        let channel = Arc::new(ChannelServer::bind("127.0.0.1:0").await.expect("bind"));
        let channel_addr = channel.local_addr();
        let fake = Arc::new(FakeLauncher {
            terminations: AtomicUsize::new(0),
        });
        let launcher = Arc::new(ScriptedLauncher {
            inner: fake.clone(),
            addr: channel_addr,
            sim: std::sync::Mutex::new(Some(sim)),
        });
        let hooks = Arc::new(HookManager::new(channel, launcher));
        let evaluator = SessionEvaluator::new(hooks, Arc::new(ResultCollector::new()));
        Harness {
            launcher: fake,
            evaluator,
        }
    }

    #[tokio::test]
    async fn test_trigger_match_completes_session() {
        let harness = scripted_harness(ScriptSim {
            events: vec![
                ChannelMessage::new("create_terminal"),
                ChannelMessage::new("open_file"),
            ],
            final_events: vec![ChannelMessage::new("final_state")],
            mute_on_evaluate: false,
        })
        .await;

        let mut config = quick_config();
        config.trigger = Some(TriggerPattern::event_type("open_file"));
        let (_handle, control) = EvaluatorHandle::new();
        let report = harness.evaluator.run(&task(config), control).await;

        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.reason, ReasonCode::TriggerMatched);
        assert!(report.passed());
        assert!(!report.grace_elapsed);
        // Timeline: both monitored events plus the final-state capture.
        let kinds: Vec<_> = report.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            kinds,
            ["create_terminal", "open_file", "final_state", "evaluate_on_completion"]
        );
        assert_eq!(harness.launcher.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evaluate_now_completes_session() {
        let harness = scripted_harness(ScriptSim {
            events: vec![ChannelMessage::new("open_file")],
            final_events: vec![],
            mute_on_evaluate: false,
        })
        .await;

        let (handle, control) = EvaluatorHandle::new();
        let spawned = {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                handle.request_evaluation();
            })
        };
        let report = harness.evaluator.run(&task(quick_config()), control).await;
        spawned.await.unwrap();

        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.reason, ReasonCode::EvaluateNow);
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_coarse_timeout_times_out_session() {
        let harness = scripted_harness(ScriptSim {
            events: vec![],
            final_events: vec![],
            mute_on_evaluate: false,
        })
        .await;

        let config = TaskConfig {
            timeout_ms: 300,
            ..quick_config()
        };
        let (_handle, control) = EvaluatorHandle::new();
        let report = harness.evaluator.run(&task(config), control).await;

        assert_eq!(report.state, SessionState::TimedOut);
        assert_eq!(report.reason, ReasonCode::Timeout);
        assert!(report.verdict.is_none());
        assert!(!report.passed());
        assert_eq!(harness.launcher.terminations.load(Ordering::SeqCst), 1);
    }

    /// One session per spawned task: `run`'s future must be `Send` so
    /// sessions can be scheduled independently across worker threads.
    #[tokio::test]
    async fn test_run_is_spawnable() {
        let harness = scripted_harness(ScriptSim {
            events: vec![ChannelMessage::new("open_file")],
            final_events: vec![],
            mute_on_evaluate: false,
        })
        .await;

        let (handle, control) = EvaluatorHandle::new();
        let spec = task(quick_config());
        let run = tokio::spawn(async move { harness.evaluator.run(&spec, control).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.request_evaluation();

        let report = run.await.expect("run");
        assert_eq!(report.state, SessionState::Completed);
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_coarse_timeout_bounds_attach() {
        struct StalledLauncher;
        #[async_trait]
        impl TargetLauncher for StalledLauncher {
            async fn launch(
                &self,
                _target: &TargetDescriptor,
                _context: &LaunchContext,
            ) -> EvalResult<TargetProcess> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(TargetProcess::external())
            }
            async fn terminate(&self, _process: &mut TargetProcess) {}
        }
        let channel = Arc::new(ChannelServer::bind("127.0.0.1:0").await.expect("bind"));
        let hooks = Arc::new(HookManager::new(channel, Arc::new(StalledLauncher)));
        let evaluator = SessionEvaluator::new(hooks, Arc::new(ResultCollector::new()));

        let config = TaskConfig {
            timeout_ms: 200,
            ..quick_config()
        };
        let (_handle, control) = EvaluatorHandle::new();
        let report = evaluator.run(&task(config), control).await;

        assert_eq!(report.state, SessionState::TimedOut);
        assert_eq!(report.reason, ReasonCode::Timeout);
    }

    #[tokio::test]
    async fn test_coarse_timeout_bounds_script_load() {
        // No script ever connects, and the load timeout alone would allow
        // the session to outlive its coarse budget.
        let harness = harness().await;

        let config = TaskConfig {
            timeout_ms: 200,
            load_timeout_ms: 60_000,
            ..quick_config()
        };
        let (_handle, control) = EvaluatorHandle::new();
        let report = harness.evaluator.run(&task(config), control).await;

        assert_eq!(report.state, SessionState::TimedOut);
        assert_eq!(report.reason, ReasonCode::Timeout);
        assert_eq!(harness.launcher.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_fails_session() {
        let harness = scripted_harness(ScriptSim {
            events: vec![],
            final_events: vec![],
            mute_on_evaluate: false,
        })
        .await;

        let (handle, control) = EvaluatorHandle::new();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.cancel("operator abort");
        });
        let report = harness.evaluator.run(&task(quick_config()), control).await;

        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(report.reason, ReasonCode::Cancelled);
        assert_eq!(report.error.as_deref(), Some("operator abort"));
    }

    #[tokio::test]
    async fn test_script_load_failure_still_tears_down() {
        // No script ever connects.
        let harness = harness().await;

        let config = TaskConfig {
            load_timeout_ms: 200,
            ..quick_config()
        };
        let (_handle, control) = EvaluatorHandle::new();
        let report = harness.evaluator.run(&task(config), control).await;

        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(report.reason, ReasonCode::ScriptLoadFailed);
        assert_eq!(harness.launcher.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_grace_expiry_degrades_but_completes() {
        let harness = scripted_harness(ScriptSim {
            events: vec![ChannelMessage::new("open_file")],
            final_events: vec![],
            mute_on_evaluate: true,
        })
        .await;

        let config = TaskConfig {
            grace_timeout_ms: 300,
            trigger: Some(TriggerPattern::event_type("open_file")),
            ..quick_config()
        };
        let (_handle, control) = EvaluatorHandle::new();
        let report = harness.evaluator.run(&task(config), control).await;

        assert_eq!(report.state, SessionState::Completed);
        assert!(report.grace_elapsed);
        // The verdict still runs over what was captured before the window.
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_verdict_error_fails_session() {
        let harness = scripted_harness(ScriptSim {
            events: vec![ChannelMessage::new("open_file")],
            final_events: vec![],
            mute_on_evaluate: false,
        })
        .await;

        let mut config = quick_config();
        config.trigger = Some(TriggerPattern::event_type("open_file"));
        let spec = TaskSpec::new(
            "task01_search",
            TargetDescriptor::existing("editor"),
            "hook.observe();",
            config,
            Arc::new(|_events: &[crate::domain::Event]| Err("judge exploded".to_string())),
        );

        let (_handle, control) = EvaluatorHandle::new();
        let report = harness.evaluator.run(&spec, control).await;

        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(report.reason, ReasonCode::VerdictFailed);
        assert_eq!(report.error.as_deref(), Some("judge exploded"));
        assert_eq!(harness.launcher.terminations.load(Ordering::SeqCst), 1);
    }

    /// Launcher that reports the session id back to the test so it can drive
    /// the wire protocol by hand.
    struct ProbeLauncher {
        inner: Arc<FakeLauncher>,
        session_tx: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<SessionId>>>,
    }

    #[async_trait]
    impl TargetLauncher for ProbeLauncher {
        async fn launch(
            &self,
            target: &TargetDescriptor,
            context: &LaunchContext,
        ) -> EvalResult<TargetProcess> {
            if let Some(tx) = self.session_tx.lock().unwrap().take() {
                let _ = tx.send(context.session_id.clone());
            }
            self.inner.launch(target, context).await
        }

        async fn terminate(&self, process: &mut TargetProcess) {
            self.inner.terminate(process).await;
        }
    }

    struct RawClient {
        lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl RawClient {
        /// Connect and handshake like a real shim: the logical session may
        /// not be registered yet when the target comes up, so retry until the
        /// staged observation source arrives (that inject is the ack).
        async fn connect(addr: std::net::SocketAddr, session_id: &SessionId) -> Self {
            loop {
                let stream = TcpStream::connect(addr).await.expect("connect");
                let (read_half, writer) = stream.into_split();
                let mut client = Self {
                    lines: BufReader::new(read_half).lines(),
                    writer,
                };
                client.send(&ChannelMessage::hello(session_id)).await;
                match tokio::time::timeout(Duration::from_millis(500), client.recv_opt()).await {
                    Ok(Some(message)) if message.event_type == reserved::INJECT => {
                        return client;
                    }
                    _ => tokio::time::sleep(Duration::from_millis(25)).await,
                }
            }
        }

        async fn send(&mut self, message: &ChannelMessage) {
            let mut line = serde_json::to_string(message).expect("serialize");
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.expect("write");
        }

        async fn recv_opt(&mut self) -> Option<ChannelMessage> {
            let line = self.lines.next_line().await.ok()??;
            Some(serde_json::from_str(&line).expect("deserialize"))
        }

        async fn recv(&mut self) -> ChannelMessage {
            self.recv_opt().await.expect("connection open")
        }
    }

    #[tokio::test]
    async fn test_reconnect_resumes_session_with_one_timeline() {
        let channel = Arc::new(ChannelServer::bind("127.0.0.1:0").await.expect("bind"));
        let addr = channel.local_addr();
        let fake = Arc::new(FakeLauncher {
            terminations: AtomicUsize::new(0),
        });
        let (session_tx, session_rx) = tokio::sync::oneshot::channel();
        let launcher = Arc::new(ProbeLauncher {
            inner: fake.clone(),
            session_tx: std::sync::Mutex::new(Some(session_tx)),
        });
        let hooks = Arc::new(HookManager::new(channel, launcher));
        let evaluator = SessionEvaluator::new(hooks, Arc::new(ResultCollector::new()));

        let (handle, control) = EvaluatorHandle::new();
        let spec = task(quick_config());
        let run = tokio::spawn(async move { evaluator.run(&spec, control).await });

        let session_id = session_rx.await.expect("session id");

        // First transport: connect (consumes the staged inject), ack, send
        // one event, then drop.
        let mut first = RawClient::connect(addr, &session_id).await;
        first.send(&ChannelMessage::new(reserved::START_SUCCESS)).await;
        first.send(&ChannelMessage::new("open_file")).await;
        drop(first);

        // Second transport for the same session: the staged source is
        // re-injected and the timeline continues, not restarts.
        let mut second = RawClient::connect(addr, &session_id).await;
        second.send(&ChannelMessage::new("save_file")).await;

        handle.request_evaluation();
        assert_eq!(second.recv().await.event_type, reserved::EVALUATE);
        second
            .send(&ChannelMessage::new(reserved::EVALUATE_ON_COMPLETION))
            .await;

        let report = run.await.expect("run");
        assert_eq!(report.state, SessionState::Completed);
        let kinds: Vec<_> = report.events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, ["open_file", "save_file", "evaluate_on_completion"]);
        assert!(report.events.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(fake.terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attach_failure_reports_attach_failed() {
        let channel = Arc::new(ChannelServer::bind("127.0.0.1:0").await.expect("bind"));
        struct BrokenLauncher;
        #[async_trait]
        impl TargetLauncher for BrokenLauncher {
            async fn launch(
                &self,
                target: &TargetDescriptor,
                _context: &LaunchContext,
            ) -> EvalResult<TargetProcess> {
                Err(EvalError::Attach(format!("cannot reach {}", target.name)))
            }
            async fn terminate(&self, _process: &mut TargetProcess) {}
        }
        let hooks = Arc::new(HookManager::new(channel, Arc::new(BrokenLauncher)));
        let evaluator = SessionEvaluator::new(hooks, Arc::new(ResultCollector::new()));

        let (_handle, control) = EvaluatorHandle::new();
        let report = evaluator.run(&task(quick_config()), control).await;

        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(report.reason, ReasonCode::AttachFailed);
        assert!(report.events.is_empty());
    }
}
