//! Lookout Core Library
//!
//! Trigger-monitoring evaluation engine for benchmarking autonomous desktop
//! agents. Re-exports the pieces a harness composes: the hook manager, the
//! channel server, the result collector, the session evaluator and the task
//! registry.

pub mod channel;
pub mod collector;
pub mod domain;
pub mod evaluator;
pub mod hooks;
pub mod metrics;
pub mod obs;
pub mod registry;
pub mod restore;
pub mod telemetry;

pub use channel::{ChannelServer, Inbound, SessionChannel};

pub use collector::ResultCollector;

pub use domain::{
    reserved, ChannelMessage, EvalError, Event, ReasonCode, Report, RestoreEntry, Result,
    Session, SessionId, SessionState, TargetDescriptor, TaskConfig, TaskSpec, TriggerParseError,
    TriggerPattern, Verdict, VerdictFn,
};

pub use evaluator::{ControlSignal, EvaluatorHandle, SessionEvaluator};

pub use hooks::{
    AttachmentHandle, HookManager, LaunchContext, ProcessLauncher, ScriptHandle, TargetLauncher,
    TargetProcess, ENV_CHANNEL_ADDR, ENV_SESSION_ID,
};

pub use registry::TaskRegistry;

pub use restore::{clear_user_storage, restore_context_data};

pub use metrics::METRICS;
pub use obs::{
    emit_event_recorded, emit_report_produced, emit_session_started, emit_state_transition,
    session_span,
};
pub use telemetry::init_tracing;

/// Lookout version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
