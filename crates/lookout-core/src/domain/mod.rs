//! Domain models for Lookout.
//!
//! Canonical definitions for the core entities:
//! - `ChannelMessage` / `Event`: wire and recorded event shapes
//! - `Session`: one task's end-to-end evaluation run
//! - `TaskSpec`: everything the engine needs to run one task
//! - `Report`: the immutable per-session summary

pub mod error;
pub mod event;
pub mod report;
pub mod session;
pub mod task;
pub mod trigger;

// Re-export main types and errors
pub use error::{EvalError, Result};
pub use event::{reserved, ChannelMessage, Event};
pub use report::{ReasonCode, Report, Verdict};
pub use session::{Session, SessionId, SessionState};
pub use task::{RestoreEntry, TargetDescriptor, TaskConfig, TaskSpec, VerdictFn};
pub use trigger::{TriggerParseError, TriggerPattern};
