//! Task descriptions supplied by the Task Registry.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::event::Event;
use super::report::Verdict;
use super::trigger::TriggerPattern;

/// How to locate or launch the target process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetDescriptor {
    /// Stable identity of the target application. Two sessions with the same
    /// key may not be instrumented concurrently.
    pub name: String,

    /// Executable to launch. `None` means the target is already running and
    /// only the channel handshake attaches to it.
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Launch arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the launched process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables, applied over the parent environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl TargetDescriptor {
    /// Descriptor for an already-running target.
    pub fn existing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable: None,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// Descriptor that launches `executable`.
    pub fn launch(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: Some(executable.into()),
            ..Self::existing(name)
        }
    }
}

/// One context-data restore step executed before the target launches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreEntry {
    /// Source fixture directory or file.
    pub from: PathBuf,
    /// Destination path inside the target's environment.
    pub to: PathBuf,
}

/// Per-task evaluation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    /// Coarse wall-clock budget for the whole task (milliseconds).
    pub timeout_ms: u64,

    /// Grace window after requesting final-state capture (milliseconds).
    pub grace_timeout_ms: u64,

    /// Budget for the observation script to report `start_success`
    /// (milliseconds).
    pub load_timeout_ms: u64,

    /// Optional self-terminating trigger pattern.
    #[serde(default)]
    pub trigger: Option<TriggerPattern>,

    /// Context data restored into place before the target launches.
    #[serde(default)]
    pub context_data: Vec<RestoreEntry>,

    /// Opt-in for clearing persisted session storage after restore.
    /// Destructive; additionally gated by a path-marker safety check.
    #[serde(default)]
    pub clear_storage_on_restore: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 180_000,
            grace_timeout_ms: 10_000,
            load_timeout_ms: 30_000,
            trigger: None,
            context_data: Vec::new(),
            clear_storage_on_restore: false,
        }
    }
}

/// Task-supplied pure function from the event snapshot to a verdict.
///
/// The core never inspects its internals; an `Err` is recorded as a
/// `verdict_failed` terminal failure rather than crashing the evaluator.
pub type VerdictFn = Arc<dyn Fn(&[Event]) -> Result<Verdict, String> + Send + Sync>;

/// Everything the evaluation engine needs to run one task.
#[derive(Clone)]
pub struct TaskSpec {
    /// Task identifier (registry key).
    pub task_id: String,

    /// Target process descriptor.
    pub target: TargetDescriptor,

    /// Observation-script source injected into the target.
    pub script_source: String,

    /// Evaluation configuration.
    pub config: TaskConfig,

    /// Verdict function.
    pub verdict: VerdictFn,
}

impl TaskSpec {
    pub fn new(
        task_id: impl Into<String>,
        target: TargetDescriptor,
        script_source: impl Into<String>,
        config: TaskConfig,
        verdict: VerdictFn,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            target,
            script_source: script_source.into(),
            config,
            verdict,
        }
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("task_id", &self.task_id)
            .field("target", &self.target)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
