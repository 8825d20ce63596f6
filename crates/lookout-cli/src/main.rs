//! Lookout - trigger-monitoring evaluation runner
//!
//! The `lookout` command runs one evaluation session against a target
//! application and writes the resulting report to disk.
//!
//! ## Commands
//!
//! - `run`: Execute a task file end to end and write its report
//! - `validate`: Parse a task file and print the resolved configuration
//! - `list`: List task files in a directory

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn, Level};

use lookout_core::{
    ChannelServer, Event, EvaluatorHandle, HookManager, ProcessLauncher, Report, ResultCollector,
    RestoreEntry, SessionEvaluator, TargetDescriptor, TaskConfig, TaskSpec, TriggerPattern,
    Verdict, VerdictFn,
};

#[derive(Parser)]
#[command(name = "lookout")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Trigger-monitoring evaluation engine for desktop agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a task file end to end and write its report
    Run {
        /// Path to the task file (JSON)
        task: PathBuf,

        /// Directory to write the report into (default: current directory)
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Address for the instrumentation channel listener
        #[arg(long, default_value = "127.0.0.1:0")]
        listen: String,
    },

    /// Parse a task file and print the resolved configuration
    Validate {
        /// Path to the task file (JSON)
        task: PathBuf,
    },

    /// List task files in a directory
    List {
        /// Directory containing task files
        #[arg(default_value = "tasks")]
        dir: PathBuf,
    },
}

/// On-disk task definition.
///
/// Trigger and expectation patterns are expression strings, e.g.
/// `event_type == 'open_file' && path == '/tmp/x.txt'`. Every expectation
/// must match at least one recorded event for the verdict to pass.
#[derive(Debug, Deserialize)]
struct TaskFile {
    task_id: String,
    target: TargetDescriptor,

    /// Observation-script source file.
    script: PathBuf,

    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    grace_timeout_ms: Option<u64>,
    #[serde(default)]
    load_timeout_ms: Option<u64>,

    /// Self-terminating trigger expression.
    #[serde(default)]
    trigger: Option<String>,

    /// Expectation expressions judged over the final event snapshot.
    #[serde(default)]
    expect: Vec<String>,

    #[serde(default)]
    context_data: Vec<RestoreEntry>,
    #[serde(default)]
    clear_storage_on_restore: bool,
}

impl TaskFile {
    fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read task file {}", path.display()))?;
        let task: TaskFile = serde_json::from_str(&contents)
            .with_context(|| format!("invalid task file {}", path.display()))?;
        if task.expect.is_empty() {
            bail!("task {} declares no expectations", task.task_id);
        }
        Ok(task)
    }

    /// Resolve the on-disk definition into a runnable spec. Paths inside the
    /// task file are relative to the file's directory.
    fn into_spec(self, base: &Path) -> Result<TaskSpec> {
        let script_path = base.join(&self.script);
        let script_source = fs::read_to_string(&script_path)
            .with_context(|| format!("failed to read script {}", script_path.display()))?;

        let defaults = TaskConfig::default();
        let mut config = TaskConfig {
            timeout_ms: self.timeout_ms.unwrap_or(defaults.timeout_ms),
            grace_timeout_ms: self.grace_timeout_ms.unwrap_or(defaults.grace_timeout_ms),
            load_timeout_ms: self.load_timeout_ms.unwrap_or(defaults.load_timeout_ms),
            trigger: None,
            context_data: self
                .context_data
                .into_iter()
                .map(|entry| RestoreEntry {
                    from: base.join(&entry.from),
                    to: entry.to,
                })
                .collect(),
            clear_storage_on_restore: self.clear_storage_on_restore,
        };
        if let Some(expr) = &self.trigger {
            let pattern: TriggerPattern = expr
                .parse()
                .with_context(|| format!("invalid trigger expression {expr:?}"))?;
            config.trigger = Some(pattern);
        }

        let verdict = expectation_verdict(&self.expect)
            .with_context(|| format!("invalid expectations for task {}", self.task_id))?;

        Ok(TaskSpec::new(
            self.task_id,
            self.target,
            script_source,
            config,
            verdict,
        ))
    }
}

/// Build a verdict function that passes when every expectation expression
/// matches at least one recorded event.
fn expectation_verdict(expressions: &[String]) -> Result<VerdictFn> {
    let patterns = expressions
        .iter()
        .map(|expr| {
            let pattern: TriggerPattern = expr
                .parse()
                .with_context(|| format!("invalid expectation {expr:?}"))?;
            Ok((expr.clone(), pattern))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Arc::new(move |events: &[Event]| {
        let mut matched = Vec::new();
        let mut missing = Vec::new();
        for (expr, pattern) in &patterns {
            match events.iter().find(|event| pattern.matches(event)) {
                Some(event) => matched.push(json!({"expect": expr, "seq": event.seq})),
                None => missing.push(Value::String(expr.clone())),
            }
        }
        let evidence = json!({"matched": matched, "missing": missing});
        Ok(if missing.is_empty() {
            Verdict::pass(evidence)
        } else {
            Verdict::fail(evidence)
        })
    }))
}

async fn cmd_run(task_path: &Path, output: &Path, listen: &str) -> Result<Report> {
    let base = task_path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let spec = TaskFile::load(task_path)?.into_spec(&base)?;
    let task_id = spec.task_id.clone();

    let channel = Arc::new(
        ChannelServer::bind(listen)
            .await
            .with_context(|| format!("failed to bind channel listener on {listen}"))?,
    );
    info!(addr = %channel.local_addr(), "instrumentation channel listening");

    let hooks = Arc::new(HookManager::new(channel, Arc::new(ProcessLauncher::new())));
    let evaluator = SessionEvaluator::new(hooks, Arc::new(ResultCollector::new()));
    let (handle, control) = EvaluatorHandle::new();

    // First Ctrl-C asks for final evaluation, a second one aborts.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, requesting final evaluation");
            handle.request_evaluation();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, aborting session");
            handle.cancel("interrupted");
        }
    });

    let report = evaluator.run(&spec, control).await;

    fs::create_dir_all(output)
        .with_context(|| format!("failed to create output directory {}", output.display()))?;
    let report_path = output.join(format!("{task_id}-report.json"));
    let rendered = serde_json::to_string_pretty(&report).context("failed to render report")?;
    fs::write(&report_path, rendered)
        .with_context(|| format!("failed to write {}", report_path.display()))?;
    info!(path = %report_path.display(), "report written");

    Ok(report)
}

fn cmd_validate(task_path: &Path) -> Result<()> {
    let base = task_path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let spec = TaskFile::load(task_path)?.into_spec(&base)?;
    println!("task:          {}", spec.task_id);
    println!("target:        {}", spec.target.name);
    println!("timeout_ms:    {}", spec.config.timeout_ms);
    println!("grace_ms:      {}", spec.config.grace_timeout_ms);
    println!(
        "trigger:       {}",
        spec.config
            .trigger
            .as_ref()
            .map(|t| t.event_type.clone())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!("script bytes:  {}", spec.script_source.len());
    Ok(())
}

fn cmd_list(dir: &Path) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    for name in names {
        println!("{name}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    lookout_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            task,
            output,
            listen,
        } => {
            let report = cmd_run(&task, &output, &listen).await?;
            println!(
                "{}: {} ({:?}, {} events, {} ms)",
                report.task_id,
                if report.passed() { "PASS" } else { "FAIL" },
                report.reason,
                report.events.len(),
                report.duration_ms,
            );
            if !report.passed() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Validate { task } => cmd_validate(&task),
        Commands::List { dir } => cmd_list(&dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_core::SessionId;

    fn event(event_type: &str, fields: &[(&str, &str)]) -> Event {
        let mut payload = serde_json::Map::new();
        for (key, value) in fields {
            payload.insert(key.to_string(), Value::String(value.to_string()));
        }
        Event {
            session_id: SessionId::from("s-1"),
            seq: 1,
            received_at: chrono::Utc::now(),
            event_type: event_type.to_string(),
            message: String::new(),
            payload,
        }
    }

    #[test]
    fn test_task_file_parses_and_resolves() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("observe.js"), "hook.observe();").unwrap();
        let task_json = r#"{
            "task_id": "task01_search",
            "target": {"name": "editor"},
            "script": "observe.js",
            "timeout_ms": 60000,
            "trigger": "event_type == 'open_file'",
            "expect": ["event_type == 'open_file' && path == '/tmp/x.txt'"]
        }"#;
        let task_path = dir.path().join("task01.json");
        fs::write(&task_path, task_json).unwrap();

        let spec = TaskFile::load(&task_path)
            .unwrap()
            .into_spec(dir.path())
            .unwrap();
        assert_eq!(spec.task_id, "task01_search");
        assert_eq!(spec.config.timeout_ms, 60_000);
        assert_eq!(spec.script_source, "hook.observe();");
        assert_eq!(
            spec.config.trigger.as_ref().map(|t| t.event_type.as_str()),
            Some("open_file")
        );
    }

    #[test]
    fn test_task_file_without_expectations_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let task_json = r#"{
            "task_id": "task01_search",
            "target": {"name": "editor"},
            "script": "observe.js"
        }"#;
        let task_path = dir.path().join("task01.json");
        fs::write(&task_path, task_json).unwrap();

        assert!(TaskFile::load(&task_path).is_err());
    }

    #[test]
    fn test_expectation_verdict_passes_when_all_match() {
        let verdict = expectation_verdict(&[
            "event_type == 'open_file'".to_string(),
            "event_type == 'save_file' && path == '/tmp/x.txt'".to_string(),
        ])
        .unwrap();

        let events = vec![
            event("open_file", &[]),
            event("save_file", &[("path", "/tmp/x.txt")]),
        ];
        let outcome = verdict(&events).unwrap();
        assert!(outcome.passed);
    }

    #[test]
    fn test_expectation_verdict_reports_missing() {
        let verdict = expectation_verdict(&["event_type == 'open_file'".to_string()]).unwrap();
        let outcome = verdict(&[event("create_terminal", &[])]).unwrap();
        assert!(!outcome.passed);
        assert_eq!(
            outcome.evidence["missing"][0],
            Value::String("event_type == 'open_file'".to_string())
        );
    }

    #[test]
    fn test_invalid_expectation_is_rejected() {
        assert!(expectation_verdict(&["garbage".to_string()]).is_err());
    }
}
