//! In-memory catalog of runnable tasks.

use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::TaskSpec;

/// Maps task ids to their specifications. Registration is last-write-wins,
/// so a harness can re-register a task between runs.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<TaskSpec>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under its `task_id`.
    pub fn register(&self, task: TaskSpec) -> Arc<TaskSpec> {
        let task = Arc::new(task);
        self.tasks.insert(task.task_id.clone(), task.clone());
        task
    }

    /// Look up a task by id.
    pub fn get(&self, task_id: &str) -> Option<Arc<TaskSpec>> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// All registered task ids, sorted for stable listings.
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TargetDescriptor, TaskConfig, Verdict};

    fn spec(task_id: &str) -> TaskSpec {
        TaskSpec::new(
            task_id,
            TargetDescriptor::existing("editor"),
            "hook.observe();",
            TaskConfig::default(),
            Arc::new(|_: &[crate::domain::Event]| Ok(Verdict::pass(serde_json::Value::Null))),
        )
    }

    #[test]
    fn test_register_and_get() {
        let registry = TaskRegistry::new();
        registry.register(spec("task01_search"));

        assert!(registry.get("task01_search").is_some());
        assert!(registry.get("task99_missing").is_none());
    }

    #[test]
    fn test_reregister_replaces() {
        let registry = TaskRegistry::new();
        registry.register(spec("task01_search"));
        let mut updated = spec("task01_search");
        updated.config.timeout_ms = 5_000;
        registry.register(updated);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("task01_search").unwrap().config.timeout_ms, 5_000);
    }

    #[test]
    fn test_task_ids_sorted() {
        let registry = TaskRegistry::new();
        registry.register(spec("task02_reply"));
        registry.register(spec("task01_search"));

        assert_eq!(registry.task_ids(), vec!["task01_search", "task02_reply"]);
    }
}
