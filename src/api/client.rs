//! Purpose: Define the local SDK entry point for managing watched tasks.
//! Exports: `TaskClient`.
//! Role: Thin, validated facade over `TaskLog` shared by the CLI, server, and observer.
//! Invariants: Every new task is validated before it reaches the log.
//! Invariants: Log path resolution matches the CLI (`$SENTINEL_TASK_LOG`, then `.task_log.json`).

use std::path::{Path, PathBuf};

use crate::core::error::Error;
use crate::core::task::Task;
use crate::core::task_log::{RegisterMode, Registered, TaskLog};
use crate::task_paths::default_log_path;

pub type ApiResult<T> = Result<T, Error>;

#[derive(Clone, Debug)]
pub struct TaskClient {
    log: TaskLog,
}

impl TaskClient {
    pub fn new() -> Self {
        Self {
            log: TaskLog::open(default_log_path()),
        }
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log = TaskLog::open(path);
        self
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    pub fn ensure_log(&self) -> ApiResult<()> {
        self.log.ensure()
    }

    pub fn register(
        &self,
        target: impl Into<String>,
        query: impl Into<String>,
        mode: RegisterMode,
    ) -> ApiResult<Registered> {
        let task = Task::new(target, query);
        task.validate()?;
        self.log.register(task, mode)
    }

    pub fn list(&self) -> ApiResult<Vec<Task>> {
        self.log.load()
    }

    pub fn pending(&self) -> ApiResult<Vec<Task>> {
        let mut tasks = self.log.load()?;
        tasks.retain(|task| !task.complete);
        Ok(tasks)
    }

    pub fn get(&self, id: &str) -> ApiResult<Task> {
        self.log.get(id)
    }

    pub fn remove(&self, id: &str) -> ApiResult<Task> {
        self.log.remove(id)
    }

    /// Removes every task watching `query` on `target`, whatever its id or state.
    pub fn remove_matching(&self, target: &str, query: &str) -> ApiResult<usize> {
        let mut removed = 0;
        for complete in [false, true] {
            let selector = Task {
                id: String::new(),
                target: target.to_string(),
                query: query.to_string(),
                complete,
            };
            removed += self.log.remove_matching(&selector)?;
        }
        Ok(removed)
    }

    pub fn set_complete(&self, id: &str, complete: bool) -> ApiResult<Task> {
        self.log.set_complete(id, complete)
    }
}

impl Default for TaskClient {
    fn default() -> Self {
        Self::new()
    }
}
