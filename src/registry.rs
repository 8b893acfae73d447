//! Task interning with insertion order preserved.
//!
//! The registry is built while the build program sets itself up and is
//! frozen once the run starts. Registration order doubles as the
//! tie-breaking order everywhere determinism is promised: topological
//! scheduling, output flushing and exit-code selection all fall back to it.

use std::collections::HashMap;

use crate::context::TaskContext;
use crate::error::ConfigError;
use crate::pattern::FilePattern;

pub(crate) type TaskBody = Box<dyn Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync>;

/// A lightweight token referring to a registered task.
///
/// Handles are the second way, next to names, that a task can be referenced
/// a dependency list or a run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub(crate) usize);

impl TaskHandle {
    /// The task's registration index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A dependency reference, by name or by handle.
///
/// Name references may point at tasks registered later; they are resolved
/// when the run starts, which keeps definition order irrelevant.
#[derive(Debug, Clone)]
pub enum TaskRef {
    Name(String),
    Handle(TaskHandle),
}

impl From<&str> for TaskRef {
    fn from(name: &str) -> Self {
        TaskRef::Name(name.to_string())
    }
}

impl From<String> for TaskRef {
    fn from(name: String) -> Self {
        TaskRef::Name(name)
    }
}

impl From<&String> for TaskRef {
    fn from(name: &String) -> Self {
        TaskRef::Name(name.clone())
    }
}

impl From<TaskHandle> for TaskRef {
    fn from(handle: TaskHandle) -> Self {
        TaskRef::Handle(handle)
    }
}

pub(crate) struct Task {
    pub name: String,
    pub deps: Vec<TaskRef>,
    pub inputs: Vec<FilePattern>,
    pub outputs: Vec<FilePattern>,
    pub body: Option<TaskBody>,
    pub doc: Option<String>,
}

#[derive(Default)]
pub(crate) struct Registry {
    tasks: Vec<Task>,
    names: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: Task) -> Result<TaskHandle, ConfigError> {
        if task.name.is_empty() {
            return Err(ConfigError::BadArguments(
                "task names must be non-empty".to_string(),
            ));
        }
        if self.names.contains_key(&task.name) {
            return Err(ConfigError::TaskRedefined(task.name));
        }
        let index = self.tasks.len();
        self.names.insert(task.name.clone(), index);
        self.tasks.push(task);
        Ok(TaskHandle(index))
    }

    pub fn lookup(&self, name: &str) -> Option<TaskHandle> {
        self.names.get(name).copied().map(TaskHandle)
    }

    /// Resolves a reference, failing with `UndefinedTask` on an unknown name
    /// or a foreign handle.
    pub fn resolve(&self, task: &TaskRef) -> Result<usize, ConfigError> {
        match task {
            TaskRef::Name(name) => self
                .names
                .get(name.as_str())
                .copied()
                .ok_or_else(|| ConfigError::UndefinedTask(name.clone())),
            TaskRef::Handle(handle) => {
                if handle.0 < self.tasks.len() {
                    Ok(handle.0)
                } else {
                    Err(ConfigError::UndefinedTask(format!("#{}", handle.0)))
                }
            }
        }
    }

    pub fn get(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> Task {
        Task {
            name: name.to_string(),
            deps: vec![],
            inputs: vec![],
            outputs: vec![],
            body: None,
            doc: None,
        }
    }

    #[test]
    fn registration_preserves_order_and_rejects_duplicates() {
        let mut registry = Registry::new();
        let a = registry.add(named("a")).unwrap();
        let b = registry.add(named("b")).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));

        assert!(matches!(
            registry.add(named("a")),
            Err(ConfigError::TaskRedefined(name)) if name == "a"
        ));

        let order: Vec<_> = registry.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(order, ["a", "b"]);
    }

    #[test]
    fn resolution_by_name_and_handle() {
        let mut registry = Registry::new();
        let a = registry.add(named("a")).unwrap();

        assert_eq!(registry.resolve(&TaskRef::from("a")).unwrap(), 0);
        assert_eq!(registry.resolve(&TaskRef::from(a)).unwrap(), 0);
        assert!(matches!(
            registry.resolve(&TaskRef::from("ghost")),
            Err(ConfigError::UndefinedTask(_))
        ));
    }
}
