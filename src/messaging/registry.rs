//! Registered task names, owned per broker instance.

use parking_lot::RwLock;
use std::collections::HashSet;

/// Task names this worker can process
#[derive(Debug, Default)]
pub struct TaskRegistry {
    names: RwLock<HashSet<String>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: RwLock::new(names.into_iter().map(Into::into).collect()),
        }
    }

    /// Returns false when `name` was already registered
    pub fn register(&self, name: impl Into<String>) -> bool {
        self.names.write().insert(name.into())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.names.write().remove(name)
    }

    pub fn is_task_registered(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    pub fn registered_tasks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.read().iter().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_query() {
        let registry = TaskRegistry::new();
        assert!(!registry.is_task_registered("add"));
        assert!(registry.register("add"));
        assert!(!registry.register("add"));
        assert!(registry.is_task_registered("add"));
        assert!(registry.unregister("add"));
        assert!(!registry.is_task_registered("add"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = TaskRegistry::with_tasks(["add", "multiply"]);
        let second = TaskRegistry::with_tasks(["resize_image"]);
        assert!(first.is_task_registered("multiply"));
        assert!(!second.is_task_registered("multiply"));
        assert_eq!(first.registered_tasks(), vec!["add", "multiply"]);
    }
}
