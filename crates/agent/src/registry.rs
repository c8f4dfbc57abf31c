//! Concurrent task registry.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use sandgate_core::error::{Error, Result};

use crate::task::Task;

/// Shared map from task identifier to live task.
///
/// Reads go straight to the map; mutations happen only inside the agent
/// control loop, which keeps register/unregister ordering deterministic.
#[derive(Default)]
pub struct Registry {
    tasks: DashMap<String, Arc<Task>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task under its identifier. Duplicate identifiers are
    /// refused; the caller still owns the task it tried to insert.
    pub fn register(&self, task: Arc<Task>) -> Result<()> {
        match self.tasks.entry(task.id().to_string()) {
            Entry::Occupied(_) => Err(Error::already_registered(task.id())),
            Entry::Vacant(slot) => {
                slot.insert(task);
                Ok(())
            }
        }
    }

    /// Remove and return the task, or `NotRegistered`.
    pub fn unregister(&self, task_id: &str) -> Result<Arc<Task>> {
        self.tasks
            .remove(task_id)
            .map(|(_, task)| task)
            .ok_or_else(|| Error::not_registered(task_id))
    }

    pub fn lookup(&self, task_id: &str) -> Option<Arc<Task>> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Point-in-time snapshot of all registered tasks.
    pub fn tasks(&self) -> Vec<(String, Arc<Task>)> {
        self.tasks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
