//! Pending task queue
//!
//! Highest priority first; FIFO within one priority tier.

use buildsmith_core::models::{TaskId, TaskPriority};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

type QueueKey = (Reverse<TaskPriority>, u64);

#[derive(Debug, Default)]
pub struct TaskQueue {
    ordered: BTreeMap<QueueKey, TaskId>,
    keys: HashMap<TaskId, QueueKey>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: TaskId, priority: TaskPriority) {
        let key = (Reverse(priority), self.next_seq);
        self.next_seq += 1;
        self.ordered.insert(key, id);
        self.keys.insert(id, key);
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        let (_, id) = self.ordered.pop_first()?;
        self.keys.remove(&id);
        Some(id)
    }

    /// Remove a queued task; false when it was not queued
    pub fn remove(&mut self, id: &TaskId) -> bool {
        match self.keys.remove(id) {
            Some(key) => self.ordered.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.keys.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn drain(&mut self) -> Vec<TaskId> {
        self.keys.clear();
        std::mem::take(&mut self.ordered).into_values().collect()
    }
}
