use dashmap::DashMap;
use uuid::Uuid;

use crate::runtime::model::{AllocatedTask, ExecState};

/// In-memory registry of queued tasks, keyed per workflow instance so one
/// busy instance never blocks scans of another. Entries live from
/// "eligible" until their terminal state has been copied back into the
/// task graph.
#[derive(Default)]
pub struct AllocatedQueue {
    entries: DashMap<Uuid, Vec<AllocatedTask>>,
}

impl AllocatedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Returns false (and leaves the queue untouched) when
    /// the task is already present; a task is never queued twice
    /// concurrently for the same instance.
    pub fn register(&self, instance_id: Uuid, task_id: Uuid) -> bool {
        let mut entries = self.entries.entry(instance_id).or_default();
        if entries.iter().any(|e| e.task_id == task_id) {
            return false;
        }
        entries.push(AllocatedTask::new(task_id));
        true
    }

    pub fn contains(&self, instance_id: Uuid, task_id: Uuid) -> bool {
        self.entries
            .get(&instance_id)
            .is_some_and(|e| e.iter().any(|t| t.task_id == task_id))
    }

    pub fn entry_state(&self, instance_id: Uuid, task_id: Uuid) -> Option<ExecState> {
        self.entries
            .get(&instance_id)
            .and_then(|e| e.iter().find(|t| t.task_id == task_id).map(|t| t.state))
    }

    pub fn entries(&self, instance_id: Uuid) -> Vec<AllocatedTask> {
        self.entries
            .get(&instance_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Unassigned entries in registration order, i.e. what a polling worker
    /// would be offered next.
    pub fn pending(&self, instance_id: Uuid) -> Vec<AllocatedTask> {
        self.entries
            .get(&instance_id)
            .map(|e| e.iter().filter(|t| !t.assigned).cloned().collect())
            .unwrap_or_default()
    }

    /// Mark an entry as claimed by a worker.
    pub fn claim(&self, instance_id: Uuid, task_id: Uuid) -> bool {
        let Some(mut entries) = self.entries.get_mut(&instance_id) else {
            return false;
        };
        match entries.iter_mut().find(|t| t.task_id == task_id && !t.assigned) {
            Some(entry) => {
                entry.assigned = true;
                entry.state = ExecState::InProgress;
                true
            }
            None => false,
        }
    }

    pub fn set_state(&self, instance_id: Uuid, task_id: Uuid, state: ExecState) -> bool {
        let Some(mut entries) = self.entries.get_mut(&instance_id) else {
            return false;
        };
        match entries.iter_mut().find(|t| t.task_id == task_id) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    pub fn deregister(&self, instance_id: Uuid, task_id: Uuid) -> bool {
        let Some(mut entries) = self.entries.get_mut(&instance_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|t| t.task_id != task_id);
        entries.len() != before
    }

    /// Drop entries whose state was already copied back into the graph
    /// (`satisfied` decides). Keeps repeated assignment ticks from growing
    /// the queue without bound.
    pub fn drain<F>(&self, instance_id: Uuid, satisfied: F) -> usize
    where
        F: Fn(&AllocatedTask) -> bool,
    {
        let Some(mut entries) = self.entries.get_mut(&instance_id) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|t| !satisfied(t));
        before - entries.len()
    }

    pub fn clear_instance(&self, instance_id: Uuid) {
        self.entries.remove(&instance_id);
    }

    pub fn len(&self, instance_id: Uuid) -> usize {
        self.entries.get(&instance_id).map(|e| e.len()).unwrap_or(0)
    }
}

/// The two queues the assignment pipeline feeds: one consumed by remote
/// workers, one by the cache-check collaborator.
pub struct Queues {
    pub assignment: AllocatedQueue,
    pub cache_check: AllocatedQueue,
}

impl Queues {
    pub fn new() -> Self {
        Self { assignment: AllocatedQueue::new(), cache_check: AllocatedQueue::new() }
    }

    pub fn clear_instance(&self, instance_id: Uuid) {
        self.assignment.clear_instance(instance_id);
        self.cache_check.clear_instance(instance_id);
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}
