use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution state of one task. The ordering is one of terminal-ness,
/// not of time: a task may go Ok -> None again when an ancestor re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecState {
    Init,
    None,
    CheckCache,
    InProgress,
    /// Terminal success reported by a worker.
    Ok,
    /// Terminal success without execution (cache hit or explicit skip).
    Skipped,
    /// Permanent failure reported by a worker or forced by the engine.
    Error,
    /// Unreachable because an ancestor failed. Never worker-assigned.
    Broken,
    /// Transient failure, eligible for bounded retry.
    ErrorWithRecovery,
}

impl ExecState {
    pub fn is_success(self) -> bool {
        matches!(self, ExecState::Ok | ExecState::Skipped)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ExecState::Error | ExecState::Broken)
    }

    pub fn is_terminal(self) -> bool {
        self.is_success() || self.is_failure()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    None,
    Started,
    Stopped,
    Finished,
    Error,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Finished | InstanceState::Error)
    }
}

/// One run of a pipeline. The three owned aggregates (task graph blob,
/// retry state, variable state) are separate rows with separate locks so
/// graph mutation, retry bookkeeping and variable bookkeeping never
/// contend with each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub pipeline_id: String,
    pub state: InstanceState,
    pub created_on: DateTime<Utc>,
    /// Set exactly once; non-null iff state is Finished or Error.
    pub completed_on: Option<DateTime<Utc>>,
    pub tenant: String,
    pub root_instance_id: Option<Uuid>,
    pub parent_instance_id: Option<Uuid>,
    pub task_graph_id: Uuid,
    pub retry_state_id: Uuid,
    pub variable_state_id: Uuid,
}

impl WorkflowInstance {
    pub fn new(pipeline_id: &str, tenant: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id: pipeline_id.to_string(),
            state: InstanceState::None,
            created_on: Utc::now(),
            completed_on: None,
            tenant: tenant.to_string(),
            root_instance_id: None,
            parent_instance_id: None,
            task_graph_id: Uuid::new_v4(),
            retry_state_id: Uuid::new_v4(),
            variable_state_id: Uuid::new_v4(),
        }
    }

    pub fn complete(&mut self, state: InstanceState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        if self.completed_on.is_none() {
            self.completed_on = Some(Utc::now());
        }
    }
}

/// The durable task record: authoritative for data (parameters, result
/// bookkeeping). The task-graph vertex is authoritative for dependency
/// evaluation; when the two disagree on exec_state, reconciliation
/// corrects the graph, never this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub process_code: String,
    /// Opaque JSON parameters for the worker. A blob that fails to parse
    /// force-finishes the task with an unrecoverable error.
    pub parameters: String,
    pub exec_state: ExecState,
    pub assigned_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    pub updated_on: DateTime<Utc>,
    pub result_received: bool,
    pub completed: bool,
    pub retryable_error: bool,
    /// Worker that claimed the task.
    pub core_id: Option<String>,
    /// Worker began pulling input data; used by the stall scan.
    pub transfer_started: bool,
    pub last_contact: Option<DateTime<Utc>>,
    /// Optimistic concurrency version, bumped on every save.
    pub version: u64,
}

impl TaskRecord {
    pub fn new(instance_id: Uuid, process_code: &str, parameters: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            process_code: process_code.to_string(),
            parameters,
            exec_state: ExecState::None,
            assigned_on: None,
            completed_on: None,
            updated_on: Utc::now(),
            result_received: false,
            completed: false,
            retryable_error: false,
            core_id: None,
            transfer_started: false,
            last_contact: None,
            version: 0,
        }
    }

    /// Clear every piece of assignment/result bookkeeping. Exec state is
    /// set separately by the lifecycle reset.
    pub fn clear_assignment(&mut self) {
        self.assigned_on = None;
        self.completed_on = None;
        self.result_received = false;
        self.completed = false;
        self.retryable_error = false;
        self.core_id = None;
        self.transfer_started = false;
        self.last_contact = None;
    }

    pub fn touch(&mut self) {
        self.updated_on = Utc::now();
    }

    /// The key under which the cache collaborator files this task's result:
    /// process code plus a digest of the parameter blob. Stable across
    /// resets and retries of the same task.
    pub fn cache_key(&self) -> String {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.parameters.hash(&mut hasher);
        format!("{}:{:016x}", self.process_code, hasher.finish())
    }
}

/// Per-instance retry bookkeeping: tries already made per task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryState {
    pub id: Uuid,
    pub tries: std::collections::HashMap<Uuid, u32>,
}

impl RetryState {
    pub fn new(id: Uuid) -> Self {
        Self { id, tries: Default::default() }
    }

    pub fn tries_made(&self, task_id: Uuid) -> u32 {
        self.tries.get(&task_id).copied().unwrap_or(0)
    }

    pub fn record_try(&mut self, task_id: Uuid) -> u32 {
        let entry = self.tries.entry(task_id).or_insert(0);
        *entry += 1;
        *entry
    }
}

/// Per-instance output-variable bindings, keyed by task. An upload marker
/// per variable gates the terminal transition of its task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableState {
    pub id: Uuid,
    pub bindings: std::collections::HashMap<Uuid, Vec<VariableBinding>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableBinding {
    pub name: String,
    pub uploaded: bool,
}

impl VariableState {
    pub fn new(id: Uuid) -> Self {
        Self { id, bindings: Default::default() }
    }

    pub fn clear_task(&mut self, task_id: Uuid) {
        self.bindings.remove(&task_id);
    }

    /// All dispatcher-sourced outputs of the task are marked uploaded.
    /// A task with no bindings counts as fully uploaded.
    pub fn all_uploaded(&self, task_id: Uuid) -> bool {
        self.bindings
            .get(&task_id)
            .map(|vars| vars.iter().all(|v| v.uploaded))
            .unwrap_or(true)
    }
}

/// Queue entry: exists only between "eligible" and "terminal result copied
/// back into the graph". In-memory only, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedTask {
    pub task_id: Uuid,
    /// A worker has claimed the entry.
    pub assigned: bool,
    pub state: ExecState,
}

impl AllocatedTask {
    pub fn new(task_id: Uuid) -> Self {
        Self { task_id, assigned: false, state: ExecState::None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_on_is_set_once() {
        let mut inst = WorkflowInstance::new("p", "tenant");
        inst.complete(InstanceState::Finished);
        let first = inst.completed_on;
        assert!(first.is_some());
        inst.complete(InstanceState::Error);
        assert_eq!(inst.completed_on, first);
    }

    #[test]
    fn exec_state_classification() {
        assert!(ExecState::Ok.is_success());
        assert!(ExecState::Skipped.is_success());
        assert!(ExecState::Error.is_failure());
        assert!(ExecState::Broken.is_failure());
        assert!(!ExecState::ErrorWithRecovery.is_terminal());
        assert!(!ExecState::InProgress.is_terminal());
    }

    #[test]
    fn variable_state_gates_on_uploads() {
        let task = Uuid::new_v4();
        let mut vars = VariableState::new(Uuid::new_v4());
        assert!(vars.all_uploaded(task));
        vars.bindings.insert(
            task,
            vec![
                VariableBinding { name: "out".into(), uploaded: false },
                VariableBinding { name: "log".into(), uploaded: true },
            ],
        );
        assert!(!vars.all_uploaded(task));
        vars.bindings.get_mut(&task).unwrap()[0].uploaded = true;
        assert!(vars.all_uploaded(task));
    }
}
