use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::model::{
    ExecState, InstanceState, RetryState, TaskRecord, VariableState, WorkflowInstance,
};

// --- Interfaces ---

#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Create the instance together with its three owned aggregates in one
    /// bundle: graph blob, retry state, variable state.
    async fn create_bundle(
        &self,
        instance: WorkflowInstance,
        graph_blob: String,
        retry: RetryState,
        vars: VariableState,
    ) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<WorkflowInstance>>;
    async fn save(&self, instance: &WorkflowInstance) -> Result<()>;
    /// Remove the instance record itself. Aggregates are torn down
    /// separately by the (idempotent) deletion handler.
    async fn delete(&self, id: Uuid) -> Result<()>;
    async fn find_by_state(&self, state: InstanceState) -> Result<Vec<WorkflowInstance>>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn load_blob(&self, graph_id: Uuid) -> Result<Option<String>>;
    async fn save_blob(&self, graph_id: Uuid, blob: String) -> Result<()>;
    async fn delete_blob(&self, graph_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_many(&self, tasks: Vec<TaskRecord>) -> Result<()>;
    async fn find(&self, id: Uuid) -> Result<Option<TaskRecord>>;
    /// Optimistic save: fails with `EngineError::Conflict` when the stored
    /// version moved past the caller's copy. Callers re-read and retry.
    async fn save(&self, task: &TaskRecord) -> Result<TaskRecord>;
    async fn find_by_instance(&self, instance_id: Uuid) -> Result<Vec<TaskRecord>>;
    async fn find_by_state(&self, state: ExecState) -> Result<Vec<TaskRecord>>;
    async fn delete_by_instance(&self, instance_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait RetryStore: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Option<RetryState>>;
    async fn save(&self, state: &RetryState) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Option<VariableState>>;
    async fn save(&self, state: &VariableState) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// The set of durable stores the engine runs against.
#[derive(Clone)]
pub struct Stores {
    pub instances: Arc<dyn InstanceStore>,
    pub graphs: Arc<dyn GraphStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub retries: Arc<dyn RetryStore>,
    pub variables: Arc<dyn VariableStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let backing = Arc::new(InMemoryBacking::default());
        Self {
            instances: backing.clone(),
            graphs: backing.clone(),
            tasks: backing.clone(),
            retries: backing.clone(),
            variables: backing,
        }
    }
}

// --- In-Memory Implementation ---

#[derive(Default)]
pub struct InMemoryBacking {
    instances: DashMap<Uuid, WorkflowInstance>,
    graphs: DashMap<Uuid, String>,
    tasks: DashMap<Uuid, TaskRecord>,
    retries: DashMap<Uuid, RetryState>,
    variables: DashMap<Uuid, VariableState>,
}

#[async_trait]
impl InstanceStore for InMemoryBacking {
    async fn create_bundle(
        &self,
        instance: WorkflowInstance,
        graph_blob: String,
        retry: RetryState,
        vars: VariableState,
    ) -> Result<()> {
        self.graphs.insert(instance.task_graph_id, graph_blob);
        self.retries.insert(instance.retry_state_id, retry);
        self.variables.insert(instance.variable_state_id, vars);
        self.instances.insert(instance.id, instance);
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<WorkflowInstance>> {
        Ok(self.instances.get(&id).map(|i| i.clone()))
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        self.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.instances.remove(&id);
        Ok(())
    }

    async fn find_by_state(&self, state: InstanceState) -> Result<Vec<WorkflowInstance>> {
        Ok(self
            .instances
            .iter()
            .filter(|i| i.state == state)
            .map(|i| i.clone())
            .collect())
    }
}

#[async_trait]
impl GraphStore for InMemoryBacking {
    async fn load_blob(&self, graph_id: Uuid) -> Result<Option<String>> {
        Ok(self.graphs.get(&graph_id).map(|b| b.clone()))
    }

    async fn save_blob(&self, graph_id: Uuid, blob: String) -> Result<()> {
        self.graphs.insert(graph_id, blob);
        Ok(())
    }

    async fn delete_blob(&self, graph_id: Uuid) -> Result<()> {
        self.graphs.remove(&graph_id);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryBacking {
    async fn create_many(&self, tasks: Vec<TaskRecord>) -> Result<()> {
        for task in tasks {
            self.tasks.insert(task.id, task);
        }
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn save(&self, task: &TaskRecord) -> Result<TaskRecord> {
        // The entry guard makes the compare-and-bump atomic per task row.
        let mut entry = self
            .tasks
            .get_mut(&task.id)
            .ok_or(EngineError::TaskNotFound(task.id))?;
        if entry.version != task.version {
            return Err(EngineError::Conflict { kind: "task", id: task.id });
        }
        let mut next = task.clone();
        next.version += 1;
        next.touch();
        *entry = next.clone();
        Ok(next)
    }

    async fn find_by_instance(&self, instance_id: Uuid) -> Result<Vec<TaskRecord>> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| t.instance_id == instance_id)
            .map(|t| t.clone())
            .collect())
    }

    async fn find_by_state(&self, state: ExecState) -> Result<Vec<TaskRecord>> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| t.exec_state == state)
            .map(|t| t.clone())
            .collect())
    }

    async fn delete_by_instance(&self, instance_id: Uuid) -> Result<()> {
        let ids: Vec<Uuid> = self
            .tasks
            .iter()
            .filter(|t| t.instance_id == instance_id)
            .map(|t| t.id)
            .collect();
        for id in ids {
            self.tasks.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl RetryStore for InMemoryBacking {
    async fn load(&self, id: Uuid) -> Result<Option<RetryState>> {
        Ok(self.retries.get(&id).map(|r| r.clone()))
    }

    async fn save(&self, state: &RetryState) -> Result<()> {
        self.retries.insert(state.id, state.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.retries.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl VariableStore for InMemoryBacking {
    async fn load(&self, id: Uuid) -> Result<Option<VariableState>> {
        Ok(self.variables.get(&id).map(|v| v.clone()))
    }

    async fn save(&self, state: &VariableState) -> Result<()> {
        self.variables.insert(state.id, state.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.variables.remove(&id);
        Ok(())
    }
}

/// Retry a read-modify-write closure over a task record until the
/// optimistic save sticks.
pub async fn update_task<F>(tasks: &Arc<dyn TaskStore>, id: Uuid, mut apply: F) -> Result<TaskRecord>
where
    F: FnMut(&mut TaskRecord),
{
    loop {
        let mut record = tasks
            .find(id)
            .await?
            .ok_or(EngineError::TaskNotFound(id))?;
        apply(&mut record);
        match tasks.save(&record).await {
            Ok(saved) => return Ok(saved),
            Err(EngineError::Conflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Convenience for tests and bins: task parameters as a JSON blob.
pub fn params_blob(params: &HashMap<String, serde_json::Value>) -> String {
    serde_json::to_string(params).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn optimistic_save_detects_conflict() {
        let stores = Stores::in_memory();
        let task = TaskRecord::new(Uuid::new_v4(), "p", "{}".into());
        let id = task.id;
        stores.tasks.create_many(vec![task]).await.unwrap();

        let stale = stores.tasks.find(id).await.unwrap().unwrap();
        let fresh = stores.tasks.find(id).await.unwrap().unwrap();

        stores.tasks.save(&fresh).await.unwrap();
        assert!(matches!(
            stores.tasks.save(&stale).await,
            Err(EngineError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn update_task_applies_and_bumps_version() {
        let stores = Stores::in_memory();
        let task = TaskRecord::new(Uuid::new_v4(), "p", "{}".into());
        let id = task.id;
        stores.tasks.create_many(vec![task]).await.unwrap();

        let saved = update_task(&stores.tasks, id, |t| {
            t.exec_state = ExecState::InProgress;
        })
        .await
        .unwrap();
        assert_eq!(saved.exec_state, ExecState::InProgress);
        assert_eq!(saved.version, 1);
    }

    #[tokio::test]
    async fn bundle_create_and_find_by_state() {
        let stores = Stores::in_memory();
        let mut instance = WorkflowInstance::new("pipe", "tenant");
        instance.state = InstanceState::Started;
        let retry = RetryState::new(instance.retry_state_id);
        let vars = VariableState::new(instance.variable_state_id);
        stores
            .instances
            .create_bundle(instance.clone(), "{}".into(), retry, vars)
            .await
            .unwrap();

        let started = stores.instances.find_by_state(InstanceState::Started).await.unwrap();
        assert_eq!(started.len(), 1);
        assert!(stores.graphs.load_blob(instance.task_graph_id).await.unwrap().is_some());
    }
}
