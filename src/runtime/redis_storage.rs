use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::model::{
    ExecState, InstanceState, RetryState, TaskRecord, VariableState, WorkflowInstance,
};
use crate::runtime::storage::{
    GraphStore, InstanceStore, RetryStore, TaskStore, VariableStore, Stores,
};

/// Redis-backed durable stores. Instances and tasks live in hashes so
/// state scans are a single HGETALL; the task save goes through a Lua
/// script for an atomic version check.
pub struct RedisBacking {
    client: redis::Client,
    prefix: String,
}

impl RedisBacking {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self { client, prefix: prefix.into() }
    }

    pub fn stores(client: redis::Client, prefix: impl Into<String>) -> Stores {
        let backing = std::sync::Arc::new(Self::new(client, prefix));
        Stores {
            instances: backing.clone(),
            graphs: backing.clone(),
            tasks: backing.clone(),
            retries: backing.clone(),
            variables: backing,
        }
    }

    fn instances_key(&self) -> String {
        format!("{}:instances", self.prefix)
    }

    fn tasks_key(&self) -> String {
        format!("{}:tasks", self.prefix)
    }

    fn graph_key(&self, graph_id: Uuid) -> String {
        format!("{}:graph:{}", self.prefix, graph_id)
    }

    fn retry_key(&self, id: Uuid) -> String {
        format!("{}:retry:{}", self.prefix, id)
    }

    fn vars_key(&self, id: Uuid) -> String {
        format!("{}:vars:{}", self.prefix, id)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl InstanceStore for RedisBacking {
    async fn create_bundle(
        &self,
        instance: WorkflowInstance,
        graph_blob: String,
        retry: RetryState,
        vars: VariableState,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        // One pipeline; partial failure leaves orphans that the idempotent
        // deletion handler cleans up.
        let mut pipe = redis::pipe();
        pipe.hset(
            self.instances_key(),
            instance.id.to_string(),
            serde_json::to_string(&instance)?,
        )
        .set(self.graph_key(instance.task_graph_id), graph_blob)
        .set(self.retry_key(instance.retry_state_id), serde_json::to_string(&retry)?)
        .set(self.vars_key(instance.variable_state_id), serde_json::to_string(&vars)?);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<WorkflowInstance>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(self.instances_key(), id.to_string()).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(
                self.instances_key(),
                instance.id.to_string(),
                serde_json::to_string(instance)?,
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hdel(self.instances_key(), id.to_string()).await?;
        Ok(())
    }

    async fn find_by_state(&self, state: InstanceState) -> Result<Vec<WorkflowInstance>> {
        let mut conn = self.conn().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.instances_key()).await?;
        let mut out = Vec::new();
        for (_, s) in raw {
            if let Ok(instance) = serde_json::from_str::<WorkflowInstance>(&s) {
                if instance.state == state {
                    out.push(instance);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl GraphStore for RedisBacking {
    async fn load_blob(&self, graph_id: Uuid) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(self.graph_key(graph_id)).await?)
    }

    async fn save_blob(&self, graph_id: Uuid, blob: String) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(self.graph_key(graph_id), blob).await?;
        Ok(())
    }

    async fn delete_blob(&self, graph_id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.graph_key(graph_id)).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for RedisBacking {
    async fn create_many(&self, tasks: Vec<TaskRecord>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut items = Vec::with_capacity(tasks.len());
        for task in &tasks {
            items.push((task.id.to_string(), serde_json::to_string(task)?));
        }
        let _: () = conn.hset_multiple(self.tasks_key(), &items).await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.hget(self.tasks_key(), id.to_string()).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, task: &TaskRecord) -> Result<TaskRecord> {
        // Atomic compare-version-and-swap.
        // KEYS[1] = tasks hash, ARGV[1] = field, ARGV[2] = expected version,
        // ARGV[3] = new value. Returns 1 on success, 0 on conflict, -1 when
        // the field is gone.
        let script = redis::Script::new(
            r#"
            local current = redis.call("HGET", KEYS[1], ARGV[1])
            if current == false then
                return -1
            end
            local decoded = cjson.decode(current)
            if tostring(decoded.version) ~= ARGV[2] then
                return 0
            end
            redis.call("HSET", KEYS[1], ARGV[1], ARGV[3])
            return 1
        "#,
        );

        let mut next = task.clone();
        next.version += 1;
        next.touch();

        let mut conn = self.conn().await?;
        let outcome: i64 = script
            .key(self.tasks_key())
            .arg(task.id.to_string())
            .arg(task.version.to_string())
            .arg(serde_json::to_string(&next)?)
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => Ok(next),
            0 => Err(EngineError::Conflict { kind: "task", id: task.id }),
            _ => Err(EngineError::TaskNotFound(task.id)),
        }
    }

    async fn find_by_instance(&self, instance_id: Uuid) -> Result<Vec<TaskRecord>> {
        Ok(self
            .all_tasks()
            .await?
            .into_iter()
            .filter(|t| t.instance_id == instance_id)
            .collect())
    }

    async fn find_by_state(&self, state: ExecState) -> Result<Vec<TaskRecord>> {
        Ok(self
            .all_tasks()
            .await?
            .into_iter()
            .filter(|t| t.exec_state == state)
            .collect())
    }

    async fn delete_by_instance(&self, instance_id: Uuid) -> Result<()> {
        let stale: Vec<String> = self
            .all_tasks()
            .await?
            .into_iter()
            .filter(|t| t.instance_id == instance_id)
            .map(|t| t.id.to_string())
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: () = conn.hdel(self.tasks_key(), stale).await?;
        Ok(())
    }
}

impl RedisBacking {
    async fn all_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut conn = self.conn().await?;
        let raw: HashMap<String, String> = conn.hgetall(self.tasks_key()).await?;
        let mut out = Vec::new();
        for (_, s) in raw {
            if let Ok(task) = serde_json::from_str::<TaskRecord>(&s) {
                out.push(task);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl RetryStore for RedisBacking {
    async fn load(&self, id: Uuid) -> Result<Option<RetryState>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.retry_key(id)).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &RetryState) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(self.retry_key(state.id), serde_json::to_string(state)?).await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.retry_key(id)).await?;
        Ok(())
    }
}

#[async_trait]
impl VariableStore for RedisBacking {
    async fn load(&self, id: Uuid) -> Result<Option<VariableState>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.vars_key(id)).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &VariableState) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(self.vars_key(state.id), serde_json::to_string(state)?).await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.vars_key(id)).await?;
        Ok(())
    }
}

/// Cross-process assignment feed: the dispatcher mirrors queue entries into
/// a redis list; remote workers block-pop task ids off it.
pub struct RedisAssignmentFeed {
    client: redis::Client,
    list_key: String,
}

impl RedisAssignmentFeed {
    pub fn new(client: redis::Client, list_key: String) -> Self {
        Self { client, list_key }
    }

    pub async fn push(&self, task_id: Uuid) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.lpush(&self.list_key, task_id.to_string()).await?;
        Ok(())
    }

    /// Blocks for up to a second so worker loops stay responsive to shutdown.
    pub async fn pop(&self) -> Result<Option<Uuid>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<(String, String)> = conn.brpop(&self.list_key, 1.0).await?;
        match result {
            Some((_, raw)) => {
                let id = raw
                    .parse::<Uuid>()
                    .map_err(|e| EngineError::Codec(format!("bad task id on feed: {}", e)))?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }
}
