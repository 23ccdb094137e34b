pub mod assign;
pub mod engine;
pub mod events;
pub mod lifecycle;
pub mod locks;
pub mod model;
pub mod producer;
pub mod queue;
pub mod reconcile;
pub mod redis_storage;
pub mod storage;

use crate::error::{EngineError, Result};
use crate::graph::task_graph::TaskGraph;
use crate::runtime::locks::{InstanceGuard, assert_covers_instance};
use crate::runtime::model::WorkflowInstance;
use crate::runtime::storage::Stores;

/// Read-modify-write transaction over an instance's serialized task graph:
/// load bytes, decode, mutate in memory, encode, write bytes. The guard
/// proves the caller holds the instance's exclusive lock; decode failures
/// surface per-call and leave the stored blob untouched.
pub async fn with_task_graph<F, T>(
    stores: &Stores,
    guard: &InstanceGuard,
    instance: &WorkflowInstance,
    mutate: F,
) -> Result<T>
where
    F: FnOnce(&mut TaskGraph) -> Result<T>,
{
    assert_covers_instance(guard, instance.id)?;
    let blob = stores
        .graphs
        .load_blob(instance.task_graph_id)
        .await?
        .ok_or(EngineError::InstanceNotFound(instance.id))?;
    let mut graph = TaskGraph::decode(&blob)?;
    let out = mutate(&mut graph)?;
    stores
        .graphs
        .save_blob(instance.task_graph_id, graph.encode()?)
        .await?;
    Ok(out)
}

/// Read-only snapshot of the task graph. No lock proof required; readers
/// tolerate a version one mutation behind.
pub async fn read_task_graph(stores: &Stores, instance: &WorkflowInstance) -> Result<TaskGraph> {
    let blob = stores
        .graphs
        .load_blob(instance.task_graph_id)
        .await?
        .ok_or(EngineError::InstanceNotFound(instance.id))?;
    TaskGraph::decode(&blob)
}
