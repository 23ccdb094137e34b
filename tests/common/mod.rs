#![allow(dead_code)]

use std::time::Duration;

use taskloom::config::EngineConfig;
use taskloom::definition::{
    DependencyDecl, PipelineDefinition, ProcessDefinition, ProcessKind, ROOT_CONTEXT,
};
use taskloom::runtime::engine::Engine;
use taskloom::runtime::lifecycle::WorkerResult;
use taskloom::runtime::storage::Stores;
use uuid::Uuid;

pub fn process(code: &str) -> ProcessDefinition {
    ProcessDefinition {
        code: code.to_string(),
        kind: ProcessKind::External,
        context: ROOT_CONTEXT.to_string(),
        caching: false,
        max_tries: 1,
        timeout_secs: None,
        params: Default::default(),
    }
}

pub fn caching_process(code: &str) -> ProcessDefinition {
    ProcessDefinition { caching: true, ..process(code) }
}

pub fn retry_process(code: &str, max_tries: u32) -> ProcessDefinition {
    ProcessDefinition { max_tries, ..process(code) }
}

pub fn pipeline(
    id: &str,
    processes: Vec<ProcessDefinition>,
    deps: Vec<(&str, &str)>,
) -> PipelineDefinition {
    PipelineDefinition {
        id: id.to_string(),
        name: id.to_string(),
        processes,
        dependencies: deps
            .into_iter()
            .map(|(s, t)| DependencyDecl { source: s.to_string(), target: t.to_string() })
            .collect(),
    }
}

pub fn engine() -> Engine {
    Engine::new(EngineConfig::default(), Stores::in_memory())
}

/// Engine plus a handle on its stores, for tests that bend a durable
/// record out of shape on purpose.
pub fn engine_with_stores() -> (Engine, Stores) {
    let stores = Stores::in_memory();
    (Engine::new(EngineConfig::default(), stores.clone()), stores)
}

pub fn success(task_id: Uuid, worker: &str) -> WorkerResult {
    WorkerResult {
        task_id,
        success: true,
        retryable: false,
        worker_id: worker.to_string(),
        outputs: Vec::new(),
    }
}

pub fn failure(task_id: Uuid, retryable: bool) -> WorkerResult {
    WorkerResult {
        task_id,
        success: false,
        retryable,
        worker_id: "test".to_string(),
        outputs: Vec::new(),
    }
}

/// Poll a condition until it holds or a generous deadline passes. Engine
/// jobs run on per-instance runner tasks, so observations are async.
pub async fn eventually<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
