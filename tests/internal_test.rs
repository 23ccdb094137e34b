mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{eventually, pipeline, success};
use taskloom::config::EngineConfig;
use taskloom::definition::{ProcessDefinition, ProcessKind, ROOT_CONTEXT};
use taskloom::runtime::assign::InternalStepExecutor;
use taskloom::runtime::engine::Engine;
use taskloom::runtime::model::{ExecState, InstanceState, TaskRecord, WorkflowInstance};
use taskloom::runtime::storage::Stores;
use taskloom::Result;
use uuid::Uuid;

#[derive(Default)]
struct CapturingExecutor {
    launched: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl InternalStepExecutor for CapturingExecutor {
    async fn launch(&self, _instance: &WorkflowInstance, task: &TaskRecord) -> Result<()> {
        self.launched.lock().unwrap().push(task.id);
        Ok(())
    }
}

fn internal(code: &str) -> ProcessDefinition {
    ProcessDefinition {
        code: code.to_string(),
        kind: ProcessKind::Internal,
        context: ROOT_CONTEXT.to_string(),
        caching: false,
        max_tries: 1,
        timeout_secs: None,
        params: Default::default(),
    }
}

fn nested(code: &str, context: &str) -> ProcessDefinition {
    ProcessDefinition { context: context.to_string(), ..common::process(code) }
}

#[tokio::test]
async fn internal_step_expands_and_the_run_completes() {
    let executor = Arc::new(CapturingExecutor::default());
    let engine = Engine::with_internal_executor(
        EngineConfig::default(),
        Stores::in_memory(),
        executor.clone(),
    );
    // "splitter" is expanded by the dispatcher at runtime; its nested child
    // is declared but not produced up front.
    engine.register_pipeline(pipeline(
        "dynamic",
        vec![internal("splitter"), nested("shard", "1,2#1")],
        vec![("splitter", "shard")],
    ));
    let instance_id = engine.create_and_start("dynamic", "t").await.expect("start failed");

    engine.settle().await.unwrap();
    let launched = executor.launched.lock().unwrap().clone();
    assert_eq!(launched.len(), 1, "the internal step goes to the executor, not to workers");
    assert!(engine.eligible_tasks(instance_id).is_empty());
    let splitter = launched[0];

    // The internal step produces two shards and completes itself.
    let shards = engine
        .expand_internal_step(
            splitter,
            &[
                ("shard".to_string(), "{\"part\":0}".to_string()),
                ("shard".to_string(), "{\"part\":1}".to_string()),
            ],
        )
        .await
        .expect("expansion failed");
    assert_eq!(shards.len(), 2);

    let snapshot = engine.task_graph_snapshot(instance_id).await.unwrap();
    assert!(
        snapshot
            .vertices
            .iter()
            .any(|v| v.task_id == splitter && v.state == ExecState::Ok)
    );

    assert!(
        eventually(|| async {
            engine.settle().await.unwrap();
            engine.eligible_tasks(instance_id).len() == 2
        })
        .await,
        "both shards become eligible behind the finished internal step"
    );

    // Drive the shards and the finish barrier home.
    assert!(
        eventually(|| async {
            engine.settle().await.unwrap();
            for entry in engine.eligible_tasks(instance_id) {
                if let Ok(task) = engine.claim_task(entry.task_id, "w").await {
                    let _ = engine.report_worker_result(success(task.id, "w")).await;
                }
            }
            engine
                .instance(instance_id)
                .await
                .unwrap()
                .is_some_and(|i| i.state == InstanceState::Finished)
        })
        .await,
        "the dynamic run must finish"
    );
}

#[tokio::test]
async fn finish_barrier_waits_for_the_expanded_batch() {
    let executor = Arc::new(CapturingExecutor::default());
    let engine = Engine::with_internal_executor(
        EngineConfig::default(),
        Stores::in_memory(),
        executor.clone(),
    );
    engine.register_pipeline(pipeline(
        "gated",
        vec![internal("splitter"), nested("shard", "1,2#1")],
        vec![("splitter", "shard")],
    ));
    let instance_id = engine.create_and_start("gated", "t").await.expect("start failed");

    engine.settle().await.unwrap();
    let splitter = executor.launched.lock().unwrap()[0];
    engine
        .expand_internal_step(splitter, &[("shard".to_string(), "{}".to_string())])
        .await
        .unwrap();

    // The shard is pending; finish must not be offered yet.
    assert!(
        eventually(|| async {
            engine.settle().await.unwrap();
            !engine.eligible_tasks(instance_id).is_empty()
        })
        .await
    );
    let shard_task = {
        let entries = engine.eligible_tasks(instance_id);
        assert_eq!(entries.len(), 1);
        engine.claim_task(entries[0].task_id, "w").await.unwrap()
    };
    assert_eq!(shard_task.process_code, "shard");
    let instance = engine.instance(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.state, InstanceState::Started);
}
