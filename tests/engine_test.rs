mod common;

use common::{engine, eventually, failure, pipeline, process, success};
use taskloom::runtime::model::{ExecState, InstanceState};
use uuid::Uuid;

/// Drive one instance like an inline worker: claim everything eligible,
/// report success, repeat until the instance reaches a terminal state.
/// Returns process codes in completion order.
async fn drive_to_completion(engine: &taskloom::runtime::engine::Engine, instance_id: Uuid) -> Vec<String> {
    let mut order = Vec::new();
    for _ in 0..300 {
        engine.settle().await.expect("settle failed");
        for entry in engine.eligible_tasks(instance_id) {
            let Ok(task) = engine.claim_task(entry.task_id, "inline").await else {
                continue;
            };
            order.push(task.process_code.clone());
            engine
                .report_worker_result(success(task.id, "inline"))
                .await
                .expect("result report failed");
        }
        let instance = engine
            .instance(instance_id)
            .await
            .expect("instance lookup failed")
            .expect("instance disappeared");
        if instance.state.is_terminal() {
            return order;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("instance never reached a terminal state");
}

#[tokio::test]
async fn linear_pipeline_runs_to_completion_in_order() {
    let engine = engine();
    engine.register_pipeline(pipeline(
        "linear",
        vec![process("extract"), process("transform"), process("load")],
        vec![("extract", "transform"), ("transform", "load")],
    ));

    let instance_id = engine.create_and_start("linear", "tenant-a").await.expect("start failed");
    let order = drive_to_completion(&engine, instance_id).await;

    // The implicit finish barrier runs last.
    assert_eq!(order, vec!["extract", "transform", "load", "finish"]);
    let instance = engine.instance(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.state, InstanceState::Finished);
    assert!(instance.completed_on.is_some());
}

#[tokio::test]
async fn fan_in_waits_for_every_parent() {
    let engine = engine();
    engine.register_pipeline(pipeline(
        "diamond",
        vec![process("a"), process("b"), process("c"), process("d")],
        vec![("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
    ));
    let instance_id = engine.create_and_start("diamond", "t").await.expect("start failed");

    engine.settle().await.unwrap();
    let roots = engine.eligible_tasks(instance_id);
    assert_eq!(roots.len(), 1, "only the root is eligible at the start");

    let a = engine.claim_task(roots[0].task_id, "w").await.unwrap();
    engine.report_worker_result(success(a.id, "w")).await.unwrap();

    assert!(
        eventually(|| async {
            engine.settle().await.unwrap();
            engine.eligible_tasks(instance_id).len() == 2
        })
        .await,
        "both branches become eligible after the root"
    );

    // Complete only one branch; the join must stay ineligible.
    let branches = engine.eligible_tasks(instance_id);
    let b = engine.claim_task(branches[0].task_id, "w").await.unwrap();
    engine.report_worker_result(success(b.id, "w")).await.unwrap();
    assert!(
        eventually(|| async {
            engine.settle().await.unwrap();
            engine.eligible_tasks(instance_id).len() == 1
        })
        .await
    );

    let only = &engine.eligible_tasks(instance_id)[0];
    let remaining = engine.claim_task(only.task_id, "w").await.unwrap();
    assert_ne!(remaining.process_code, "d", "join must wait for its second parent");
    engine.report_worker_result(success(remaining.id, "w")).await.unwrap();

    let order = drive_to_completion(&engine, instance_id).await;
    assert!(order.contains(&"d".to_string()));
    let instance = engine.instance(instance_id).await.unwrap().unwrap();
    assert_eq!(instance.state, InstanceState::Finished);
}

#[tokio::test]
async fn failure_breaks_descendants_and_errors_the_instance() {
    let engine = engine();
    engine.register_pipeline(pipeline(
        "failing",
        vec![process("a"), process("b"), process("c")],
        vec![("a", "b"), ("b", "c")],
    ));
    let instance_id = engine.create_and_start("failing", "t").await.expect("start failed");

    engine.settle().await.unwrap();
    let root = engine.eligible_tasks(instance_id)[0].task_id;
    let a = engine.claim_task(root, "w").await.unwrap();
    engine.report_worker_result(failure(a.id, false)).await.unwrap();

    assert!(
        eventually(|| async {
            engine
                .instance(instance_id)
                .await
                .unwrap()
                .is_some_and(|i| i.state == InstanceState::Error)
        })
        .await,
        "instance must end in Error"
    );

    let snapshot = engine.task_graph_snapshot(instance_id).await.unwrap();
    let failed = snapshot.vertices.iter().find(|v| v.task_id == a.id).unwrap();
    assert_eq!(failed.state, ExecState::Error);
    // Non-leaf descendants are Broken; the finish leaf is spared but can
    // never become eligible.
    let broken = snapshot.vertices.iter().filter(|v| v.state == ExecState::Broken).count();
    assert_eq!(broken, 2);
    assert!(engine.eligible_tasks(instance_id).is_empty());
}

#[tokio::test]
async fn stopped_instance_rejects_pickup() {
    let engine = engine();
    engine.register_pipeline(pipeline("stoppable", vec![process("a")], vec![]));
    let instance_id = engine.create_and_start("stoppable", "t").await.expect("start failed");

    engine.settle().await.unwrap();
    let entry = engine.eligible_tasks(instance_id)[0].task_id;

    engine.change_state(instance_id, InstanceState::Stopped).await.unwrap();
    assert!(engine.claim_task(entry, "w").await.is_err());

    // Restart and the same entry is claimable again.
    engine.change_state(instance_id, InstanceState::Started).await.unwrap();
    assert!(engine.claim_task(entry, "w").await.is_ok());
}

#[tokio::test]
async fn delete_tears_down_tasks_and_queues() {
    let engine = engine();
    engine.register_pipeline(pipeline(
        "doomed",
        vec![process("a"), process("b")],
        vec![("a", "b")],
    ));
    let instance_id = engine.create_and_start("doomed", "t").await.expect("start failed");
    engine.settle().await.unwrap();
    assert!(!engine.eligible_tasks(instance_id).is_empty());

    engine.delete(instance_id).await.unwrap();
    assert!(engine.instance(instance_id).await.unwrap().is_none());
    assert!(
        eventually(|| async { engine.eligible_tasks(instance_id).is_empty() }).await,
        "queued entries must be cleared by the deletion event"
    );
    // Deleting twice reports the instance as unknown.
    assert!(engine.delete(instance_id).await.is_err());
}

#[tokio::test]
async fn terminal_state_change_requests_are_rejected() {
    let engine = engine();
    engine.register_pipeline(pipeline("simple", vec![process("a")], vec![]));
    let instance_id = engine.create_and_start("simple", "t").await.expect("start failed");
    assert!(engine.change_state(instance_id, InstanceState::Finished).await.is_err());
    assert!(engine.change_state(instance_id, InstanceState::None).await.is_err());
}

#[tokio::test]
async fn unknown_pipeline_is_refused() {
    let engine = engine();
    assert!(engine.create_and_start("nope", "t").await.is_err());
}
