use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::definition::PipelineDefinition;
use crate::error::{EngineError, Result};
use crate::graph::process::ProcessGraph;
use crate::graph::task_graph::TaskVertex;
use crate::runtime::assign::{AssignmentPipeline, InternalStepExecutor, LoggingInternalExecutor};
use crate::runtime::events::{Envelope, Event, EventBus};
use crate::runtime::lifecycle::{
    CacheInvalidator, Lifecycle, LoggingCacheInvalidator, WorkerResult,
};
use crate::runtime::locks::LockRegistry;
use crate::runtime::model::{AllocatedTask, ExecState, InstanceState, TaskRecord, WorkflowInstance};
use crate::runtime::producer::{self, TaskProducer};
use crate::runtime::queue::Queues;
use crate::runtime::reconcile::Reconciler;
use crate::runtime::storage::{Stores, update_task};
use crate::runtime::{read_task_graph, with_task_graph};

/// Read-only view of an instance's task graph for status displays.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub vertices: Vec<TaskVertex>,
    pub edges: Vec<(Uuid, Uuid)>,
}

/// Work items serialized through one instance's queue. Jobs for the same
/// instance run in acceptance order; different instances run in parallel.
#[derive(Debug)]
enum InstanceJob {
    Assign,
    Reconcile,
    Handle(Envelope),
    Result(WorkerResult),
    CacheResult { task_id: Uuid, hit: bool },
    OutputUploaded { task_id: Uuid, name: String },
}

/// The dispatcher: expands pipelines into task graphs, feeds the
/// assignment queue, applies worker reports, and keeps the three state
/// views reconciled.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    stores: Stores,
    queues: Arc<Queues>,
    locks: LockRegistry,
    bus: EventBus,
    lifecycle: Lifecycle,
    assignment: AssignmentPipeline,
    reconciler: Reconciler,
    pipelines: DashMap<String, PipelineDefinition>,
    runners: DashMap<Uuid, mpsc::Sender<InstanceJob>>,
    /// Instances mid-creation: reconciliation skips them.
    creating: DashSet<Uuid>,
    event_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, stores: Stores) -> Self {
        Self::with_internal_executor(config, stores, Arc::new(LoggingInternalExecutor))
    }

    pub fn with_internal_executor(
        config: EngineConfig,
        stores: Stores,
        internal: Arc<dyn InternalStepExecutor>,
    ) -> Self {
        Self::with_collaborators(config, stores, internal, Arc::new(LoggingCacheInvalidator))
    }

    pub fn with_collaborators(
        config: EngineConfig,
        stores: Stores,
        internal: Arc<dyn InternalStepExecutor>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        let queues = Arc::new(Queues::new());
        let (bus, event_rx) = EventBus::channel(256, config.event_redelivery_limit);
        let lifecycle = Lifecycle::with_invalidator(stores.clone(), invalidator);
        let assignment = AssignmentPipeline::new(
            stores.clone(),
            queues.clone(),
            bus.clone(),
            lifecycle.clone(),
            internal,
        );
        let reconciler =
            Reconciler::new(stores.clone(), queues.clone(), bus.clone(), config.clone());
        Self {
            inner: Arc::new(EngineInner {
                config,
                stores,
                queues,
                locks: LockRegistry::new(),
                bus,
                lifecycle,
                assignment,
                reconciler,
                pipelines: DashMap::new(),
                runners: DashMap::new(),
                creating: DashSet::new(),
                event_rx: Mutex::new(Some(event_rx)),
            }),
        }
    }

    pub fn register_pipeline(&self, definition: PipelineDefinition) {
        self.inner.pipelines.insert(definition.id.clone(), definition);
    }

    /// Create a workflow instance from a registered pipeline and start it.
    /// Production is all-or-nothing: a structural failure leaves nothing
    /// persisted and the instance never reaches Started.
    pub async fn create_and_start(&self, pipeline_id: &str, tenant: &str) -> Result<Uuid> {
        let definition = self
            .inner
            .pipelines
            .get(pipeline_id)
            .map(|d| d.clone())
            .ok_or_else(|| {
                EngineError::Structural(format!("unknown pipeline {}", pipeline_id))
            })?;

        let process_graph = ProcessGraph::from_definition(&definition)?;
        let mut instance = WorkflowInstance::new(pipeline_id, tenant);
        self.inner.creating.insert(instance.id);

        let producer = TaskProducer::new(&definition, &process_graph);
        let staged = match producer.produce(instance.id) {
            Ok(s) => s,
            Err(e) => {
                self.inner.creating.remove(&instance.id);
                return Err(e);
            }
        };

        let blob = staged.graph.encode()?;
        instance.state = InstanceState::Started;
        self.inner.stores.tasks.create_many(staged.records).await?;
        self.inner
            .stores
            .instances
            .create_bundle(
                instance.clone(),
                blob,
                crate::runtime::model::RetryState::new(instance.retry_state_id),
                crate::runtime::model::VariableState::new(instance.variable_state_id),
            )
            .await?;

        self.inner.creating.remove(&instance.id);
        info!(instance_id = %instance.id, pipeline = pipeline_id, "Workflow instance started");
        self.inner.bus.publish(Event::FindNewTasks { instance_id: instance.id }).await?;
        Ok(instance.id)
    }

    /// Started <-> Stopped. Stopping only prevents new assignment; in-flight
    /// worker executions finish or are eventually reset by reconciliation.
    pub async fn change_state(&self, instance_id: Uuid, target: InstanceState) -> Result<()> {
        if !matches!(target, InstanceState::Started | InstanceState::Stopped) {
            return Err(EngineError::InvalidTransition(format!(
                "callers may only request Started or Stopped, not {:?}",
                target
            )));
        }
        let _guard = self.inner.locks.lock_instance(instance_id).await;
        let mut instance = self
            .inner
            .stores
            .instances
            .find(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        if instance.state.is_terminal() {
            return Err(EngineError::InvalidTransition(format!(
                "instance {} is already {:?}",
                instance_id, instance.state
            )));
        }
        instance.state = target;
        self.inner.stores.instances.save(&instance).await?;
        if target == InstanceState::Started {
            self.inner.bus.publish(Event::FindNewTasks { instance_id }).await?;
        }
        Ok(())
    }

    /// Remove the instance record immediately and queue the teardown of its
    /// aggregates and queue entries on the instance runner. Routed as a job
    /// rather than a bus event: the runner consumes it with or without the
    /// engine loop, and the bus then only carries redeliveries.
    pub async fn delete(&self, instance_id: Uuid) -> Result<()> {
        let guard = self.inner.locks.lock_instance(instance_id).await;
        let instance = self
            .inner
            .stores
            .instances
            .find(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        self.inner.stores.instances.delete(instance_id).await?;
        drop(guard);
        self.inner
            .enqueue(
                instance_id,
                InstanceJob::Handle(Envelope {
                    event: Event::Deletion {
                        instance_id,
                        task_graph_id: instance.task_graph_id,
                        retry_state_id: instance.retry_state_id,
                        variable_state_id: instance.variable_state_id,
                    },
                    attempt: 0,
                }),
            )
            .await
    }

    /// Worker-facing: claim a queued task. Marks the queue entry assigned
    /// and the durable record InProgress.
    pub async fn claim_task(&self, task_id: Uuid, worker_id: &str) -> Result<TaskRecord> {
        let record = self
            .inner
            .stores
            .tasks
            .find(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let guard = self.inner.locks.lock_instance(record.instance_id).await;
        let _task_guard = self.inner.locks.lock_task(&guard, task_id).await;

        let instance = self
            .inner
            .stores
            .instances
            .find(record.instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(record.instance_id))?;
        if instance.state != InstanceState::Started {
            return Err(EngineError::InvalidTransition(format!(
                "instance {} is {:?}, not accepting pickups",
                instance.id, instance.state
            )));
        }
        if !self.inner.queues.assignment.claim(record.instance_id, task_id) {
            return Err(EngineError::InvalidTransition(format!(
                "task {} is not available for pickup",
                task_id
            )));
        }
        let worker = worker_id.to_string();
        let claimed = update_task(&self.inner.stores.tasks, task_id, |t| {
            t.exec_state = ExecState::InProgress;
            t.assigned_on = Some(chrono::Utc::now());
            t.last_contact = Some(chrono::Utc::now());
            t.core_id = Some(worker.clone());
        })
        .await?;
        Ok(claimed)
    }

    /// Worker began pulling input data; feeds the stall scan.
    pub async fn report_transfer_started(&self, task_id: Uuid) -> Result<()> {
        update_task(&self.inner.stores.tasks, task_id, |t| {
            t.transfer_started = true;
            t.last_contact = Some(chrono::Utc::now());
        })
        .await?;
        Ok(())
    }

    /// Periodic worker heartbeat while executing.
    pub async fn worker_heartbeat(&self, task_id: Uuid) -> Result<()> {
        update_task(&self.inner.stores.tasks, task_id, |t| {
            t.last_contact = Some(chrono::Utc::now());
        })
        .await?;
        Ok(())
    }

    /// Worker-reported result; routed through the instance's serial queue.
    pub async fn report_worker_result(&self, result: WorkerResult) -> Result<()> {
        let record = self
            .inner
            .stores
            .tasks
            .find(result.task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(result.task_id))?;
        self.inner
            .enqueue(record.instance_id, InstanceJob::Result(result))
            .await
    }

    /// A declared output finished uploading after the worker's result
    /// report. May push the task over its finish gate. Routed through the
    /// instance runner so it lands after the result it confirms.
    pub async fn report_output_uploaded(&self, task_id: Uuid, name: &str) -> Result<()> {
        let record = self
            .inner
            .stores
            .tasks
            .find(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        self.inner
            .enqueue(
                record.instance_id,
                InstanceJob::OutputUploaded { task_id, name: name.to_string() },
            )
            .await
    }

    /// Cache collaborator verdict for a CheckCache task.
    pub async fn report_cache_result(&self, task_id: Uuid, hit: bool) -> Result<()> {
        let record = self
            .inner
            .stores
            .tasks
            .find(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        self.inner
            .enqueue(record.instance_id, InstanceJob::CacheResult { task_id, hit })
            .await
    }

    /// Operator seam: request a task reset. Delivered through the event bus
    /// so it serializes with the instance's other work.
    pub async fn reset_task(&self, task_id: Uuid, forced_state: Option<ExecState>) -> Result<()> {
        let record = self
            .inner
            .stores
            .tasks
            .find(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        self.inner
            .bus
            .publish(Event::TaskReset {
                instance_id: record.instance_id,
                task_id,
                forced_state,
            })
            .await
    }

    /// Internal-step callback: splice dynamically produced child tasks below
    /// the internal step's task, then complete the step itself.
    pub async fn expand_internal_step(
        &self,
        parent_task_id: Uuid,
        children: &[(String, String)],
    ) -> Result<Vec<Uuid>> {
        let record = self
            .inner
            .stores
            .tasks
            .find(parent_task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(parent_task_id))?;
        let instance_id = record.instance_id;
        let guard = self.inner.locks.lock_instance(instance_id).await;
        let Some(mut instance) = self.inner.stores.instances.find(instance_id).await? else {
            return Err(EngineError::InstanceNotFound(instance_id));
        };
        let _task_guard = self.inner.locks.lock_task(&guard, parent_task_id).await;

        let records = with_task_graph(&self.inner.stores, &guard, &instance, |graph| {
            producer::expand_internal(graph, instance_id, parent_task_id, children)
        })
        .await?;
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        self.inner.stores.tasks.create_many(records).await?;

        let outcome = self
            .inner
            .lifecycle
            .force_finish(&guard, &instance, parent_task_id, ExecState::Ok)
            .await?;
        self.inner.sync_queue_after_transition(instance_id, &outcome.graph_changes);
        self.inner.lifecycle.maybe_complete_instance(&guard, &mut instance).await?;
        drop(guard);
        self.inner.bus.publish_detached(Event::FindNewTasks { instance_id });
        Ok(ids)
    }

    /// Ordered list of queue entries a worker could be assigned next.
    pub fn eligible_tasks(&self, instance_id: Uuid) -> Vec<AllocatedTask> {
        self.inner.queues.assignment.pending(instance_id)
    }

    pub fn queued_cache_checks(&self, instance_id: Uuid) -> Vec<AllocatedTask> {
        self.inner.queues.cache_check.pending(instance_id)
    }

    pub async fn task_graph_snapshot(&self, instance_id: Uuid) -> Result<GraphSnapshot> {
        let _shared = self.inner.locks.lock_instance_shared(instance_id).await;
        let instance = self
            .inner
            .stores
            .instances
            .find(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        let graph = read_task_graph(&self.inner.stores, &instance).await?;
        Ok(GraphSnapshot { vertices: graph.vertices(), edges: graph.edges() })
    }

    pub async fn instance(&self, instance_id: Uuid) -> Result<Option<WorkflowInstance>> {
        self.inner.stores.instances.find(instance_id).await
    }

    pub async fn started_instances(&self) -> Result<Vec<WorkflowInstance>> {
        self.inner.stores.instances.find_by_state(InstanceState::Started).await
    }

    /// Ask for an immediate assignment pass instead of waiting for the tick.
    pub async fn find_new_tasks(&self, instance_id: Uuid) -> Result<()> {
        self.inner.bus.publish(Event::FindNewTasks { instance_id }).await
    }

    /// Drive the engine: consumes bus events and fires the recurring
    /// assignment and reconciliation ticks. Runs until the bus closes.
    pub async fn run(&self) -> Result<()> {
        let mut rx = self
            .inner
            .event_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::InvalidTransition("engine already running".into()))?;

        let mut assign_tick = tokio::time::interval(self.inner.config.assign_interval);
        let mut reconcile_tick = tokio::time::interval(self.inner.config.reconcile_interval);
        info!("Dispatcher started");

        loop {
            tokio::select! {
                maybe_env = rx.recv() => {
                    let Some(envelope) = maybe_env else { break };
                    let instance_id = envelope.event.instance_id();
                    if let Err(e) = self.inner.enqueue(instance_id, InstanceJob::Handle(envelope)).await {
                        error!(instance_id = %instance_id, "Failed to route event: {}", e);
                    }
                }
                _ = assign_tick.tick() => {
                    self.inner.fan_out(InstanceJobKind::Assign).await;
                }
                _ = reconcile_tick.tick() => {
                    self.inner.fan_out(InstanceJobKind::Reconcile).await;
                }
            }
        }
        Ok(())
    }

    /// Run a bounded number of assignment/reconcile rounds synchronously.
    /// Test and CLI convenience: drains what the ticks would have done.
    pub async fn settle(&self) -> Result<()> {
        for instance in self
            .inner
            .stores
            .instances
            .find_by_state(InstanceState::Started)
            .await?
        {
            self.inner.run_assign(instance.id).await?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum InstanceJobKind {
    Assign,
    Reconcile,
}

impl EngineInner {
    /// Route one job into the instance's bounded serial queue, spawning the
    /// runner lazily. Excess work queues up; order within an instance is
    /// acceptance order.
    async fn enqueue(self: &Arc<Self>, instance_id: Uuid, job: InstanceJob) -> Result<()> {
        let tx = self
            .runners
            .entry(instance_id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.config.instance_queue_capacity);
                let inner = self.clone();
                tokio::spawn(async move { inner.runner_loop(instance_id, rx).await });
                tx
            })
            .clone();
        tx.send(job).await.map_err(|_| EngineError::QueueClosed)
    }

    async fn fan_out(self: &Arc<Self>, kind: InstanceJobKind) {
        let started = match self.stores.instances.find_by_state(InstanceState::Started).await {
            Ok(list) => list,
            Err(e) => {
                error!("Tick scan failed: {}", e);
                return;
            }
        };
        for instance in started {
            let job = match kind {
                InstanceJobKind::Assign => InstanceJob::Assign,
                InstanceJobKind::Reconcile => InstanceJob::Reconcile,
            };
            if let Err(e) = self.enqueue(instance.id, job).await {
                warn!(instance_id = %instance.id, "Could not queue tick work: {}", e);
            }
        }
    }

    async fn runner_loop(self: Arc<Self>, instance_id: Uuid, mut rx: mpsc::Receiver<InstanceJob>) {
        debug!(instance_id = %instance_id, "Instance runner started");
        while let Some(job) = rx.recv().await {
            let outcome = match job {
                InstanceJob::Assign => self.run_assign(instance_id).await,
                InstanceJob::Reconcile => self.run_reconcile(instance_id).await,
                InstanceJob::Result(result) => self.handle_result(instance_id, result).await,
                InstanceJob::CacheResult { task_id, hit } => {
                    self.handle_cache_result(instance_id, task_id, hit).await
                }
                InstanceJob::OutputUploaded { task_id, name } => {
                    self.handle_output_uploaded(instance_id, task_id, &name).await
                }
                InstanceJob::Handle(envelope) => {
                    let event = envelope.event.clone();
                    match self.handle_event(instance_id, event).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            warn!(
                                instance_id = %instance_id,
                                "Event handling failed, redelivering: {}",
                                e
                            );
                            self.bus.redeliver(envelope);
                            Ok(())
                        }
                    }
                }
            };
            if let Err(e) = outcome {
                error!(instance_id = %instance_id, "Instance job failed: {}", e);
            }
        }
        debug!(instance_id = %instance_id, "Instance runner stopped");
    }

    /// The implicit finish barrier has no declared process; synthesize it.
    fn resolve_process(
        &self,
        definition: &PipelineDefinition,
        code: &str,
    ) -> Result<crate::definition::ProcessDefinition> {
        match definition.process(code) {
            Some(p) => Ok(p.clone()),
            None if code == crate::definition::FINISH_PROCESS_CODE => {
                Ok(crate::definition::ProcessDefinition::implicit_finish())
            }
            None => Err(EngineError::ProcessNotFound(code.to_string())),
        }
    }

    fn definition_for(&self, instance: &WorkflowInstance) -> Result<PipelineDefinition> {
        self.pipelines
            .get(&instance.pipeline_id)
            .map(|d| d.clone())
            .ok_or_else(|| {
                EngineError::Structural(format!("unknown pipeline {}", instance.pipeline_id))
            })
    }

    async fn run_assign(&self, instance_id: Uuid) -> Result<()> {
        let Some(instance) = self.stores.instances.find(instance_id).await? else {
            return Ok(()); // deleted meanwhile
        };
        if instance.state != InstanceState::Started {
            return Ok(());
        }
        let definition = self.definition_for(&instance)?;
        let guard = self.locks.lock_instance(instance_id).await;
        let report = self.assignment.run_for_instance(&guard, &instance, &definition).await?;
        if !report.registered.is_empty() || !report.cache_checks.is_empty() {
            debug!(
                instance_id = %instance_id,
                registered = report.registered.len(),
                cache_checks = report.cache_checks.len(),
                drained = report.drained,
                "Assignment pass"
            );
        }
        Ok(())
    }

    async fn run_reconcile(&self, instance_id: Uuid) -> Result<()> {
        if self.creating.contains(&instance_id) {
            return Ok(());
        }
        let Some(instance) = self.stores.instances.find(instance_id).await? else {
            return Ok(());
        };
        let definition = self.definition_for(&instance)?;
        let guard = self.locks.lock_instance(instance_id).await;
        let report = self.reconciler.run_for_instance(&guard, &instance, &definition).await?;
        if report.anomalies > 0 {
            warn!(
                instance_id = %instance_id,
                anomalies = report.anomalies,
                "Reconciliation found unresolved anomalies"
            );
        }
        Ok(())
    }

    async fn handle_result(&self, instance_id: Uuid, result: WorkerResult) -> Result<()> {
        let guard = self.locks.lock_instance(instance_id).await;
        // Read under the lock: a pre-lock copy could miss a completion that
        // raced in and re-stamp completed_on.
        let Some(mut instance) = self.stores.instances.find(instance_id).await? else {
            return Ok(());
        };
        let task_id = result.task_id;
        let Some(record) = self.stores.tasks.find(task_id).await? else {
            return Err(EngineError::TaskNotFound(task_id));
        };
        let definition = self.definition_for(&instance)?;
        let process = self.resolve_process(&definition, &record.process_code)?;
        let _task_guard = self.locks.lock_task(&guard, task_id).await;
        let outcome = self
            .lifecycle
            .apply_worker_result(&guard, &instance, &process, result)
            .await?;

        self.sync_queue_after_transition(instance_id, &outcome.graph_changes);
        if outcome.new_state.is_terminal() {
            self.queues.assignment.deregister(instance_id, task_id);
        } else if outcome.new_state != ExecState::InProgress {
            // Reset for retry: the spent entry must go so the next pass can
            // register the task afresh.
            self.queues.assignment.deregister(instance_id, task_id);
            self.queues.cache_check.deregister(instance_id, task_id);
        }
        self.lifecycle.maybe_complete_instance(&guard, &mut instance).await?;
        drop(guard);
        self.bus.publish_detached(Event::FindNewTasks { instance_id });
        Ok(())
    }

    async fn handle_output_uploaded(&self, instance_id: Uuid, task_id: Uuid, name: &str) -> Result<()> {
        let guard = self.locks.lock_instance(instance_id).await;
        let Some(mut instance) = self.stores.instances.find(instance_id).await? else {
            return Ok(());
        };
        let _task_guard = self.locks.lock_task(&guard, task_id).await;
        if let Some(outcome) = self
            .lifecycle
            .mark_output_uploaded(&guard, &instance, task_id, name)
            .await?
        {
            self.sync_queue_after_transition(instance_id, &outcome.graph_changes);
            if outcome.new_state.is_terminal() {
                self.queues.assignment.deregister(instance_id, task_id);
            }
            self.lifecycle.maybe_complete_instance(&guard, &mut instance).await?;
            drop(guard);
            self.bus.publish_detached(Event::FindNewTasks { instance_id });
        }
        Ok(())
    }

    async fn handle_cache_result(&self, instance_id: Uuid, task_id: Uuid, hit: bool) -> Result<()> {
        let guard = self.locks.lock_instance(instance_id).await;
        let Some(mut instance) = self.stores.instances.find(instance_id).await? else {
            return Ok(());
        };
        self.queues.cache_check.deregister(instance_id, task_id);
        if hit {
            // Served from cache: terminal success without execution.
            let outcome = self
                .lifecycle
                .force_finish(&guard, &instance, task_id, ExecState::Skipped)
                .await?;
            self.sync_queue_after_transition(instance_id, &outcome.graph_changes);
            self.lifecycle.maybe_complete_instance(&guard, &mut instance).await?;
        } else {
            // Fall through to a real worker run on the next pass.
            update_task(&self.stores.tasks, task_id, |t| {
                t.exec_state = ExecState::None;
            })
            .await?;
        }
        drop(guard);
        self.bus.publish_detached(Event::FindNewTasks { instance_id });
        Ok(())
    }

    /// Mirror cascade results into queue entries so stale registrations are
    /// drained on the next pass instead of being offered to workers.
    fn sync_queue_after_transition(&self, instance_id: Uuid, changes: &[(Uuid, ExecState)]) {
        for &(task_id, state) in changes {
            if state.is_terminal() {
                self.queues.assignment.set_state(instance_id, task_id, state);
                self.queues.cache_check.set_state(instance_id, task_id, state);
            }
        }
    }

    async fn handle_event(&self, instance_id: Uuid, event: Event) -> Result<()> {
        match event {
            Event::FindNewTasks { .. } => self.run_assign(instance_id).await,
            Event::TaskReset { task_id, forced_state, .. } => {
                self.handle_reset(instance_id, task_id, forced_state).await
            }
            Event::StateCorrection { task_id, target, .. } => {
                self.handle_correction(instance_id, task_id, target).await
            }
            Event::CacheCheckRegistration { task_id, .. } => {
                // The cache collaborator consumes this seam; nothing to do
                // in-engine beyond making the registration observable.
                debug!(instance_id = %instance_id, task_id = %task_id, "Cache check registered");
                Ok(())
            }
            Event::Deletion {
                task_graph_id,
                retry_state_id,
                variable_state_id,
                ..
            } => {
                self.handle_deletion(instance_id, task_graph_id, retry_state_id, variable_state_id)
                    .await
            }
        }
    }

    /// Idempotent: re-running a reset on an already-reset task re-clears the
    /// same bookkeeping.
    async fn handle_reset(
        &self,
        instance_id: Uuid,
        task_id: Uuid,
        forced_state: Option<ExecState>,
    ) -> Result<()> {
        let Some(instance) = self.stores.instances.find(instance_id).await? else {
            return Ok(());
        };
        let Some(record) = self.stores.tasks.find(task_id).await? else {
            return Ok(());
        };
        let definition = self.definition_for(&instance)?;
        let process = definition.process(&record.process_code).cloned();

        let guard = self.locks.lock_instance(instance_id).await;
        let _task_guard = self.locks.lock_task(&guard, task_id).await;
        self.queues.assignment.deregister(instance_id, task_id);
        self.queues.cache_check.deregister(instance_id, task_id);
        self.lifecycle
            .reset_task(&guard, &instance, task_id, process.as_ref(), forced_state)
            .await?;
        self.reconciler.clear_pending_reset(task_id);
        drop(guard);
        self.bus.publish_detached(Event::FindNewTasks { instance_id });
        Ok(())
    }

    async fn handle_correction(
        &self,
        instance_id: Uuid,
        task_id: Uuid,
        target: ExecState,
    ) -> Result<()> {
        let guard = self.locks.lock_instance(instance_id).await;
        let Some(mut instance) = self.stores.instances.find(instance_id).await? else {
            return Ok(());
        };
        let changes = with_task_graph(&self.stores, &guard, &instance, |graph| {
            if !graph.contains(task_id) {
                // The vertex may be gone after a deletion; corrections are
                // idempotent and at-least-once.
                return Ok(Vec::new());
            }
            graph.set_state(task_id, target)
        })
        .await?;
        self.sync_queue_after_transition(instance_id, &changes);
        self.lifecycle.maybe_complete_instance(&guard, &mut instance).await?;
        Ok(())
    }

    /// Idempotent teardown of everything an instance owns. The instance
    /// record itself was already removed by `delete`.
    async fn handle_deletion(
        &self,
        instance_id: Uuid,
        task_graph_id: Uuid,
        retry_state_id: Uuid,
        variable_state_id: Uuid,
    ) -> Result<()> {
        self.queues.clear_instance(instance_id);
        self.stores.tasks.delete_by_instance(instance_id).await?;
        self.stores.graphs.delete_blob(task_graph_id).await?;
        self.stores.retries.delete(retry_state_id).await?;
        self.stores.variables.delete(variable_state_id).await?;
        info!(instance_id = %instance_id, "Instance torn down");
        Ok(())
    }
}
