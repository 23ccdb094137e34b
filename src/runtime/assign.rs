use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::definition::{PipelineDefinition, ProcessKind};
use crate::error::Result;
use crate::runtime::events::{Event, EventBus};
use crate::runtime::lifecycle::Lifecycle;
use crate::runtime::locks::InstanceGuard;
use crate::runtime::model::{ExecState, TaskRecord, WorkflowInstance};
use crate::runtime::queue::Queues;
use crate::runtime::read_task_graph;
use crate::runtime::storage::Stores;

/// Seam for the dispatcher-side execution of internal (meta/control)
/// steps. Internal steps expand their descendants at runtime instead of
/// being shipped to a worker; everything past this trait is out of scope.
#[async_trait]
pub trait InternalStepExecutor: Send + Sync {
    async fn launch(&self, instance: &WorkflowInstance, task: &TaskRecord) -> Result<()>;
}

/// Default seam implementation: log and leave the task in progress.
pub struct LoggingInternalExecutor;

#[async_trait]
impl InternalStepExecutor for LoggingInternalExecutor {
    async fn launch(&self, instance: &WorkflowInstance, task: &TaskRecord) -> Result<()> {
        info!(
            instance_id = %instance.id,
            task_id = %task.id,
            process = %task.process_code,
            "Launching internal step"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct AssignmentReport {
    pub registered: Vec<Uuid>,
    pub cache_checks: Vec<Uuid>,
    pub internal_launches: Vec<Uuid>,
    pub drained: usize,
}

/// The periodic scan that turns eligible task-graph vertices into queue
/// registrations. Runs per Started instance, always under its exclusive
/// lock.
#[derive(Clone)]
pub struct AssignmentPipeline {
    stores: Stores,
    queues: Arc<Queues>,
    bus: EventBus,
    lifecycle: Lifecycle,
    internal: Arc<dyn InternalStepExecutor>,
}

impl AssignmentPipeline {
    pub fn new(
        stores: Stores,
        queues: Arc<Queues>,
        bus: EventBus,
        lifecycle: Lifecycle,
        internal: Arc<dyn InternalStepExecutor>,
    ) -> Self {
        Self { stores, queues, bus, lifecycle, internal }
    }

    pub async fn run_for_instance(
        &self,
        guard: &InstanceGuard,
        instance: &WorkflowInstance,
        definition: &PipelineDefinition,
    ) -> Result<AssignmentReport> {
        let mut report = AssignmentReport::default();
        let graph = read_task_graph(&self.stores, instance).await?;

        for vertex in graph.assignable() {
            let task_id = vertex.task_id;
            if self.queues.assignment.contains(instance.id, task_id)
                || self.queues.cache_check.contains(instance.id, task_id)
            {
                continue;
            }

            let Some(record) = self.stores.tasks.find(task_id).await? else {
                // Every vertex is supposed to have a record; a missing one
                // is an anomaly reconciliation must surface, not this scan.
                warn!(instance_id = %instance.id, task_id = %task_id, "Vertex without durable record");
                continue;
            };

            // A task whose parameters cannot be parsed would stall its whole
            // downstream subgraph forever: force-finish it unrecoverably.
            if serde_json::from_str::<serde_json::Value>(&record.parameters).is_err() {
                warn!(task_id = %task_id, "Unparseable task parameters, failing task");
                self.lifecycle
                    .force_finish(guard, instance, task_id, ExecState::Error)
                    .await?;
                continue;
            }

            match record.exec_state {
                ExecState::None | ExecState::Init => {
                    let kind = definition
                        .process(&record.process_code)
                        .map(|p| p.kind)
                        .unwrap_or(ProcessKind::External);
                    match kind {
                        ProcessKind::External => {
                            if self.queues.assignment.register(instance.id, task_id) {
                                report.registered.push(task_id);
                            }
                        }
                        ProcessKind::Internal => {
                            self.internal.launch(instance, &record).await?;
                            crate::runtime::storage::update_task(&self.stores.tasks, task_id, |t| {
                                t.exec_state = ExecState::InProgress;
                                t.assigned_on = Some(chrono::Utc::now());
                                t.last_contact = Some(chrono::Utc::now());
                            })
                            .await?;
                            report.internal_launches.push(task_id);
                        }
                    }
                }
                ExecState::CheckCache => {
                    if self.queues.cache_check.register(instance.id, task_id) {
                        self.bus.publish_detached(Event::CacheCheckRegistration {
                            instance_id: instance.id,
                            task_id,
                        });
                        report.cache_checks.push(task_id);
                    }
                }
                state => {
                    // Not re-queued from here: reconciliation is the
                    // authority for resolving apparent mismatches.
                    debug!(
                        task_id = %task_id,
                        state = ?state,
                        "Eligible vertex with non-queueable durable state"
                    );
                }
            }
        }

        // Forward-progress drain: entries whose terminal outcome was already
        // copied back into the graph have no reason to stay queued.
        let graph = read_task_graph(&self.stores, instance).await?;
        report.drained = self.queues.assignment.drain(instance.id, |t| {
            t.state.is_terminal()
                || graph.state_of(t.task_id).is_some_and(|s| s.is_terminal())
        });
        report.drained += self.queues.cache_check.drain(instance.id, |t| {
            t.state.is_terminal()
                || graph
                    .state_of(t.task_id)
                    .is_some_and(|s| s.is_terminal())
        });

        Ok(report)
    }
}
