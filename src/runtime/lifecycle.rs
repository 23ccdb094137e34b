use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::error::{EngineError, Result};
use crate::runtime::locks::InstanceGuard;
use crate::runtime::model::{
    ExecState, InstanceState, RetryState, VariableBinding, VariableState, WorkflowInstance,
};
use crate::runtime::storage::{Stores, update_task};
use crate::runtime::with_task_graph;

/// What a worker reports back for one task.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub task_id: Uuid,
    pub success: bool,
    /// A failed attempt the worker considers transient.
    pub retryable: bool,
    pub worker_id: String,
    /// Output variables this task produced, with their upload status.
    pub outputs: Vec<OutputUpload>,
}

#[derive(Debug, Clone)]
pub struct OutputUpload {
    pub name: String,
    pub uploaded: bool,
}

/// Outcome of feeding a result or correction through the state machine:
/// the task's new durable state plus every graph vertex the cascade moved.
#[derive(Debug)]
pub struct TransitionOutcome {
    pub new_state: ExecState,
    pub graph_changes: Vec<(Uuid, ExecState)>,
}

/// Seam to the cache collaborator. A reset of a caching task must drop the
/// stored entry for its key, or the next CheckCache pass would serve the
/// stale result; the store behind the key is out of scope.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, cache_key: &str) -> Result<()>;
}

/// Default seam implementation: log the key and move on.
pub struct LoggingCacheInvalidator;

#[async_trait]
impl CacheInvalidator for LoggingCacheInvalidator {
    async fn invalidate(&self, cache_key: &str) -> Result<()> {
        info!(cache_key = %cache_key, "Cache invalidation requested");
        Ok(())
    }
}

/// The task lifecycle and retry rules. Every method takes the instance's
/// exclusive-lock guard: graph mutation and retry bookkeeping for one
/// instance are strictly serialized.
#[derive(Clone)]
pub struct Lifecycle {
    stores: Stores,
    cache: Arc<dyn CacheInvalidator>,
}

impl Lifecycle {
    pub fn new(stores: Stores) -> Self {
        Self::with_invalidator(stores, Arc::new(LoggingCacheInvalidator))
    }

    pub fn with_invalidator(stores: Stores, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self { stores, cache }
    }

    /// Reset a task so it can be assigned again: clear assignment/result
    /// bookkeeping, drop its output-variable bindings, and re-open it as
    /// CheckCache (caching process) or None, unless a forced target state
    /// was requested.
    pub async fn reset_task(
        &self,
        guard: &InstanceGuard,
        instance: &WorkflowInstance,
        task_id: Uuid,
        process: Option<&ProcessDefinition>,
        forced: Option<ExecState>,
    ) -> Result<ExecState> {
        let target = forced.unwrap_or_else(|| {
            if process.is_some_and(|p| p.caching) {
                ExecState::CheckCache
            } else {
                ExecState::None
            }
        });

        let record = update_task(&self.stores.tasks, task_id, |t| {
            t.clear_assignment();
            t.exec_state = target;
        })
        .await?;

        if process.is_some_and(|p| p.caching) {
            self.cache.invalidate(&record.cache_key()).await?;
        }

        let mut vars = self
            .stores
            .variables
            .load(instance.variable_state_id)
            .await?
            .unwrap_or_else(|| VariableState::new(instance.variable_state_id));
        vars.clear_task(task_id);
        self.stores.variables.save(&vars).await?;

        with_task_graph(&self.stores, guard, instance, |graph| {
            // The vertex re-opens as None regardless of the durable target:
            // eligibility is evaluated on the graph view.
            graph.set_state(task_id, ExecState::None).map(|_| ())
        })
        .await?;

        info!(task_id = %task_id, target = ?target, "Task reset");
        Ok(target)
    }

    /// Bounded-retry recovery for a task in ErrorWithRecovery: below the
    /// declared limit the task resets to None with tries incremented; at or
    /// above it the error becomes permanent and cascades Broken downstream.
    pub async fn recover_or_fail(
        &self,
        guard: &InstanceGuard,
        instance: &WorkflowInstance,
        task_id: Uuid,
        process: &ProcessDefinition,
    ) -> Result<TransitionOutcome> {
        let mut retry = self
            .stores
            .retries
            .load(instance.retry_state_id)
            .await?
            .unwrap_or_else(|| RetryState::new(instance.retry_state_id));

        if retry.tries_made(task_id) < process.max_tries {
            let tries = retry.record_try(task_id);
            self.stores.retries.save(&retry).await?;
            debug!(task_id = %task_id, tries, max = process.max_tries, "Retrying task");
            let state = self
                .reset_task(guard, instance, task_id, None, Some(ExecState::None))
                .await?;
            Ok(TransitionOutcome { new_state: state, graph_changes: vec![(task_id, ExecState::None)] })
        } else {
            warn!(
                task_id = %task_id,
                max = process.max_tries,
                "Retry budget exhausted, failing permanently"
            );
            self.force_finish(guard, instance, task_id, ExecState::Error).await
        }
    }

    /// Force a task into a terminal state (permanent failure paths: retry
    /// budget exhausted, unparseable parameters). Applies the graph cascade.
    pub async fn force_finish(
        &self,
        guard: &InstanceGuard,
        instance: &WorkflowInstance,
        task_id: Uuid,
        state: ExecState,
    ) -> Result<TransitionOutcome> {
        update_task(&self.stores.tasks, task_id, |t| {
            t.exec_state = state;
            t.completed = true;
            t.completed_on = Some(Utc::now());
        })
        .await?;
        let graph_changes =
            with_task_graph(&self.stores, guard, instance, |graph| graph.set_state(task_id, state))
                .await?;
        Ok(TransitionOutcome { new_state: state, graph_changes })
    }

    /// Feed a worker-reported result through the state machine.
    ///
    /// Success only turns terminal once the result is received AND every
    /// dispatcher-sourced output is uploaded; a partial report leaves the
    /// record InProgress awaiting `mark_output_uploaded`. Transient
    /// failures go through the bounded-retry path; permanent failures
    /// finish as Error with the Broken cascade.
    pub async fn apply_worker_result(
        &self,
        guard: &InstanceGuard,
        instance: &WorkflowInstance,
        process: &ProcessDefinition,
        result: WorkerResult,
    ) -> Result<TransitionOutcome> {
        let task_id = result.task_id;

        let mut vars = self
            .stores
            .variables
            .load(instance.variable_state_id)
            .await?
            .unwrap_or_else(|| VariableState::new(instance.variable_state_id));
        vars.bindings.insert(
            task_id,
            result
                .outputs
                .iter()
                .map(|o| VariableBinding { name: o.name.clone(), uploaded: o.uploaded })
                .collect(),
        );
        self.stores.variables.save(&vars).await?;

        update_task(&self.stores.tasks, task_id, |t| {
            t.result_received = true;
            t.core_id = Some(result.worker_id.clone());
            t.last_contact = Some(Utc::now());
            t.retryable_error = !result.success && result.retryable;
        })
        .await?;

        if result.success {
            if vars.all_uploaded(task_id) {
                let outcome = self.force_finish(guard, instance, task_id, ExecState::Ok).await?;
                Ok(outcome)
            } else {
                debug!(task_id = %task_id, "Result received, waiting for output uploads");
                Ok(TransitionOutcome { new_state: ExecState::InProgress, graph_changes: vec![] })
            }
        } else if result.retryable {
            update_task(&self.stores.tasks, task_id, |t| {
                t.exec_state = ExecState::ErrorWithRecovery;
            })
            .await?;
            self.recover_or_fail(guard, instance, task_id, process).await
        } else {
            self.force_finish(guard, instance, task_id, ExecState::Error).await
        }
    }

    /// Late upload confirmation. Re-checks the finish gate and completes
    /// the task when it was only waiting on uploads.
    pub async fn mark_output_uploaded(
        &self,
        guard: &InstanceGuard,
        instance: &WorkflowInstance,
        task_id: Uuid,
        name: &str,
    ) -> Result<Option<TransitionOutcome>> {
        let mut vars = self
            .stores
            .variables
            .load(instance.variable_state_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance.id))?;
        if let Some(bindings) = vars.bindings.get_mut(&task_id) {
            if let Some(binding) = bindings.iter_mut().find(|b| b.name == name) {
                binding.uploaded = true;
            }
        }
        self.stores.variables.save(&vars).await?;

        let record = self
            .stores
            .tasks
            .find(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        if record.result_received && !record.completed && vars.all_uploaded(task_id) {
            return Ok(Some(self.force_finish(guard, instance, task_id, ExecState::Ok).await?));
        }
        Ok(None)
    }

    /// Close out the instance when the run reached a terminal shape:
    /// Finished when every leaf ended in success, Error when a failure left
    /// no further work (nothing assignable, nothing running).
    pub async fn maybe_complete_instance(
        &self,
        guard: &InstanceGuard,
        instance: &mut WorkflowInstance,
    ) -> Result<bool> {
        let graph = crate::runtime::read_task_graph(&self.stores, instance).await?;
        let _ = guard.id();

        let leaves = graph.leaves();
        if !leaves.is_empty() && leaves.iter().all(|l| l.state.is_success()) {
            instance.complete(InstanceState::Finished);
            self.stores.instances.save(instance).await?;
            info!(instance_id = %instance.id, "Workflow instance finished");
            return Ok(true);
        }

        let any_failure = graph.vertices().iter().any(|v| v.state.is_failure());
        let any_live = graph
            .vertices()
            .iter()
            .any(|v| matches!(v.state, ExecState::InProgress | ExecState::ErrorWithRecovery));
        if any_failure && !any_live && graph.assignable().is_empty() {
            instance.complete(InstanceState::Error);
            self.stores.instances.save(instance).await?;
            warn!(instance_id = %instance.id, "Workflow instance failed");
            return Ok(true);
        }
        Ok(false)
    }
}
