use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::definition::PipelineDefinition;
use crate::error::Result;
use crate::runtime::events::{Event, EventBus};
use crate::runtime::locks::InstanceGuard;
use crate::runtime::model::{ExecState, TaskRecord, WorkflowInstance};
use crate::runtime::queue::Queues;
use crate::runtime::read_task_graph;
use crate::runtime::storage::Stores;

/// Pattern over one state view. `Terminal`/`NonTerminal` classify by
/// terminal-ness so one rule can cover a family of triples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePattern {
    Any,
    Is(ExecState),
    Terminal,
    NonTerminal,
}

impl StatePattern {
    fn matches(self, state: ExecState) -> bool {
        match self {
            StatePattern::Any => true,
            StatePattern::Is(s) => s == state,
            StatePattern::Terminal => state.is_terminal(),
            StatePattern::NonTerminal => !state.is_terminal(),
        }
    }
}

/// Pattern over the queue view, which may legitimately be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePattern {
    Any,
    Absent,
    Present(StatePattern),
}

impl QueuePattern {
    fn matches(self, entry: Option<ExecState>) -> bool {
        match (self, entry) {
            (QueuePattern::Any, _) => true,
            (QueuePattern::Absent, None) => true,
            (QueuePattern::Present(p), Some(state)) => p.matches(state),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Expected transient skew, nothing to do.
    NoAction,
    /// Emit a graph-state-correction event toward the durable state.
    CorrectGraph,
    /// Drop the stale queue entry, then correct the graph.
    DeregisterAndCorrect,
}

#[derive(Debug, Clone)]
pub struct ReconcileRule {
    pub durable: StatePattern,
    pub graph: StatePattern,
    pub queue: QueuePattern,
    pub action: ReconcileAction,
    pub note: &'static str,
}

/// The (durable, graph, queue) decision table. First matching rule wins;
/// an unmatched triple is an anomaly: logged loudly, never guessed at.
/// The table is data, not code, so deployments can extend it: skew shapes
/// after a restart look structurally similar to broken ones and the
/// default mapping is not assumed exhaustive.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub rules: Vec<ReconcileRule>,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        use ExecState::*;
        use QueuePattern as Q;
        use ReconcileAction::*;
        use StatePattern as S;
        Self {
            rules: vec![
                ReconcileRule {
                    durable: S::Is(InProgress),
                    graph: S::Is(None),
                    queue: Q::Present(S::Is(InProgress)),
                    action: NoAction,
                    note: "worker claimed; graph lags until the result lands",
                },
                ReconcileRule {
                    durable: S::Is(InProgress),
                    graph: S::Is(None),
                    queue: Q::Absent,
                    action: NoAction,
                    note: "restart dropped the queue entry; the stall scan owns recovery",
                },
                ReconcileRule {
                    durable: S::Is(CheckCache),
                    graph: S::Is(None),
                    queue: Q::Any,
                    action: NoAction,
                    note: "cache routing keeps the vertex open",
                },
                ReconcileRule {
                    durable: S::Terminal,
                    graph: S::NonTerminal,
                    queue: Q::Present(S::Any),
                    action: DeregisterAndCorrect,
                    note: "finished in the record but still queued",
                },
                ReconcileRule {
                    durable: S::Terminal,
                    graph: S::NonTerminal,
                    queue: Q::Absent,
                    action: CorrectGraph,
                    note: "finished in the record, graph missed the copy-back",
                },
                ReconcileRule {
                    durable: S::Is(ErrorWithRecovery),
                    graph: S::Any,
                    queue: Q::Present(S::Any),
                    action: DeregisterAndCorrect,
                    note: "awaiting retry; the queue entry is stale",
                },
                ReconcileRule {
                    durable: S::Is(None),
                    graph: S::Is(InProgress),
                    queue: Q::Absent,
                    action: CorrectGraph,
                    note: "restart skew: graph remembers a run the record does not",
                },
            ],
        }
    }
}

impl ReconcilePolicy {
    /// Resolve one (durable, graph, queue) triple to a note and an action.
    /// Agreement between the durable and graph views is always fine,
    /// whatever the queue says; otherwise the first matching rule wins.
    pub fn decide(
        &self,
        durable: ExecState,
        graph: ExecState,
        queue: Option<ExecState>,
    ) -> Option<(&'static str, ReconcileAction)> {
        if durable == graph {
            return Some(("views agree", ReconcileAction::NoAction));
        }
        self.rules
            .iter()
            .find(|rule| {
                rule.durable.matches(durable)
                    && rule.graph.matches(graph)
                    && rule.queue.matches(queue)
            })
            .map(|rule| (rule.note, rule.action))
    }
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub corrections: usize,
    pub deregistered: usize,
    pub anomalies: usize,
    pub resets_requested: Vec<Uuid>,
}

/// Compares the three state views for every task of an instance and emits
/// corrective events where they diverge beyond the grace window; separately
/// scans for stalled InProgress tasks.
pub struct Reconciler {
    stores: Stores,
    queues: Arc<Queues>,
    bus: EventBus,
    config: EngineConfig,
    policy: ReconcilePolicy,
    /// Tasks already queued for a stall reset: one reset per stall, not one
    /// per tick. Cleared when the reset handler runs.
    pending_resets: DashSet<Uuid>,
}

impl Reconciler {
    pub fn new(stores: Stores, queues: Arc<Queues>, bus: EventBus, config: EngineConfig) -> Self {
        Self::with_policy(stores, queues, bus, config, ReconcilePolicy::default())
    }

    pub fn with_policy(
        stores: Stores,
        queues: Arc<Queues>,
        bus: EventBus,
        config: EngineConfig,
        policy: ReconcilePolicy,
    ) -> Self {
        Self { stores, queues, bus, config, policy, pending_resets: DashSet::new() }
    }

    /// Forget a stall marker; called when the corresponding reset ran.
    pub fn clear_pending_reset(&self, task_id: Uuid) {
        self.pending_resets.remove(&task_id);
    }

    pub async fn run_for_instance(
        &self,
        guard: &InstanceGuard,
        instance: &WorkflowInstance,
        definition: &PipelineDefinition,
    ) -> Result<ReconcileReport> {
        let _ = guard.id();
        let mut report = ReconcileReport::default();
        let graph = read_task_graph(&self.stores, instance).await?;
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.grace_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));

        for vertex in graph.vertices() {
            let Some(record) = self.stores.tasks.find(vertex.task_id).await? else {
                error!(
                    instance_id = %instance.id,
                    task_id = %vertex.task_id,
                    "Anomaly: graph vertex without durable record"
                );
                report.anomalies += 1;
                continue;
            };

            // Young records may be racing an in-flight worker report.
            if now - record.updated_on < grace {
                continue;
            }

            let queue_state = self
                .queues
                .assignment
                .entry_state(instance.id, vertex.task_id)
                .or_else(|| self.queues.cache_check.entry_state(instance.id, vertex.task_id));

            match self.policy.decide(record.exec_state, vertex.state, queue_state) {
                Some((note, ReconcileAction::NoAction)) => {
                    debug!(task_id = %vertex.task_id, note, "Reconcile: no action");
                }
                Some((note, ReconcileAction::CorrectGraph)) => {
                    debug!(task_id = %vertex.task_id, note, "Reconcile: correcting graph");
                    self.bus.publish_detached(Event::StateCorrection {
                        instance_id: instance.id,
                        task_id: vertex.task_id,
                        target: record.exec_state,
                    });
                    report.corrections += 1;
                }
                Some((note, ReconcileAction::DeregisterAndCorrect)) => {
                    debug!(task_id = %vertex.task_id, note, "Reconcile: deregistering");
                    self.queues.assignment.deregister(instance.id, vertex.task_id);
                    self.queues.cache_check.deregister(instance.id, vertex.task_id);
                    self.bus.publish_detached(Event::StateCorrection {
                        instance_id: instance.id,
                        task_id: vertex.task_id,
                        target: record.exec_state,
                    });
                    report.deregistered += 1;
                    report.corrections += 1;
                }
                None => {
                    // Operators must be able to see these; no auto-repair.
                    error!(
                        instance_id = %instance.id,
                        task_id = %vertex.task_id,
                        durable = ?record.exec_state,
                        graph = ?vertex.state,
                        queue = ?queue_state,
                        "Unresolved state anomaly"
                    );
                    report.anomalies += 1;
                }
            }
        }

        self.scan_stalled(instance, definition, &mut report).await?;
        Ok(report)
    }

    /// Durable records stuck InProgress: no transfer start inside the
    /// assignment window, or silence beyond the effective timeout since the
    /// worker last made contact. Each stall requests exactly one reset.
    async fn scan_stalled(
        &self,
        instance: &WorkflowInstance,
        definition: &PipelineDefinition,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let now = Utc::now();
        for record in self.stores.tasks.find_by_instance(instance.id).await? {
            if record.exec_state != ExecState::InProgress {
                // A task that left InProgress is no longer stalled.
                self.pending_resets.remove(&record.id);
                continue;
            }
            if !self.is_stalled(&record, definition, now) {
                continue;
            }
            if !self.pending_resets.insert(record.id) {
                continue; // already queued for reset
            }
            warn!(
                instance_id = %instance.id,
                task_id = %record.id,
                process = %record.process_code,
                "Stalled task, queueing reset"
            );
            self.bus.publish_detached(Event::TaskReset {
                instance_id: instance.id,
                task_id: record.id,
                forced_state: None,
            });
            report.resets_requested.push(record.id);
        }
        Ok(())
    }

    fn is_stalled(
        &self,
        record: &TaskRecord,
        definition: &PipelineDefinition,
        now: chrono::DateTime<Utc>,
    ) -> bool {
        let transfer_window = chrono::Duration::from_std(self.config.transfer_start_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        if !record.transfer_started {
            if let Some(assigned_on) = record.assigned_on {
                return now - assigned_on > transfer_window;
            }
            return false;
        }

        let declared = definition
            .process(&record.process_code)
            .and_then(|p| p.timeout_secs)
            .map(std::time::Duration::from_secs);
        let effective = self.config.effective_timeout(declared);
        let effective = chrono::Duration::from_std(effective)
            .unwrap_or_else(|_| chrono::Duration::hours(4));

        match record.last_contact.or(record.assigned_on) {
            Some(seen) => now - seen > effective,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_no_action() {
        let policy = ReconcilePolicy::default();
        let (_, action) = policy
            .decide(ExecState::InProgress, ExecState::InProgress, Some(ExecState::InProgress))
            .unwrap();
        assert_eq!(action, ReconcileAction::NoAction);
    }

    #[test]
    fn claimed_but_lagging_graph_is_expected_skew() {
        let policy = ReconcilePolicy::default();
        let (_, action) = policy
            .decide(ExecState::InProgress, ExecState::None, Some(ExecState::InProgress))
            .unwrap();
        assert_eq!(action, ReconcileAction::NoAction);
    }

    #[test]
    fn finished_record_with_stale_queue_entry_deregisters() {
        let policy = ReconcilePolicy::default();
        let (_, action) = policy
            .decide(ExecState::Ok, ExecState::None, Some(ExecState::InProgress))
            .unwrap();
        assert_eq!(action, ReconcileAction::DeregisterAndCorrect);
    }

    #[test]
    fn finished_record_without_queue_entry_corrects_graph() {
        let policy = ReconcilePolicy::default();
        let (_, action) = policy
            .decide(ExecState::Error, ExecState::InProgress, None)
            .unwrap();
        assert_eq!(action, ReconcileAction::CorrectGraph);
    }

    #[test]
    fn unknown_triple_is_unmatched() {
        let policy = ReconcilePolicy::default();
        // Broken record vs Ok graph vertex with a queued entry: not a known
        // pattern, must surface as an anomaly.
        assert!(policy
            .decide(ExecState::Broken, ExecState::Ok, Some(ExecState::None))
            .is_none());
    }
}
