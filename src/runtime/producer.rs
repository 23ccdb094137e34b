use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::definition::{FINISH_PROCESS_CODE, PipelineDefinition, ProcessDefinition, ProcessKind};
use crate::error::{EngineError, Result};
use crate::graph::process::{ProcessGraph, ProcessVertex};
use crate::graph::task_graph::{NewVertex, TaskGraph};
use crate::runtime::model::{ExecState, TaskRecord};
use crate::runtime::storage::params_blob;

/// The staged result of one production pass. Nothing is persisted until
/// the whole pass validated: callers commit `records` and `graph` together
/// or not at all.
#[derive(Debug)]
pub struct ProducedRun {
    pub graph: TaskGraph,
    pub records: Vec<TaskRecord>,
}

/// Expands ProcessGraph vertices into task-graph vertices plus durable
/// task records, wiring parent edges from process dependencies.
pub struct TaskProducer<'a> {
    definition: &'a PipelineDefinition,
    process_graph: &'a ProcessGraph,
}

impl<'a> TaskProducer<'a> {
    pub fn new(definition: &'a PipelineDefinition, process_graph: &'a ProcessGraph) -> Self {
        Self { definition, process_graph }
    }

    /// One-shot production for a fresh run. Walks the static graph in
    /// topological order; descendants of internal steps are deferred to
    /// that step's own runtime expansion.
    pub fn produce(&self, instance_id: Uuid) -> Result<ProducedRun> {
        let mut graph = TaskGraph::new();
        let mut records: Vec<TaskRecord> = Vec::new();
        // A process may already map to several tasks (fan-out), so children
        // wire to every task produced for each parent process.
        let mut produced_by_code: HashMap<String, Vec<Uuid>> = HashMap::new();
        // Deferred process -> its owning internal step. Children whose
        // parent is deferred wire to the owner's task instead, so they wait
        // at least for the internal step itself.
        let mut deferred_owner: HashMap<String, String> = HashMap::new();

        for vertex in self.process_graph.topo_order() {
            let process = self.resolve(vertex)?;

            if let Some(owner) = self.internal_owner(vertex)? {
                debug!(
                    process = %vertex.process_code,
                    owner = %owner,
                    "Deferring production to internal ancestor's runtime expansion"
                );
                deferred_owner.insert(vertex.process_code.clone(), owner);
                continue;
            }

            // Three-view split: the graph vertex starts None so dependency
            // evaluation can pick it; the durable record starts CheckCache
            // for caching processes, which the assignment branch table reads.
            let record = {
                let mut r = TaskRecord::new(instance_id, &vertex.process_code, params_blob(&process.params));
                if process.caching {
                    r.exec_state = ExecState::CheckCache;
                }
                r
            };

            let parents: Vec<Uuid> = self
                .process_graph
                .direct_parents(&vertex.id)
                .iter()
                .flat_map(|p| {
                    // Follow the deferral chain: a deferred parent stands in
                    // for its (possibly nested) internal owner.
                    let mut code = p.process_code.as_str();
                    while !produced_by_code.contains_key(code) {
                        match deferred_owner.get(code) {
                            Some(owner) => code = owner.as_str(),
                            None => break,
                        }
                    }
                    produced_by_code.get(code).cloned().unwrap_or_default()
                })
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect();

            graph.add_vertex(record.id, ExecState::None, &parents)?;
            produced_by_code
                .entry(vertex.process_code.clone())
                .or_default()
                .push(record.id);
            records.push(record);
        }

        Ok(ProducedRun { graph, records })
    }

    fn resolve(&self, vertex: &ProcessVertex) -> Result<ProcessDefinition> {
        match self.definition.process(&vertex.process_code) {
            Some(p) => Ok(p.clone()),
            // The implicit terminal step may be absent from the definition.
            None if vertex.process_code == FINISH_PROCESS_CODE => {
                Ok(ProcessDefinition::implicit_finish())
            }
            None => Err(EngineError::ProcessNotFound(vertex.process_code.clone())),
        }
    }

    /// Walk enclosing ancestors up to the top-level boundary. Any internal
    /// ancestor owns this vertex's production; returns its code. An
    /// enclosing ancestor declared external is a structural error: only
    /// internal steps may own a nested group.
    fn internal_owner(&self, vertex: &ProcessVertex) -> Result<Option<String>> {
        for ancestor in self.process_graph.enclosing_ancestors(&vertex.id) {
            let owner = self
                .definition
                .process(&ancestor.process_code)
                .ok_or_else(|| EngineError::ProcessNotFound(ancestor.process_code.clone()))?;
            match owner.kind {
                ProcessKind::Internal => return Ok(Some(ancestor.process_code.clone())),
                ProcessKind::External => {
                    return Err(EngineError::Structural(format!(
                        "process {} owns nested group {} but is declared external",
                        ancestor.process_code, vertex.context_id
                    )));
                }
            }
        }
        Ok(None)
    }
}

/// Runtime expansion hook for internal steps: splice dynamically created
/// tasks below the internal step's task. Returns the staged records; the
/// caller persists records and graph inside its own transaction.
pub fn expand_internal(
    graph: &mut TaskGraph,
    instance_id: Uuid,
    parent_task: Uuid,
    children: &[(String, String)], // (process_code, parameters blob)
) -> Result<Vec<TaskRecord>> {
    if !graph.contains(parent_task) {
        return Err(EngineError::TaskNotFound(parent_task));
    }
    // The expansion goes BETWEEN the internal task and its current
    // children, so downstream tasks (the finish barrier included) wait for
    // the dynamic batch too.
    let downstream = graph.direct_descendants(parent_task);

    let mut records = Vec::with_capacity(children.len());
    let mut batch = Vec::with_capacity(children.len());
    for (code, params) in children {
        let record = TaskRecord::new(instance_id, code, params.clone());
        batch.push(NewVertex {
            task_id: record.id,
            state: ExecState::None,
            parents: vec![parent_task],
        });
        records.push(record);
    }
    graph.add_vertices(&batch)?;
    for record in &records {
        for &child in &downstream {
            graph.link(record.id, child)?;
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DependencyDecl, ROOT_CONTEXT};

    fn process(code: &str, kind: ProcessKind, context: &str) -> ProcessDefinition {
        ProcessDefinition {
            code: code.to_string(),
            kind,
            context: context.to_string(),
            caching: false,
            max_tries: 1,
            timeout_secs: None,
            params: Default::default(),
        }
    }

    fn pipeline(processes: Vec<ProcessDefinition>, deps: Vec<(&str, &str)>) -> PipelineDefinition {
        PipelineDefinition {
            id: "p".into(),
            name: "p".into(),
            processes,
            dependencies: deps
                .into_iter()
                .map(|(s, t)| DependencyDecl { source: s.into(), target: t.into() })
                .collect(),
        }
    }

    #[test]
    fn one_record_per_vertex_and_acyclic() {
        let def = pipeline(
            vec![
                process("a", ProcessKind::External, ROOT_CONTEXT),
                process("b", ProcessKind::External, ROOT_CONTEXT),
            ],
            vec![("a", "b")],
        );
        let pg = ProcessGraph::from_definition(&def).unwrap();
        let run = TaskProducer::new(&def, &pg).produce(Uuid::new_v4()).unwrap();

        // a, b, synthesized finish
        assert_eq!(run.records.len(), 3);
        assert_eq!(run.graph.len(), 3);
        for record in &run.records {
            assert!(run.graph.contains(record.id));
        }
        // the staged graph round-trips, which also proves it decoded as a DAG
        let raw = run.graph.encode().unwrap();
        assert_eq!(TaskGraph::decode(&raw).unwrap().len(), 3);
    }

    #[test]
    fn descendants_of_internal_steps_are_deferred() {
        let def = pipeline(
            vec![
                process("group", ProcessKind::Internal, ROOT_CONTEXT),
                process("inner", ProcessKind::External, "1,2#1"),
                process("after", ProcessKind::External, ROOT_CONTEXT),
            ],
            vec![("group", "inner"), ("inner", "after")],
        );
        let pg = ProcessGraph::from_definition(&def).unwrap();
        let run = TaskProducer::new(&def, &pg).produce(Uuid::new_v4()).unwrap();

        let codes: Vec<&str> = run.records.iter().map(|r| r.process_code.as_str()).collect();
        assert!(codes.contains(&"group"));
        assert!(!codes.contains(&"inner"), "nested step must wait for runtime expansion");
        assert!(codes.contains(&"after"));
    }

    #[test]
    fn child_of_deferred_process_waits_for_the_internal_owner() {
        let def = pipeline(
            vec![
                process("group", ProcessKind::Internal, ROOT_CONTEXT),
                process("inner", ProcessKind::External, "1,2#1"),
                process("after", ProcessKind::External, ROOT_CONTEXT),
            ],
            vec![("group", "inner"), ("inner", "after")],
        );
        let pg = ProcessGraph::from_definition(&def).unwrap();
        let run = TaskProducer::new(&def, &pg).produce(Uuid::new_v4()).unwrap();

        let task_of = |code: &str| {
            run.records.iter().find(|r| r.process_code == code).map(|r| r.id).unwrap()
        };
        assert_eq!(run.graph.direct_ancestors(task_of("after")), vec![task_of("group")]);
    }

    #[test]
    fn expansion_splices_between_parent_and_downstream() {
        let def = pipeline(
            vec![
                process("group", ProcessKind::Internal, ROOT_CONTEXT),
                process("after", ProcessKind::External, ROOT_CONTEXT),
            ],
            vec![("group", "after")],
        );
        let pg = ProcessGraph::from_definition(&def).unwrap();
        let instance = Uuid::new_v4();
        let run = TaskProducer::new(&def, &pg).produce(instance).unwrap();
        let group = run.records.iter().find(|r| r.process_code == "group").unwrap().id;
        let after = run.records.iter().find(|r| r.process_code == "after").unwrap().id;

        let mut graph = run.graph.clone();
        let children =
            expand_internal(&mut graph, instance, group, &[("dyn".into(), "{}".into())]).unwrap();
        let child = children[0].id;
        assert!(
            graph.direct_ancestors(after).contains(&child),
            "downstream tasks must wait for the expanded batch"
        );
    }

    #[test]
    fn external_group_owner_is_structural_error() {
        let def = pipeline(
            vec![
                process("group", ProcessKind::External, ROOT_CONTEXT),
                process("inner", ProcessKind::External, "1,2#1"),
            ],
            vec![("group", "inner")],
        );
        let pg = ProcessGraph::from_definition(&def).unwrap();
        let err = TaskProducer::new(&def, &pg).produce(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, EngineError::Structural(_)));
    }

    #[test]
    fn fan_out_children_wire_to_all_parent_tasks() {
        let def = pipeline(
            vec![
                process("a", ProcessKind::External, ROOT_CONTEXT),
                process("b", ProcessKind::External, ROOT_CONTEXT),
                process("c", ProcessKind::External, ROOT_CONTEXT),
                process("d", ProcessKind::External, ROOT_CONTEXT),
            ],
            vec![("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let pg = ProcessGraph::from_definition(&def).unwrap();
        let run = TaskProducer::new(&def, &pg).produce(Uuid::new_v4()).unwrap();

        let task_of = |code: &str| {
            run.records
                .iter()
                .find(|r| r.process_code == code)
                .map(|r| r.id)
                .unwrap()
        };
        let mut parents = run.graph.direct_ancestors(task_of("d"));
        let mut expected = vec![task_of("b"), task_of("c")];
        parents.sort();
        expected.sort();
        assert_eq!(parents, expected);
    }

    #[test]
    fn caching_process_record_starts_in_check_cache() {
        let mut caching = process("a", ProcessKind::External, ROOT_CONTEXT);
        caching.caching = true;
        let def = pipeline(vec![caching], vec![]);
        let pg = ProcessGraph::from_definition(&def).unwrap();
        let run = TaskProducer::new(&def, &pg).produce(Uuid::new_v4()).unwrap();
        let a = run.records.iter().find(|r| r.process_code == "a").unwrap();
        assert_eq!(a.exec_state, ExecState::CheckCache);
        // the graph vertex stays None so dependency evaluation still sees it
        assert_eq!(run.graph.state_of(a.id), Some(ExecState::None));
    }

    #[test]
    fn unknown_process_aborts_with_no_partial_output() {
        // "x" appears in the graph but not among the definitions.
        let mut def = pipeline(
            vec![
                process("a", ProcessKind::External, ROOT_CONTEXT),
                process("x", ProcessKind::External, ROOT_CONTEXT),
            ],
            vec![("a", "x")],
        );
        let pg = ProcessGraph::from_definition(&def).unwrap();
        def.processes.retain(|p| p.code != "x");
        let err = TaskProducer::new(&def, &pg).produce(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, EngineError::ProcessNotFound(_)));
    }

    #[test]
    fn expand_internal_splices_below_parent() {
        let def = pipeline(vec![process("a", ProcessKind::Internal, ROOT_CONTEXT)], vec![]);
        let pg = ProcessGraph::from_definition(&def).unwrap();
        let instance = Uuid::new_v4();
        let run = TaskProducer::new(&def, &pg).produce(instance).unwrap();
        let parent = run.records.iter().find(|r| r.process_code == "a").unwrap().id;

        let mut graph = run.graph.clone();
        let children = expand_internal(
            &mut graph,
            instance,
            parent,
            &[("child1".into(), "{}".into()), ("child2".into(), "{}".into())],
        )
        .unwrap();
        assert_eq!(children.len(), 2);
        for child in &children {
            assert_eq!(graph.direct_ancestors(child.id), vec![parent]);
        }
    }
}
