use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::runtime::model::ExecState;

/// One task in the dynamic per-run graph. Identity is the task id alone:
/// the same logical vertex is decoded repeatedly from the persisted blob,
/// so object identity means nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskVertex {
    pub task_id: Uuid,
    pub state: ExecState,
}

impl PartialEq for TaskVertex {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}

impl Eq for TaskVertex {}

impl Hash for TaskVertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.task_id.hash(state);
    }
}

/// A vertex to splice into the graph, wired below the given parents.
#[derive(Debug, Clone)]
pub struct NewVertex {
    pub task_id: Uuid,
    pub state: ExecState,
    pub parents: Vec<Uuid>,
}

/// Persisted form: plain vertex and edge lists, decoupled from any
/// in-memory layout.
#[derive(Serialize, Deserialize)]
struct TaskGraphBlob {
    vertices: Vec<TaskVertex>,
    edges: Vec<(Uuid, Uuid)>,
}

/// The dynamic DAG of tasks for one workflow instance. Mutated only under
/// the instance's exclusive lock, through load-mutate-store on the encoded
/// blob.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    states: HashMap<Uuid, ExecState>,
    parents: HashMap<Uuid, Vec<Uuid>>,
    children: HashMap<Uuid, Vec<Uuid>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&self) -> Result<String> {
        let mut edges = Vec::new();
        for (child, parents) in &self.parents {
            for parent in parents {
                edges.push((*parent, *child));
            }
        }
        let blob = TaskGraphBlob {
            vertices: self
                .states
                .iter()
                .map(|(&task_id, &state)| TaskVertex { task_id, state })
                .collect(),
            edges,
        };
        Ok(serde_json::to_string(&blob)?)
    }

    /// Decode a persisted graph. A failure here is a per-call error: the
    /// previously stored blob stays untouched.
    pub fn decode(raw: &str) -> Result<Self> {
        let blob: TaskGraphBlob = serde_json::from_str(raw)?;
        let mut graph = Self::new();
        for vertex in blob.vertices {
            graph.states.insert(vertex.task_id, vertex.state);
        }
        for (parent, child) in blob.edges {
            if !graph.states.contains_key(&parent) || !graph.states.contains_key(&child) {
                return Err(EngineError::Codec(format!(
                    "edge {} -> {} references a missing vertex",
                    parent, child
                )));
            }
            graph.parents.entry(child).or_default().push(parent);
            graph.children.entry(parent).or_default().push(child);
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn contains(&self, task_id: Uuid) -> bool {
        self.states.contains_key(&task_id)
    }

    pub fn state_of(&self, task_id: Uuid) -> Option<ExecState> {
        self.states.get(&task_id).copied()
    }

    pub fn vertices(&self) -> Vec<TaskVertex> {
        self.states
            .iter()
            .map(|(&task_id, &state)| TaskVertex { task_id, state })
            .collect()
    }

    pub fn edges(&self) -> Vec<(Uuid, Uuid)> {
        let mut out = Vec::new();
        for (child, parents) in &self.parents {
            for parent in parents {
                out.push((*parent, *child));
            }
        }
        out
    }

    /// Vertices with no outgoing edge. The produced graph always ends in
    /// exactly one: the finish vertex.
    pub fn leaves(&self) -> Vec<TaskVertex> {
        self.states
            .iter()
            .filter(|(id, _)| self.children.get(*id).map_or(true, |c| c.is_empty()))
            .map(|(&task_id, &state)| TaskVertex { task_id, state })
            .collect()
    }

    pub fn direct_ancestors(&self, task_id: Uuid) -> Vec<Uuid> {
        self.parents.get(&task_id).cloned().unwrap_or_default()
    }

    pub fn direct_descendants(&self, task_id: Uuid) -> Vec<Uuid> {
        self.children.get(&task_id).cloned().unwrap_or_default()
    }

    pub fn descendants(&self, task_id: Uuid) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Uuid> = self.direct_descendants(task_id).into();
        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            queue.extend(self.direct_descendants(id));
        }
        out
    }

    /// Roots: vertices with no incoming edge.
    pub fn roots(&self) -> Vec<Uuid> {
        self.states
            .keys()
            .filter(|id| self.parents.get(*id).map_or(true, |p| p.is_empty()))
            .copied()
            .collect()
    }

    /// Append one vertex below the given parents. Edges only ever point
    /// from existing vertices to the new one, so no cycle can appear.
    pub fn add_vertex(&mut self, task_id: Uuid, state: ExecState, parent_ids: &[Uuid]) -> Result<()> {
        if self.states.contains_key(&task_id) {
            return Err(EngineError::Structural(format!(
                "task {} is already in the graph",
                task_id
            )));
        }
        for parent in parent_ids {
            if !self.states.contains_key(parent) {
                return Err(EngineError::Structural(format!(
                    "parent task {} is not in the graph",
                    parent
                )));
            }
        }
        self.states.insert(task_id, state);
        for &parent in parent_ids {
            self.parents.entry(task_id).or_default().push(parent);
            self.children.entry(parent).or_default().push(task_id);
        }
        Ok(())
    }

    /// Splice a batch of vertices (internal-step dynamic expansion).
    /// Batch-internal parent references are allowed in declaration order.
    pub fn add_vertices(&mut self, batch: &[NewVertex]) -> Result<()> {
        for v in batch {
            self.add_vertex(v.task_id, v.state, &v.parents)?;
        }
        Ok(())
    }

    /// Add one edge between existing vertices. Only safe for splicing a
    /// freshly added vertex above an existing child; the caller guarantees
    /// the parent is not reachable from the child.
    pub fn link(&mut self, parent: Uuid, child: Uuid) -> Result<()> {
        for id in [parent, child] {
            if !self.states.contains_key(&id) {
                return Err(EngineError::TaskNotFound(id));
            }
        }
        let parents = self.parents.entry(child).or_default();
        if !parents.contains(&parent) {
            parents.push(parent);
        }
        let children = self.children.entry(parent).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
        Ok(())
    }

    /// Set one vertex's state and apply the cascade rule. Returns every
    /// (task, state) pair that changed, the triggering vertex included.
    ///
    /// Cascade: a failure (Error/Broken) marks all descendants Broken,
    /// sparing vertices with no outgoing edges (the terminal finish node);
    /// a success resets every descendant to None so it becomes eligible
    /// again.
    pub fn set_state(&mut self, task_id: Uuid, state: ExecState) -> Result<Vec<(Uuid, ExecState)>> {
        if !self.states.contains_key(&task_id) {
            return Err(EngineError::TaskNotFound(task_id));
        }
        let mut changed = Vec::new();
        self.states.insert(task_id, state);
        changed.push((task_id, state));

        if state.is_failure() {
            self.cascade_broken(task_id, &mut changed);
        } else if state.is_success() {
            self.cascade_reset(task_id, &mut changed);
        }
        Ok(changed)
    }

    /// Bulk form of `set_state`, the same cascade per changed vertex.
    pub fn set_states(&mut self, updates: &[(Uuid, ExecState)]) -> Result<Vec<(Uuid, ExecState)>> {
        let mut changed = Vec::new();
        for &(task_id, state) in updates {
            changed.extend(self.set_state(task_id, state)?);
        }
        Ok(changed)
    }

    fn is_leaf(&self, task_id: Uuid) -> bool {
        self.children.get(&task_id).map_or(true, |c| c.is_empty())
    }

    fn cascade_broken(&mut self, from: Uuid, changed: &mut Vec<(Uuid, ExecState)>) {
        for child in self.direct_descendants(from) {
            if self.is_leaf(child) {
                // Terminal finish node, left alone so the run can close out.
                continue;
            }
            if self.states.get(&child) != Some(&ExecState::Broken) {
                self.states.insert(child, ExecState::Broken);
                changed.push((child, ExecState::Broken));
            }
            self.cascade_broken(child, changed);
        }
    }

    fn cascade_reset(&mut self, from: Uuid, changed: &mut Vec<(Uuid, ExecState)>) {
        for child in self.direct_descendants(from) {
            if self.states.get(&child) != Some(&ExecState::None) {
                self.states.insert(child, ExecState::None);
                changed.push((child, ExecState::None));
            }
            self.cascade_reset(child, changed);
        }
    }

    /// Vertices eligible for assignment.
    ///
    /// Cold-start fast path: a single root in state None is returned alone.
    /// Otherwise: every None vertex all of whose direct ancestors finished
    /// successfully. One pending ancestor blocks the vertex: strict AND
    /// over direct parents, not transitive.
    pub fn assignable(&self) -> Vec<TaskVertex> {
        let roots = self.roots();
        if roots.len() == 1 {
            let root = roots[0];
            if self.states.get(&root) == Some(&ExecState::None) {
                return vec![TaskVertex { task_id: root, state: ExecState::None }];
            }
        }

        self.states
            .iter()
            .filter(|&(_, &state)| state == ExecState::None)
            .filter(|&(id, _)| {
                self.direct_ancestors(*id)
                    .iter()
                    .all(|p| self.states.get(p).is_some_and(|s| s.is_success()))
            })
            .map(|(&task_id, &state)| TaskVertex { task_id, state })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (TaskGraph, Uuid, Uuid, Uuid, Uuid) {
        // a -> {b, c} -> d
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut g = TaskGraph::new();
        g.add_vertex(a, ExecState::None, &[]).unwrap();
        g.add_vertex(b, ExecState::None, &[a]).unwrap();
        g.add_vertex(c, ExecState::None, &[a]).unwrap();
        g.add_vertex(d, ExecState::None, &[b, c]).unwrap();
        (g, a, b, c, d)
    }

    #[test]
    fn single_root_fast_path() {
        let (g, a, ..) = diamond();
        let eligible = g.assignable();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].task_id, a);
    }

    #[test]
    fn fan_out_then_strict_and_fan_in() {
        let (mut g, a, b, c, d) = diamond();
        g.set_state(a, ExecState::Ok).unwrap();
        let eligible: HashSet<Uuid> = g.assignable().iter().map(|v| v.task_id).collect();
        assert_eq!(eligible, HashSet::from([b, c]));

        g.set_state(b, ExecState::Ok).unwrap();
        // d still blocked: c is pending
        assert!(!g.assignable().iter().any(|v| v.task_id == d));

        g.set_state(c, ExecState::Ok).unwrap();
        let eligible: Vec<Uuid> = g.assignable().iter().map(|v| v.task_id).collect();
        assert_eq!(eligible, vec![d]);
    }

    #[test]
    fn failure_cascades_broken_but_spares_finish_leaf() {
        let (mut g, a, b, c, d) = diamond();
        g.set_state(a, ExecState::Ok).unwrap();
        let changed = g.set_state(b, ExecState::Error).unwrap();
        assert!(changed.contains(&(b, ExecState::Error)));
        // d is the leaf finish node: untouched
        assert_eq!(g.state_of(d), Some(ExecState::None));
        assert_eq!(g.state_of(c), Some(ExecState::None));
        // but d never becomes eligible (parent b failed)
        assert!(!g.assignable().iter().any(|v| v.task_id == d));
    }

    #[test]
    fn failure_cascades_broken_through_interior_vertices() {
        // a -> b -> c -> d: failing a breaks b and c, spares leaf d
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut g = TaskGraph::new();
        g.add_vertex(a, ExecState::None, &[]).unwrap();
        g.add_vertex(b, ExecState::None, &[a]).unwrap();
        g.add_vertex(c, ExecState::None, &[b]).unwrap();
        g.add_vertex(d, ExecState::None, &[c]).unwrap();

        g.set_state(a, ExecState::Error).unwrap();
        assert_eq!(g.state_of(b), Some(ExecState::Broken));
        assert_eq!(g.state_of(c), Some(ExecState::Broken));
        assert_eq!(g.state_of(d), Some(ExecState::None));
        assert!(g.assignable().is_empty());
    }

    #[test]
    fn success_resets_descendants_to_none() {
        let (mut g, a, b, c, d) = diamond();
        g.set_state(a, ExecState::Ok).unwrap();
        g.set_state(b, ExecState::Ok).unwrap();
        g.set_state(c, ExecState::Ok).unwrap();
        g.set_state(d, ExecState::Ok).unwrap();

        // Re-running a makes the whole downstream eligible again.
        let changed = g.set_state(a, ExecState::Ok).unwrap();
        assert!(changed.contains(&(b, ExecState::None)));
        assert!(changed.contains(&(d, ExecState::None)));
        assert_eq!(g.state_of(b), Some(ExecState::None));
        assert_eq!(g.state_of(c), Some(ExecState::None));
        assert_eq!(g.state_of(d), Some(ExecState::None));
    }

    #[test]
    fn encode_decode_round_trip() {
        let (mut g, a, ..) = diamond();
        g.set_state(a, ExecState::Ok).unwrap();
        let raw = g.encode().unwrap();
        let decoded = TaskGraph::decode(&raw).unwrap();
        assert_eq!(decoded.len(), g.len());
        let mut e1 = g.edges();
        let mut e2 = decoded.edges();
        e1.sort();
        e2.sort();
        assert_eq!(e1, e2);
        for v in g.vertices() {
            assert_eq!(decoded.state_of(v.task_id), Some(v.state));
        }
    }

    #[test]
    fn decode_rejects_dangling_edge() {
        let raw = format!(
            r#"{{"vertices":[{{"task_id":"{}","state":"NONE"}}],"edges":[["{}","{}"]]}}"#,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        assert!(matches!(TaskGraph::decode(&raw), Err(EngineError::Codec(_))));
    }

    #[test]
    fn duplicate_vertex_is_structural() {
        let a = Uuid::new_v4();
        let mut g = TaskGraph::new();
        g.add_vertex(a, ExecState::None, &[]).unwrap();
        assert!(matches!(
            g.add_vertex(a, ExecState::None, &[]),
            Err(EngineError::Structural(_))
        ));
    }

    #[test]
    fn vertex_equality_is_by_task_id() {
        let id = Uuid::new_v4();
        let v1 = TaskVertex { task_id: id, state: ExecState::None };
        let v2 = TaskVertex { task_id: id, state: ExecState::Ok };
        assert_eq!(v1, v2);
    }
}
