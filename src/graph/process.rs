use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::definition::{
    DependencyDecl, FINISH_PROCESS_CODE, PipelineDefinition, ROOT_CONTEXT,
};
use crate::error::{EngineError, Result};

/// One declared step in the static pipeline graph. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessVertex {
    /// Vertex id. Equals the process code for statically declared steps.
    pub id: String,
    pub process_code: String,
    /// Hierarchical nesting context ("1" is top level, "1,2#3" a sub-group).
    pub context_id: String,
}

impl ProcessVertex {
    pub fn is_top_level(&self) -> bool {
        self.context_id == ROOT_CONTEXT
    }
}

/// `parent` context strictly encloses `child` context.
pub fn is_enclosing_context(parent: &str, child: &str) -> bool {
    child.len() > parent.len() && child.starts_with(parent)
}

/// The static DAG of declared processes, built once per workflow instance.
#[derive(Debug)]
pub struct ProcessGraph {
    graph: DiGraph<ProcessVertex, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl ProcessGraph {
    /// Build and validate the graph from a pipeline definition. When the
    /// definition carries no terminal step, an implicit `finish` vertex is
    /// wired downstream of every leaf.
    pub fn from_definition(def: &PipelineDefinition) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for process in &def.processes {
            if process.code.trim().is_empty() {
                return Err(EngineError::Structural(format!(
                    "Pipeline {}: process with empty code",
                    def.id
                )));
            }
            if process.context.trim().is_empty() {
                return Err(EngineError::Structural(format!(
                    "Pipeline {}: process {} has an empty context id",
                    def.id, process.code
                )));
            }
            let vertex = ProcessVertex {
                id: process.code.clone(),
                process_code: process.code.clone(),
                context_id: process.context.clone(),
            };
            let idx = graph.add_node(vertex);
            if indices.insert(process.code.clone(), idx).is_some() {
                return Err(EngineError::Structural(format!(
                    "Pipeline {}: duplicate process code {}",
                    def.id, process.code
                )));
            }
        }

        for DependencyDecl { source, target } in &def.dependencies {
            let from = *indices.get(source).ok_or_else(|| {
                EngineError::Structural(format!(
                    "Pipeline {}: dependency references unknown process {}",
                    def.id, source
                ))
            })?;
            let to = *indices.get(target).ok_or_else(|| {
                EngineError::Structural(format!(
                    "Pipeline {}: dependency references unknown process {}",
                    def.id, target
                ))
            })?;
            graph.add_edge(from, to, ());
        }

        let mut pg = Self { graph, indices };

        if !pg.indices.contains_key(FINISH_PROCESS_CODE) {
            pg.append_implicit_finish();
        }

        // Cycle check doubles as the topological-order validation.
        toposort(&pg.graph, None).map_err(|cycle| {
            EngineError::Structural(format!(
                "Pipeline {}: dependency cycle through process {}",
                def.id,
                pg.graph[cycle.node_id()].process_code
            ))
        })?;

        Ok(pg)
    }

    fn append_implicit_finish(&mut self) {
        let leaves: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .collect();

        let finish = self.graph.add_node(ProcessVertex {
            id: FINISH_PROCESS_CODE.to_string(),
            process_code: FINISH_PROCESS_CODE.to_string(),
            context_id: ROOT_CONTEXT.to_string(),
        });
        self.indices.insert(FINISH_PROCESS_CODE.to_string(), finish);

        for leaf in leaves {
            self.graph.add_edge(leaf, finish, ());
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.indices.contains_key(id)
    }

    pub fn vertex(&self, id: &str) -> Option<&ProcessVertex> {
        self.indices.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Vertices in dependency order. The graph was cycle-checked at build
    /// time, so this cannot fail afterwards.
    pub fn topo_order(&self) -> Vec<&ProcessVertex> {
        let sorted = toposort(&self.graph, None)
            .unwrap_or_else(|_| self.graph.node_indices().collect());
        sorted.into_iter().map(|idx| &self.graph[idx]).collect()
    }

    pub fn direct_parents(&self, id: &str) -> Vec<&ProcessVertex> {
        self.neighbors_of(id, Direction::Incoming)
    }

    pub fn direct_children(&self, id: &str) -> Vec<&ProcessVertex> {
        self.neighbors_of(id, Direction::Outgoing)
    }

    fn neighbors_of(&self, id: &str, dir: Direction) -> Vec<&ProcessVertex> {
        let Some(&idx) = self.indices.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, dir)
            .map(|n| &self.graph[n])
            .collect()
    }

    /// Transitive ancestors of a vertex.
    pub fn ancestors(&self, id: &str) -> Vec<&ProcessVertex> {
        self.walk(id, Direction::Incoming)
    }

    /// Transitive descendants of a vertex.
    pub fn descendants(&self, id: &str) -> Vec<&ProcessVertex> {
        self.walk(id, Direction::Outgoing)
    }

    fn walk(&self, id: &str, dir: Direction) -> Vec<&ProcessVertex> {
        let Some(&start) = self.indices.get(id) else {
            return Vec::new();
        };
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = self.graph.neighbors_directed(start, dir).collect();
        let mut out = Vec::new();
        while let Some(idx) = queue.pop_front() {
            if !seen.insert(idx) {
                continue;
            }
            out.push(&self.graph[idx]);
            queue.extend(self.graph.neighbors_directed(idx, dir));
        }
        out
    }

    /// Ancestors whose context strictly encloses this vertex's context:
    /// the chain of group owners up to the top-level boundary. A non-empty
    /// result means the vertex lives inside a nested construct.
    pub fn enclosing_ancestors(&self, id: &str) -> Vec<&ProcessVertex> {
        let Some(vertex) = self.vertex(id) else {
            return Vec::new();
        };
        self.ancestors(id)
            .into_iter()
            .filter(|a| is_enclosing_context(&a.context_id, &vertex.context_id))
            .collect()
    }

    /// Steps with no outgoing edge. After build there is exactly one when
    /// the implicit finish was synthesized.
    pub fn leaves(&self) -> Vec<&ProcessVertex> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }
}
