pub mod loader;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Process code of the implicit terminal step. When a pipeline definition
/// omits it, the producer synthesizes it as the single leaf of the run.
/// This is a documented convention, not a hidden special case.
pub const FINISH_PROCESS_CODE: &str = "finish";

/// Root token of the nesting-context hierarchy. A process whose context id
/// equals this token belongs to the top level of the pipeline.
pub const ROOT_CONTEXT: &str = "1";

/// A declared pipeline: the static description one run is expanded from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub processes: Vec<ProcessDefinition>,
    #[serde(default)]
    pub dependencies: Vec<DependencyDecl>,
}

/// How a process is executed: by a remote worker, or expanded by the
/// dispatcher itself at runtime (meta/control steps).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    External,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefinition {
    /// Unique process code within one pipeline (e.g. "extract", "train").
    pub code: String,
    #[serde(default = "ProcessDefinition::default_kind")]
    pub kind: ProcessKind,
    /// Hierarchical nesting context, e.g. "1" (top level) or "1,2#3".
    #[serde(default = "ProcessDefinition::default_context")]
    pub context: String,
    /// Whether results of this process may be served from the cache.
    #[serde(default)]
    pub caching: bool,
    /// Maximum attempts before a transient failure becomes permanent.
    #[serde(default = "ProcessDefinition::default_max_tries")]
    pub max_tries: u32,
    /// Declared execution timeout in seconds. Capped by the engine ceiling.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Opaque parameters handed to the worker as a JSON blob.
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

impl ProcessDefinition {
    fn default_kind() -> ProcessKind {
        ProcessKind::External
    }

    fn default_context() -> String {
        ROOT_CONTEXT.to_string()
    }

    fn default_max_tries() -> u32 {
        1
    }

    /// The synthesized terminal step used when the definition omits one.
    pub fn implicit_finish() -> Self {
        Self {
            code: FINISH_PROCESS_CODE.to_string(),
            kind: ProcessKind::External,
            context: ROOT_CONTEXT.to_string(),
            caching: false,
            max_tries: 1,
            timeout_secs: None,
            params: HashMap::new(),
        }
    }
}

/// "source must complete before target starts".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyDecl {
    pub source: String,
    pub target: String,
}

impl PipelineDefinition {
    pub fn process(&self, code: &str) -> Option<&ProcessDefinition> {
        self.processes.iter().find(|p| p.code == code)
    }

    pub fn has_process(&self, code: &str) -> bool {
        self.process(code).is_some()
    }
}
