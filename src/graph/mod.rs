pub mod process;
pub mod task_graph;
