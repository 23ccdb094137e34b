pub mod config;
pub mod definition;
pub mod error;
pub mod graph;
pub mod runtime;

pub use error::{EngineError, Result};
