use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed pipeline or graph. Aborts the operation with no partial commit.
    #[error("Structural error: {0}")]
    Structural(String),

    /// A mutation was attempted without the required exclusive lock.
    /// This is a programming error in the caller, never retried.
    #[error("Lock contract violation: {0}")]
    LockContract(String),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Optimistic-version clash on a durable record. Callers retry the
    /// read-modify-write loop transparently.
    #[error("Write conflict on {kind} {id}")]
    Conflict { kind: &'static str, id: Uuid },

    #[error("Graph codec error: {0}")]
    Codec(String),

    #[error("Event channel closed")]
    QueueClosed,

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Codec(e.to_string())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
