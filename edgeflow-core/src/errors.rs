use std::time::Duration;

use thiserror::Error;

use crate::types::CheckpointId;

/// Error taxonomy of the runtime.
///
/// Fallible APIs return `anyhow::Result`; callers that care about the
/// category can `downcast_ref::<EngineError>()`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid window or rule configuration, fatal at construction.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A source could not emit its barrier.
    #[error("failed to trigger checkpoint {checkpoint_id} on task {task}: {reason}")]
    Trigger {
        checkpoint_id: CheckpointId,
        task: String,
        reason: String,
    },

    /// Not every task acknowledged the checkpoint in time.
    #[error("checkpoint {0} was not acknowledged within {1:?}")]
    Timeout(CheckpointId, Duration),

    #[error("storage error: {0}")]
    Storage(String),

    /// An operator received a payload it cannot handle.
    #[error("operator {operator} expects a tuple but got a {found}")]
    RuntimeType {
        operator: String,
        found: &'static str,
    },
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        EngineError::Storage(msg.into())
    }
}
