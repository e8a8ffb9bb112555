use thiserror::Error;

use crate::types::RunnerState;

/// Machine-readable error kinds per the orchestration engine's error taxonomy (§7).
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("illegal transition: {from} does not accept {event}")]
    IllegalTransition { from: RunnerState, event: String },

    #[error("concurrency conflict claiming {0}")]
    ConcurrencyConflict(String),

    #[error("invalid id: {0}")]
    InvalidId(String),
}

pub type DomainResult<T> = Result<T, DomainError>;
