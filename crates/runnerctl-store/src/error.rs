use runnerctl_domain::RunnerState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("runner not found: {0}")]
    RunnerNotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("security group not found: {0}")]
    SecurityGroupNotFound(String),

    /// The conditional update's expected-state precondition did not hold —
    /// another writer won the race (§5 "Pool-allocation race",
    /// §7 `CONCURRENCY_CONFLICT`).
    #[error("concurrency conflict: runner {id} was not in state {expected} when updated")]
    Conflict { id: String, expected: RunnerState },

    /// `UNIQUE(key_date, cloud_connector_id)` violated (§3 Key).
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
