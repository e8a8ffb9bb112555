use thiserror::Error;

/// Aggregates every lower-crate error the orchestration core can surface —
/// domain, store, driver, events and crypto failures — behind one
/// `#[from]`-derived enum.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Domain(#[from] runnerctl_domain::DomainError),

    #[error(transparent)]
    Store(#[from] runnerctl_store::StoreError),

    #[error(transparent)]
    Driver(#[from] runnerctl_driver::DriverError),

    #[error(transparent)]
    Events(#[from] runnerctl_events::EventsError),

    #[error(transparent)]
    Crypto(#[from] runnerctl_crypto::CryptoError),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("script failed: {0}")]
    ScriptFailed(String),

    #[error("timed out waiting for runner to become ready")]
    AllocationTimeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the failure should be retried internally rather than
    /// surfaced to the caller (§7 `CLOUD_TRANSIENT`).
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Driver(e) if e.is_transient())
    }
}
