use runnerctl_domain::CloudProvider;
use thiserror::Error;

/// Cloud Driver error taxonomy (§4.8, §7). Distinguishes terminal
/// authentication failures from the transient/not-found/permission classes
/// a retrying caller needs to tell apart.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("cloud operation failed: {0}")]
    OperationFailed(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("transient cloud error, retry: {0}")]
    Transient(String),

    #[error("cloud authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("ssh script execution failed (exit {exit_code}): {stderr}")]
    ScriptFailed { exit_code: i32, stderr: String },

    #[error("internal driver error: {0}")]
    Internal(String),

    #[error("no driver registered for provider: {0}")]
    DriverNotConfigured(CloudProvider),
}

impl DriverError {
    /// Whether a caller should retry this error with backoff (§7
    /// `CLOUD_TRANSIENT`). Auth and permission failures are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }

    pub fn is_terminal_for_connector(&self) -> bool {
        matches!(self, DriverError::Auth(_))
    }
}
