use std::sync::Arc;

use runnerctl_reconciler::Engine;

/// Axum-shared state: the orchestration engine plus the bearer token the
/// auth middleware checks incoming requests against.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub auth_token: Arc<String>,
}
