//! The orchestration engine's shared handle: every pipeline (allocator,
//! readiness, termination, pool controller, expiry reaper) is a method or
//! free function that takes an `&Engine`, threading a single
//! `Arc<dyn RunnerStore>` + `Arc<DriverRegistry>` pair through each call.

use std::sync::Arc;
use std::time::Duration;

use runnerctl_driver::DriverRegistry;
use runnerctl_events::EventBus;
use runnerctl_store::RunnerStore;

use crate::locks::RunnerLocks;

/// Tunables pulled from `runnerctl_config::ProcessConfig` (§6). Kept as a
/// plain struct rather than depending on `runnerctl-config` directly so the
/// reconciler stays testable with hand-built values.
#[derive(Clone)]
pub struct EngineConfig {
    pub max_runner_lifetime_minutes: i64,
    pub idle_pool_minutes: i64,
    pub prometheus_pushgateway_url: Option<String>,
    /// Bound on the Allocator's cold-launch wait (§5 "Cancellation"); default 10 min.
    pub allocate_wait_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_runner_lifetime_minutes: 180,
            idle_pool_minutes: 10,
            prometheus_pushgateway_url: None,
            allocate_wait_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    pub store: Arc<dyn RunnerStore>,
    pub registry: Arc<DriverRegistry>,
    pub bus: EventBus,
    pub encryption_key: runnerctl_crypto::EncryptionKey,
    pub locks: RunnerLocks,
    pub config: EngineConfig,
    pub http: reqwest::Client,
}

impl Engine {
    pub fn new(
        store: Arc<dyn RunnerStore>,
        registry: Arc<DriverRegistry>,
        encryption_key: runnerctl_crypto::EncryptionKey,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            bus: EventBus::new(),
            encryption_key,
            locks: RunnerLocks::new(),
            config,
            http: reqwest::Client::new(),
        }
    }
}
