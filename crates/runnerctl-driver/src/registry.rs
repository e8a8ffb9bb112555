use std::collections::HashMap;
use std::sync::Arc;

use runnerctl_domain::CloudProvider;

use crate::driver::Driver;
use crate::error::DriverError;

/// Dispatches driver calls to the correct provider-specific [`Driver`]
/// implementation, keyed by `CloudConnector.provider` (§4.8: "implementations
/// for specific providers plug in via a registry keyed by provider").
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<CloudProvider, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self { drivers: HashMap::new() }
    }

    /// Register a driver for a provider. Returns `&mut self` for chaining.
    pub fn register(&mut self, provider: CloudProvider, driver: Arc<dyn Driver>) -> &mut Self {
        self.drivers.insert(provider, driver);
        self
    }

    pub fn for_provider(&self, provider: CloudProvider) -> Result<Arc<dyn Driver>, DriverError> {
        self.drivers
            .get(&provider)
            .cloned()
            .ok_or(DriverError::DriverNotConfigured(provider))
    }

    pub fn active_providers(&self) -> Vec<CloudProvider> {
        self.drivers.keys().copied().collect()
    }
}
