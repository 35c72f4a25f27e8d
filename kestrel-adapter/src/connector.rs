//! Compile-time connector registry keyed by driver name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::{AdapterEventSender, AdapterResult, BrokerAdapter};

/// Factory contract used to construct broker adapters from configuration.
pub trait ConnectorFactory: Send + Sync {
    /// Driver identifier referenced by `broker.driver` in the configuration.
    fn driver(&self) -> &'static str;

    /// Build an adapter instance. `params` carries the driver-specific
    /// configuration untouched; `events` is the channel toward the engine.
    fn build(
        &self,
        params: &serde_json::Value,
        events: AdapterEventSender,
    ) -> AdapterResult<Box<dyn BrokerAdapter>>;
}

static CONNECTOR_REGISTRY: Lazy<RwLock<HashMap<&'static str, Arc<dyn ConnectorFactory>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a connector factory. Called from each connector's init hook.
pub fn register_connector_factory(factory: Arc<dyn ConnectorFactory>) {
    let mut registry = CONNECTOR_REGISTRY.write().expect("registry poisoned");
    let driver = factory.driver();
    if registry.insert(driver, factory).is_some() {
        tracing::warn!(driver, "duplicate connector registration; overriding previous factory");
    }
}

/// Look up a factory by driver name.
pub fn get_connector_factory(driver: &str) -> Option<Arc<dyn ConnectorFactory>> {
    let registry = CONNECTOR_REGISTRY.read().expect("registry poisoned");
    registry.get(driver).cloned()
}

/// Sorted list of registered driver names.
pub fn registered_connectors() -> Vec<&'static str> {
    let registry = CONNECTOR_REGISTRY.read().expect("registry poisoned");
    let mut names: Vec<&'static str> = registry.keys().copied().collect();
    names.sort_unstable();
    names
}
