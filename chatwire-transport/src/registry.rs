// ABOUTME: Name-keyed transport factories for picking a socket backend at runtime.
// ABOUTME: Names are matched case-insensitively; unknown names report what is registered.

use crate::handle::TransportHandle;
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Builds a transport from backend-specific JSON options
pub type TransportFactory = Box<dyn Fn(&Value) -> Result<TransportHandle> + Send + Sync>;

/// Transport backends known to a session, keyed by normalized name
pub struct TransportRegistry {
    factories: BTreeMap<String, TransportFactory>,
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register a factory; a later registration under the same name replaces the earlier one
    pub fn register<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(&Value) -> Result<TransportHandle> + Send + Sync + 'static,
    {
        if self.factories.insert(normalize(name), Box::new(factory)).is_some() {
            tracing::debug!(transport = name, "Replaced transport factory");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize(name))
    }

    /// Create a transport by name, as written in `network.transport`
    pub fn create(&self, name: &str, options: &Value) -> Result<TransportHandle> {
        let factory = self.factories.get(&normalize(name)).ok_or_else(|| {
            anyhow!(
                "Unknown transport: {} (available: {})",
                name,
                self.available().join(", ")
            )
        })?;
        let handle = factory(options)?;
        tracing::debug!(transport = handle.name(), "Created transport");
        Ok(handle)
    }

    /// Registered names in sorted order
    pub fn available(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        use crate::backends::mock::MockTransport;

        Self::new().register("mock", MockTransport::factory())
    }
}
