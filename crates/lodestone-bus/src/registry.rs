//! Named bus-adapter registry.
//!
//! Adapter selection is a configuration choice, not a runtime probe: each
//! adapter registers a factory under a stable name, and the application
//! asks the registry to build the kind its configuration names. The
//! `in-memory` adapter ships with the core; transport adapters (e.g.
//! `nats`) register themselves from their own crates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::BusError;
use crate::memory::InMemoryBus;
use crate::port::MessageBus;

/// Options handed to a bus factory.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Transport URL; interpretation is adapter-specific.
    pub url: String,
    /// KV bucket used by the coordination core.
    pub bucket: String,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            bucket: "service-registry".to_string(),
        }
    }
}

/// Errors from building a bus out of the registry.
#[derive(Debug, Error)]
pub enum BusBuildError {
    /// No factory is registered under the requested name.
    #[error("unknown bus kind: {0:?}")]
    UnknownKind(String),

    /// The factory failed to connect.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Constructs a concrete [`MessageBus`] from options.
#[async_trait]
pub trait BusFactory: Send + Sync {
    /// Stable adapter name used for registry lookup.
    fn kind(&self) -> &'static str;

    /// Builds and connects the bus.
    async fn build(&self, options: &BusOptions) -> Result<Arc<dyn MessageBus>, BusError>;
}

/// Registry of named bus factories.
pub struct BusRegistry {
    factories: HashMap<&'static str, Arc<dyn BusFactory>>,
}

impl BusRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Creates a registry with the built-in adapters registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(InMemoryFactory));
        registry
    }

    /// Registers a factory; a later registration under the same name wins.
    pub fn register(&mut self, factory: Arc<dyn BusFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    /// Names of all registered adapters.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Builds the named bus kind.
    pub async fn build(
        &self,
        kind: &str,
        options: &BusOptions,
    ) -> Result<Arc<dyn MessageBus>, BusBuildError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| BusBuildError::UnknownKind(kind.to_string()))?;
        Ok(factory.build(options).await?)
    }
}

impl Default for BusRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

struct InMemoryFactory;

#[async_trait]
impl BusFactory for InMemoryFactory {
    fn kind(&self) -> &'static str {
        "in-memory"
    }

    async fn build(&self, _options: &BusOptions) -> Result<Arc<dyn MessageBus>, BusError> {
        Ok(Arc::new(InMemoryBus::new()))
    }
}
