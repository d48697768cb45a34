//! # lodestone-registry: Service instance registry
//!
//! Every live instance keeps one entry in the `service-registry` bucket,
//! written with a per-message TTL of `heartbeat_interval × k`. Instances
//! that stop heartbeating vanish from the bucket on their own; nobody ever
//! reaps entries by comparing timestamps (clock skew makes timestamp
//! arithmetic a liveness hazard; expiry is the only authority).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lodestone_kv::{KvError, KvStore, keys};
use lodestone_types::{InstanceId, InstanceStatus, ServiceInstance, ServiceName};

mod definitions;

pub use definitions::{DefinitionError, ServiceDefinitions};

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying KV failure.
    #[error(transparent)]
    Kv(#[from] KvError),
}

impl RegistryError {
    /// Whether retrying the same operation can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kv(e) => e.is_transient(),
        }
    }
}

/// Writes and maintains instance heartbeat entries.
#[derive(Clone)]
pub struct ServiceRegistry {
    kv: KvStore,
    entry_ttl: Duration,
}

impl ServiceRegistry {
    /// Creates a registry writing entries with the given TTL.
    ///
    /// The TTL must be at least twice the heartbeat cadence or entries will
    /// flap between heartbeats; configuration validation enforces this.
    pub fn new(kv: KvStore, entry_ttl: Duration) -> Self {
        Self { kv, entry_ttl }
    }

    /// The TTL stamped on every entry write.
    pub fn entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    /// Writes the initial registry entry for an instance.
    pub async fn register(&self, instance: &ServiceInstance) -> RegistryResult<()> {
        let key = keys::instance(&instance.service_name, &instance.instance_id);
        self.kv.put(&key, instance, Some(self.entry_ttl)).await?;
        debug!(
            service = %instance.service_name,
            instance = %instance.instance_id,
            status = %instance.status,
            "registered instance"
        );
        Ok(())
    }

    /// Refreshes an instance entry.
    ///
    /// Identical write path to [`register`](Self::register): the operation
    /// is idempotent, and each write restarts the TTL clock.
    pub async fn heartbeat(&self, instance: &ServiceInstance) -> RegistryResult<()> {
        let key = keys::instance(&instance.service_name, &instance.instance_id);
        self.kv.put(&key, instance, Some(self.entry_ttl)).await?;
        Ok(())
    }

    /// Removes an instance entry. Idempotent: a missing key is success.
    pub async fn deregister(
        &self,
        service: &ServiceName,
        instance: &InstanceId,
    ) -> RegistryResult<()> {
        let key = keys::instance(service, instance);
        self.kv.delete(&key, None).await?;
        debug!(service = %service, instance = %instance, "deregistered instance");
        Ok(())
    }

    /// Reads a single instance entry.
    pub async fn get(
        &self,
        service: &ServiceName,
        instance: &InstanceId,
    ) -> RegistryResult<Option<ServiceInstance>> {
        let key = keys::instance(service, instance);
        Ok(self
            .kv
            .get::<ServiceInstance>(&key)
            .await?
            .map(|entry| entry.value))
    }

    /// Lists instances, of one service or of all.
    ///
    /// Entries that fail to decode are dropped with a warning: one corrupt
    /// writer must not take discovery down for everyone else.
    pub async fn list(
        &self,
        service: Option<&ServiceName>,
    ) -> RegistryResult<Vec<ServiceInstance>> {
        let pattern = match service {
            Some(service) => keys::instances_of(service),
            None => keys::all_instances(),
        };

        let mut instances = Vec::new();
        for key in self.kv.list_keys(&pattern).await? {
            match self.kv.get::<ServiceInstance>(&key).await {
                Ok(Some(entry)) => instances.push(entry.value),
                // Expired between the key listing and the read.
                Ok(None) => {}
                Err(KvError::Decode { key, source }) => {
                    warn!(key = %key, error = %source, "dropping unparseable registry entry");
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(instances)
    }
}

/// Periodic heartbeat loop for one instance.
///
/// Owned by the service runtime; the status callback samples the current
/// election/health state at every tick so the registry entry always
/// reflects what the instance believes right now.
pub struct HeartbeatTask {
    registry: ServiceRegistry,
    instance: ServiceInstance,
    interval: Duration,
    status: Arc<dyn Fn() -> InstanceStatus + Send + Sync>,
    cancel: CancellationToken,
}

impl HeartbeatTask {
    pub fn new(
        registry: ServiceRegistry,
        instance: ServiceInstance,
        interval: Duration,
        status: Arc<dyn Fn() -> InstanceStatus + Send + Sync>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            instance,
            interval,
            status,
            cancel,
        }
    }

    /// Spawns the heartbeat loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.instance.touch((self.status)(), Utc::now());
                    if let Err(error) = self.registry.heartbeat(&self.instance).await {
                        // The entry survives until its TTL; the next tick
                        // gets another chance before anyone notices.
                        warn!(
                            service = %self.instance.service_name,
                            instance = %self.instance.instance_id,
                            operation = "heartbeat",
                            error = %error,
                            "heartbeat write failed"
                        );
                    }
                }
            }
        }
    }
}
