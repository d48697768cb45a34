//! # lodestone-discovery: Client-side discovery and sticky routing cache
//!
//! Locates the instance that should receive a call:
//!
//! - [`ServiceDiscovery::find_active`] resolves the active instance of a
//!   sticky group (by leader record) or of a plain service (by registry
//!   scan).
//! - [`ServiceDiscovery::list_healthy`] lists every instance whose registry
//!   entry is alive and routable.
//!
//! Resolutions are cached per `(service, group)` with a TTL. Cache entries
//! are dropped eagerly by a watch on the leader records, and an explicit
//! [`invalidate`](ServiceDiscovery::invalidate) call additionally
//! *suppresses* the failed instance: until the leader record moves to a new
//! revision or the TTL elapses, `find_active` refuses to hand it out again.
//! When the watch has to be re-established after a transport drop, the
//! whole cache is flushed, since a partition may have hidden any number of
//! leadership changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lodestone_bus::Backoff;
use lodestone_kv::{KvError, KvStore, keys};
use lodestone_registry::{RegistryError, ServiceRegistry};
use lodestone_types::{GroupName, InstanceId, Revision, ServiceInstance, ServiceName, Term};

#[cfg(test)]
mod tests;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors from discovery lookups.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No active instance is currently visible.
    #[error("no active instance for service {service}")]
    NoActiveInstance {
        service: ServiceName,
        group: Option<GroupName>,
    },

    /// Underlying KV failure.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// Underlying registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl DiscoveryError {
    /// Whether retrying the same lookup can succeed without anything else
    /// changing. `NoActiveInstance` is not transient in this sense: it is
    /// an accurate answer that only a leadership change invalidates.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NoActiveInstance { .. } => false,
            Self::Kv(e) => e.is_transient(),
            Self::Registry(e) => e.is_transient(),
        }
    }
}

type CacheKey = (ServiceName, Option<GroupName>);

struct CacheEntry {
    instance_id: InstanceId,
    /// Leader record revision backing this resolution; absent on the
    /// registry-scan path.
    revision: Option<Revision>,
    cached_at: Instant,
}

struct Suppressed {
    instance_id: InstanceId,
    revision: Option<Revision>,
    until: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    suppressed: HashMap<CacheKey, Suppressed>,
}

struct Inner {
    kv: KvStore,
    registry: ServiceRegistry,
    cache_ttl: Duration,
    cache: Arc<Mutex<CacheState>>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Discovery client with a sticky routing cache.
///
/// Caches are instance-local: every process builds its own view from the
/// shared bucket.
#[derive(Clone)]
pub struct ServiceDiscovery {
    inner: Arc<Inner>,
}

impl ServiceDiscovery {
    /// Creates a discovery client and spawns its invalidation watch.
    pub fn new(kv: KvStore, registry: ServiceRegistry, cache_ttl: Duration) -> Self {
        let cache = Arc::new(Mutex::new(CacheState::default()));
        let cancel = CancellationToken::new();

        tokio::spawn(invalidation_watch(
            kv.clone(),
            cache.clone(),
            cancel.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                kv,
                registry,
                cache_ttl,
                cache,
                cancel,
            }),
        }
    }

    /// Resolves the instance that should receive sticky calls.
    ///
    /// With a group, the leader record is authoritative. Without one, the
    /// registry is scanned for `ACTIVE` instances; transient double-actives
    /// during handoff are broken by highest term, then lowest instance id.
    pub async fn find_active(
        &self,
        service: &ServiceName,
        group: Option<&GroupName>,
    ) -> DiscoveryResult<InstanceId> {
        let key = (service.clone(), group.cloned());

        if let Some(instance) = self.cached(&key) {
            return Ok(instance);
        }

        match group {
            Some(group) => self.find_by_leader_record(service, group, key).await,
            None => self.find_by_registry_scan(service, key).await,
        }
    }

    /// Lists instances whose entries are alive (TTL unexpired) and whose
    /// status is routable (`ACTIVE` or `STANDBY`).
    pub async fn list_healthy(
        &self,
        service: &ServiceName,
    ) -> DiscoveryResult<Vec<ServiceInstance>> {
        let mut instances = self.inner.registry.list(Some(service)).await?;
        instances.retain(|instance| instance.status.is_routable());
        Ok(instances)
    }

    /// Drops the cached resolution and suppresses the instance it named.
    ///
    /// Called by the sticky RPC client after a `NOT_ACTIVE` reply or a
    /// transport failure. The suppression lifts as soon as the leader
    /// record moves (new revision: either the incumbent renewing, or a
    /// successor taking over) or after one cache TTL.
    pub fn invalidate(&self, service: &ServiceName, group: Option<&GroupName>) {
        let key = (service.clone(), group.cloned());
        let until = Instant::now() + self.inner.cache_ttl;
        let mut cache = self.inner.cache.lock().expect("cache lock poisoned");
        if let Some(entry) = cache.entries.remove(&key) {
            cache.suppressed.insert(
                key,
                Suppressed {
                    instance_id: entry.instance_id,
                    revision: entry.revision,
                    until,
                },
            );
        }
    }

    /// Flushes every cached resolution and suppression.
    pub fn invalidate_all(&self) {
        let mut cache = self.inner.cache.lock().expect("cache lock poisoned");
        cache.entries.clear();
        cache.suppressed.clear();
    }

    fn cached(&self, key: &CacheKey) -> Option<InstanceId> {
        let now = Instant::now();
        let mut cache = self.inner.cache.lock().expect("cache lock poisoned");
        match cache.entries.get(key) {
            Some(entry) if now.duration_since(entry.cached_at) < self.inner.cache_ttl => {
                Some(entry.instance_id.clone())
            }
            Some(_) => {
                cache.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Checks a candidate against the suppression table.
    ///
    /// Returns `true` when the candidate is currently suppressed; clears
    /// the suppression when it no longer applies.
    fn is_suppressed(
        &self,
        key: &CacheKey,
        candidate: &InstanceId,
        revision: Option<Revision>,
    ) -> bool {
        let now = Instant::now();
        let mut cache = self.inner.cache.lock().expect("cache lock poisoned");
        let Some(suppressed) = cache.suppressed.get(key) else {
            return false;
        };
        if now >= suppressed.until
            || suppressed.instance_id != *candidate
            || suppressed.revision != revision
        {
            cache.suppressed.remove(key);
            return false;
        }
        true
    }

    fn store(&self, key: CacheKey, instance_id: InstanceId, revision: Option<Revision>) {
        let mut cache = self.inner.cache.lock().expect("cache lock poisoned");
        cache.entries.insert(
            key,
            CacheEntry {
                instance_id,
                revision,
                cached_at: Instant::now(),
            },
        );
    }

    async fn find_by_leader_record(
        &self,
        service: &ServiceName,
        group: &GroupName,
        key: CacheKey,
    ) -> DiscoveryResult<InstanceId> {
        let leader_key = keys::leader(service, group);
        let entry = self
            .inner
            .kv
            .get::<lodestone_types::LeaderRecord>(&leader_key)
            .await?;

        let Some(entry) = entry else {
            return Err(DiscoveryError::NoActiveInstance {
                service: service.clone(),
                group: Some(group.clone()),
            });
        };

        let holder = entry.value.holder_id;
        if self.is_suppressed(&key, &holder, Some(entry.revision)) {
            // The record has not moved since this instance failed a call;
            // report nothing rather than hand the same instance out again.
            return Err(DiscoveryError::NoActiveInstance {
                service: service.clone(),
                group: Some(group.clone()),
            });
        }

        self.store(key, holder.clone(), Some(entry.revision));
        Ok(holder)
    }

    async fn find_by_registry_scan(
        &self,
        service: &ServiceName,
        key: CacheKey,
    ) -> DiscoveryResult<InstanceId> {
        let instances = self.inner.registry.list(Some(service)).await?;
        let mut candidates: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|i| i.status == lodestone_types::InstanceStatus::Active)
            .collect();

        if candidates.is_empty() {
            return Err(DiscoveryError::NoActiveInstance {
                service: service.clone(),
                group: None,
            });
        }

        // Transient double-actives appear during handoff; prefer the
        // instance whose leader record carries the highest term, then the
        // lowest instance id.
        let mut ranked: Vec<(Option<Term>, &ServiceInstance)> = Vec::new();
        for candidate in candidates.drain(..) {
            let term = match &candidate.sticky_group {
                Some(group) => self
                    .leader_term_of(service, group, &candidate.instance_id)
                    .await?,
                None => None,
            };
            ranked.push((term, candidate));
        }
        ranked.sort_by(|(term_a, a), (term_b, b)| {
            term_b
                .cmp(term_a)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });

        let chosen = ranked[0].1.instance_id.clone();
        if self.is_suppressed(&key, &chosen, None) {
            return Err(DiscoveryError::NoActiveInstance {
                service: service.clone(),
                group: None,
            });
        }

        self.store(key, chosen.clone(), None);
        Ok(chosen)
    }

    /// Term of the group's leader record, if it currently names `holder`.
    async fn leader_term_of(
        &self,
        service: &ServiceName,
        group: &GroupName,
        holder: &InstanceId,
    ) -> DiscoveryResult<Option<Term>> {
        let leader_key = keys::leader(service, group);
        let entry = self
            .inner
            .kv
            .get::<lodestone_types::LeaderRecord>(&leader_key)
            .await?;
        Ok(entry
            .filter(|e| e.value.holder_id == *holder)
            .map(|e| e.value.term))
    }
}

/// Watches `sticky-active.>` and drops cache state on every change.
///
/// A dead feed is re-established with backoff; because an arbitrary number
/// of leadership changes may have happened while the feed was down, the
/// whole cache is flushed on every re-establishment.
async fn invalidation_watch(
    kv: KvStore,
    cache: Arc<Mutex<CacheState>>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
    let mut first_feed = true;

    while !cancel.is_cancelled() {
        let mut watch = match kv.watch(&keys::all_leaders()).await {
            Ok(watch) => watch,
            Err(error) => {
                debug!(error = %error, "leader watch unavailable, backing off");
                let delay = backoff.next_delay();
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => continue,
                }
            }
        };
        backoff.reset();

        if !first_feed {
            // Reconnected: anything may have changed while we were blind.
            warn!("leader watch re-established, flushing sticky cache");
            let mut cache = cache.lock().expect("cache lock poisoned");
            cache.entries.clear();
            cache.suppressed.clear();
        }
        first_feed = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                event = watch.next() => match event {
                    Some(event) => {
                        let Some((service, group)) = keys::parse_leader_key(&event.key) else {
                            continue;
                        };
                        let mut cache = cache.lock().expect("cache lock poisoned");
                        // The record moved: cached resolutions for the
                        // group (and for the groupless scan of the same
                        // service) are stale, and suppressions are lifted.
                        cache.entries.remove(&(service.clone(), Some(group.clone())));
                        cache.entries.remove(&(service.clone(), None));
                        cache.suppressed.remove(&(service.clone(), Some(group)));
                        cache.suppressed.remove(&(service, None));
                    }
                    None => break,
                }
            }
        }
    }
}
