//! # lodestone-kv: Typed KV layer
//!
//! A thin typed wrapper over the bus port's raw KV operations: JSON codec,
//! key layout, operation timeouts, and typed CAS outcomes the election code
//! can match on instead of inspecting transport errors.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lodestone_types::Revision;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use lodestone_bus::{BusError, KvWatch, MessageBus};

pub mod keys;

/// Result type for typed KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors from the typed KV layer.
#[derive(Debug, Error)]
pub enum KvError {
    /// Transport-level failure, unchanged from the port.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A stored value failed to decode.
    #[error("failed to decode value at {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    /// A record failed to encode (non-serializable payload).
    #[error("failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
}

impl KvError {
    /// Whether retrying the same operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Bus(e) if e.is_transient())
    }
}

/// A decoded entry with its store revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    pub value: T,
    pub revision: Revision,
}

/// Outcome of an atomic create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// This caller created the key.
    Created(Revision),
    /// Someone else holds the key.
    AlreadyExists,
}

/// Outcome of a revision-guarded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The CAS succeeded; the new revision proves continued ownership.
    Updated(Revision),
    /// The stored revision moved (or the key vanished): the caller has
    /// been superseded.
    Superseded,
}

/// Typed handle on one KV bucket.
///
/// Every operation is bounded by the configured KV timeout; an elapsed
/// timeout surfaces as [`BusError::Timeout`].
#[derive(Clone)]
pub struct KvStore {
    bus: Arc<dyn MessageBus>,
    bucket: String,
    op_timeout: Duration,
}

impl KvStore {
    pub fn new(bus: Arc<dyn MessageBus>, bucket: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            bus,
            bucket: bucket.into(),
            op_timeout,
        }
    }

    /// The bucket this store operates on.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The underlying bus handle.
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, BusError>>,
    ) -> Result<T, BusError> {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(self.op_timeout)),
        }
    }

    /// Reads and decodes a key.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> KvResult<Option<Entry<T>>> {
        let raw = self.bounded(self.bus.kv_get(&self.bucket, key)).await?;
        match raw {
            Some(raw) => Ok(Some(Entry {
                value: decode(key, &raw.value)?,
                revision: raw.revision,
            })),
            None => Ok(None),
        }
    }

    /// Writes a key unconditionally.
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> KvResult<Revision> {
        let encoded = encode(key, value)?;
        Ok(self
            .bounded(self.bus.kv_put(&self.bucket, key, encoded, ttl))
            .await?)
    }

    /// Attempts an atomic create-if-absent.
    pub async fn create<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> KvResult<CreateOutcome> {
        let encoded = encode(key, value)?;
        match self
            .bounded(self.bus.kv_create(&self.bucket, key, encoded, ttl))
            .await
        {
            Ok(revision) => Ok(CreateOutcome::Created(revision)),
            Err(BusError::AlreadyExists(_)) => Ok(CreateOutcome::AlreadyExists),
            Err(other) => Err(other.into()),
        }
    }

    /// Attempts a revision-guarded update.
    pub async fn update<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        expected: Revision,
        ttl: Option<Duration>,
    ) -> KvResult<UpdateOutcome> {
        let encoded = encode(key, value)?;
        match self
            .bounded(self.bus.kv_update(&self.bucket, key, encoded, expected, ttl))
            .await
        {
            Ok(revision) => Ok(UpdateOutcome::Updated(revision)),
            Err(BusError::RevisionMismatch { .. }) => Ok(UpdateOutcome::Superseded),
            Err(other) => Err(other.into()),
        }
    }

    /// Deletes a key, optionally revision-guarded. Missing keys succeed.
    pub async fn delete(&self, key: &str, expected: Option<Revision>) -> KvResult<()> {
        Ok(self
            .bounded(self.bus.kv_delete(&self.bucket, key, expected))
            .await?)
    }

    /// Lists keys matching a pattern.
    pub async fn list_keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        Ok(self
            .bounded(self.bus.kv_keys(&self.bucket, pattern))
            .await?)
    }

    /// Opens a change feed over keys matching a pattern.
    pub async fn watch(&self, pattern: &str) -> KvResult<KvWatch> {
        Ok(self
            .bounded(self.bus.kv_watch(&self.bucket, pattern))
            .await?)
    }
}

/// Decodes a raw value observed at `key` (reads and watch events).
pub fn decode<T: DeserializeOwned>(key: &str, value: &Bytes) -> KvResult<T> {
    serde_json::from_slice(value).map_err(|source| KvError::Decode {
        key: key.to_string(),
        source,
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> KvResult<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| KvError::Encode {
            key: key.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use lodestone_bus::{InMemoryBus, MessageBus as _};
    use lodestone_types::{GroupName, InstanceId, LeaderRecord, ServiceName, Term};

    use super::*;

    fn store() -> KvStore {
        KvStore::new(
            Arc::new(InMemoryBus::new()),
            "service-registry",
            Duration::from_millis(500),
        )
    }

    fn record(holder: &str, term: u64) -> LeaderRecord {
        let service = ServiceName::new("trader").unwrap();
        let group = GroupName::new("default").unwrap();
        LeaderRecord::new(
            LeaderRecord::group_key_for(&service, &group),
            InstanceId::new(holder).unwrap(),
            Term::new(term),
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn typed_round_trip_preserves_records() {
        let store = store();
        let original = record("trader-a", 0);

        store
            .put("sticky-active.trader.default", &original, None)
            .await
            .unwrap();
        let entry: Entry<LeaderRecord> = store
            .get("sticky-active.trader.default")
            .await
            .unwrap()
            .expect("entry present");

        assert_eq!(entry.value, original);
    }

    #[tokio::test]
    async fn create_reports_contention_as_outcome() {
        let store = store();
        let key = "sticky-active.trader.default";

        let first = store.create(key, &record("trader-a", 0), None).await.unwrap();
        let rev = match first {
            CreateOutcome::Created(rev) => rev,
            CreateOutcome::AlreadyExists => panic!("first create must win"),
        };

        let second = store.create(key, &record("trader-b", 0), None).await.unwrap();
        assert_eq!(second, CreateOutcome::AlreadyExists);

        // The losing create changed nothing.
        let entry: Entry<LeaderRecord> = store.get(key).await.unwrap().unwrap();
        assert_eq!(entry.revision, rev);
        assert_eq!(entry.value.holder_id, InstanceId::new("trader-a").unwrap());
    }

    #[tokio::test]
    async fn update_reports_supersession_as_outcome() {
        let store = store();
        let key = "sticky-active.trader.default";

        let CreateOutcome::Created(rev) =
            store.create(key, &record("trader-a", 0), None).await.unwrap()
        else {
            panic!("create must win on empty bucket");
        };

        let renewed = store
            .update(key, &record("trader-a", 0), rev, None)
            .await
            .unwrap();
        let UpdateOutcome::Updated(rev2) = renewed else {
            panic!("holder with current revision renews");
        };

        // Renewal with the old revision is a supersession signal.
        let stale = store
            .update(key, &record("trader-a", 0), rev, None)
            .await
            .unwrap();
        assert_eq!(stale, UpdateOutcome::Superseded);
        assert!(rev2 > rev);
    }

    #[tokio::test]
    async fn update_on_vanished_key_is_superseded() {
        let store = store();
        let key = "sticky-active.trader.default";

        let CreateOutcome::Created(rev) =
            store.create(key, &record("trader-a", 0), None).await.unwrap()
        else {
            panic!("create must win on empty bucket");
        };
        store.delete(key, None).await.unwrap();

        let outcome = store
            .update(key, &record("trader-a", 0), rev, None)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Superseded);
    }

    #[tokio::test]
    async fn undecodable_value_surfaces_key_in_error() {
        let store = store();
        store
            .bus()
            .kv_put(
                "service-registry",
                "service-instances.trader.bad",
                Bytes::from_static(b"not json"),
                None,
            )
            .await
            .unwrap();

        let result: KvResult<Option<Entry<LeaderRecord>>> =
            store.get("service-instances.trader.bad").await;

        match result {
            Err(KvError::Decode { key, .. }) => {
                assert_eq!(key, "service-instances.trader.bad");
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }
}
