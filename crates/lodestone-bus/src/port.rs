//! The MessageBus port: the single seam between the coordination core and
//! the transport.
//!
//! Every component receives its bus via construction; there is no
//! process-wide default. Implementations must be safe for concurrent use
//! from all of a service's loops.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lodestone_types::Revision;
use tokio::sync::mpsc;

use crate::error::BusResult;

/// One message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject the message was published on.
    pub subject: String,
    /// Opaque payload.
    pub payload: Bytes,
    /// Reply subject for request/reply traffic.
    pub reply_to: Option<String>,
}

/// How a subscription receives messages published to its subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Every subscriber receives every message.
    Broadcast,
    /// Exactly one subscriber per queue group receives each message.
    Compete {
        /// Queue group name.
        queue_group: String,
    },
}

/// A live subscription; dropped to unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    /// Wraps a delivery channel. Used by bus adapters.
    pub fn new(rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { rx }
    }

    /// Receives the next message.
    ///
    /// Returns `None` when the subscription is terminated by the transport
    /// (disconnection or bus shutdown).
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// A raw KV entry: opaque value plus store-assigned revision.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub value: Bytes,
    pub revision: Revision,
}

/// Kind of change observed by a KV watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOp {
    /// The key was written.
    Put,
    /// The key was deleted explicitly.
    Delete,
    /// The key expired by TTL.
    Purge,
}

/// One change observed by a KV watch.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub key: String,
    pub op: KvOp,
    /// Present for `Put`; absent for `Delete`/`Purge`.
    pub value: Option<Bytes>,
    pub revision: Revision,
}

/// A live KV change feed; dropped to stop watching.
///
/// Events arrive in the order the store applied them, with at-most-once
/// delivery across reconnections: consumers must be idempotent, and a
/// `None` from [`next`](Self::next) means the feed died with the transport
/// and has to be re-established.
#[derive(Debug)]
pub struct KvWatch {
    rx: mpsc::UnboundedReceiver<KvEvent>,
}

impl KvWatch {
    /// Wraps a delivery channel. Used by bus adapters.
    pub fn new(rx: mpsc::UnboundedReceiver<KvEvent>) -> Self {
        Self { rx }
    }

    /// Receives the next change.
    pub async fn next(&mut self) -> Option<KvEvent> {
        self.rx.recv().await
    }
}

/// Abstraction over the message transport: pub/sub, request/reply, and a
/// replicated KV store with atomic create, CAS and change feeds.
///
/// The KV store provides per-key linearizability: CAS on revision
/// serializes writes, and at most one concurrent [`kv_create`] of the same
/// key succeeds. No cross-key ordering is guaranteed.
///
/// [`kv_create`]: MessageBus::kv_create
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a message.
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()>;

    /// Subscribes to a subject (wildcards allowed).
    async fn subscribe(&self, subject: &str, mode: SubscribeMode) -> BusResult<Subscription>;

    /// Sends a request and awaits a single reply.
    async fn rpc(&self, subject: &str, payload: Bytes, timeout: Duration) -> BusResult<Bytes>;

    /// Reads a key. `None` when absent or expired.
    async fn kv_get(&self, bucket: &str, key: &str) -> BusResult<Option<RawEntry>>;

    /// Writes a key unconditionally. Each write carries its own TTL
    /// (per-message expiry); `None` means the entry never expires.
    async fn kv_put(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BusResult<Revision>;

    /// Creates a key if absent. Fails with [`BusError::AlreadyExists`] when
    /// the key is present; among concurrent creators exactly one succeeds.
    ///
    /// [`BusError::AlreadyExists`]: crate::BusError::AlreadyExists
    async fn kv_create(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BusResult<Revision>;

    /// Compare-and-swap: replaces the value only if the stored revision
    /// matches `expected`; fails with [`BusError::RevisionMismatch`]
    /// otherwise (including when the key vanished). The write refreshes the
    /// entry's TTL.
    ///
    /// [`BusError::RevisionMismatch`]: crate::BusError::RevisionMismatch
    async fn kv_update(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        expected: Revision,
        ttl: Option<Duration>,
    ) -> BusResult<Revision>;

    /// Deletes a key. Missing keys are success (idempotent); with
    /// `expected` set the delete is revision-guarded.
    async fn kv_delete(
        &self,
        bucket: &str,
        key: &str,
        expected: Option<Revision>,
    ) -> BusResult<()>;

    /// Lists keys matching a pattern.
    async fn kv_keys(&self, bucket: &str, pattern: &str) -> BusResult<Vec<String>>;

    /// Opens a change feed over keys matching a pattern. Only changes
    /// applied after the watch is established are delivered.
    async fn kv_watch(&self, bucket: &str, pattern: &str) -> BusResult<KvWatch>;

    /// Whether the transport connection is currently up.
    fn is_connected(&self) -> bool;
}
