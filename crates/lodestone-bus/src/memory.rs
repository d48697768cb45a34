//! In-memory bus adapter.
//!
//! A complete, single-process implementation of the [`MessageBus`] port over
//! tokio primitives. It backs the test suites of every coordination crate
//! and doubles as the `in-memory` bus kind for local development.
//!
//! All timers use `tokio::time`, so suites running under a paused clock
//! exercise TTL expiry and failover deterministically and instantly.
//!
//! The adapter also models transport loss: [`InMemoryBus::set_connected`]
//! with `false` fails subsequent operations with `Disconnected`, drops all
//! live subscriptions and watches (their consumers observe `None`, exactly
//! as they would on a real reconnect), and fails in-flight requests. KV
//! state survives, as it would on a replicated server.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lodestone_types::Revision;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{BusError, BusResult};
use crate::port::{
    BusMessage, KvEvent, KvOp, KvWatch, MessageBus, RawEntry, SubscribeMode, Subscription,
};
use crate::subject;

/// Cadence of the background TTL sweep.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// In-memory [`MessageBus`] adapter.
///
/// Cheap to clone; all clones share the same broker state.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    connected: AtomicBool,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    subs: Vec<SubEntry>,
    rr_cursors: HashMap<(String, String), usize>,
    inboxes: HashMap<String, oneshot::Sender<Bytes>>,
    buckets: HashMap<String, Bucket>,
}

struct SubEntry {
    pattern: String,
    mode: SubscribeMode,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct Bucket {
    seq: u64,
    entries: BTreeMap<String, StoredEntry>,
    watchers: Vec<Watcher>,
}

struct StoredEntry {
    value: Bytes,
    revision: Revision,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Watcher {
    pattern: String,
    tx: mpsc::UnboundedSender<KvEvent>,
}

impl Bucket {
    fn notify(&mut self, event: &KvEvent) {
        self.watchers
            .retain(|w| !subject::matches(&w.pattern, &event.key) || w.tx.send(event.clone()).is_ok());
    }

    /// Removes an expired entry and tells watchers it is gone.
    fn purge(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.seq += 1;
            let event = KvEvent {
                key: key.to_string(),
                op: KvOp::Purge,
                value: None,
                revision: Revision::new(self.seq),
            };
            self.notify(&event);
        }
    }

    /// Purges every expired entry.
    fn sweep(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.purge(&key);
        }
    }
}

impl InMemoryBus {
    /// Creates a new broker and spawns its TTL sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            connected: AtomicBool::new(true),
            state: Mutex::new(BrokerState::default()),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(inner) = weak.upgrade() else { break };
                let now = Instant::now();
                let mut state = inner.state.lock().expect("broker lock poisoned");
                for bucket in state.buckets.values_mut() {
                    bucket.sweep(now);
                }
            }
        });

        Self { inner }
    }

    /// Simulates transport connectivity.
    ///
    /// Going offline drops every subscription, watch and in-flight request;
    /// KV contents persist (they live on the server side of the transport).
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
        if !connected {
            let mut state = self.inner.state.lock().expect("broker lock poisoned");
            state.subs.clear();
            state.rr_cursors.clear();
            state.inboxes.clear();
            for bucket in state.buckets.values_mut() {
                bucket.watchers.clear();
            }
        }
    }

    fn check_connected(&self) -> BusResult<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Disconnected)
        }
    }

    fn deliver(&self, subject_name: &str, payload: Bytes, reply_to: Option<String>) {
        let mut state = self.inner.state.lock().expect("broker lock poisoned");

        // Request/reply inboxes are exact-match and consumed by delivery.
        if let Some(tx) = state.inboxes.remove(subject_name) {
            let _ = tx.send(payload);
            return;
        }

        let message = BusMessage {
            subject: subject_name.to_string(),
            payload,
            reply_to,
        };

        // Broadcast subscribers each get a copy; closed ones are dropped.
        state.subs.retain(|sub| {
            if sub.mode != SubscribeMode::Broadcast
                || !subject::matches(&sub.pattern, subject_name)
            {
                return !sub.tx.is_closed();
            }
            sub.tx.send(message.clone()).is_ok()
        });

        // Compete subscribers: one delivery per queue group, round-robin.
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, sub) in state.subs.iter().enumerate() {
            if let SubscribeMode::Compete { queue_group } = &sub.mode {
                if subject::matches(&sub.pattern, subject_name) {
                    groups.entry(queue_group.clone()).or_default().push(idx);
                }
            }
        }
        for (group, members) in groups {
            let cursor_key = (group, subject_name.to_string());
            let cursor = state.rr_cursors.entry(cursor_key).or_insert(0);
            let chosen = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            let _ = state.subs[chosen].tx.send(message.clone());
        }
    }

    fn with_bucket<T>(&self, bucket: &str, f: impl FnOnce(&mut Bucket, Instant) -> T) -> T {
        let now = Instant::now();
        let mut state = self.inner.state.lock().expect("broker lock poisoned");
        let bucket = state.buckets.entry(bucket.to_string()).or_default();
        f(bucket, now)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()> {
        self.check_connected()?;
        self.deliver(subject, payload, None);
        Ok(())
    }

    async fn subscribe(&self, subject: &str, mode: SubscribeMode) -> BusResult<Subscription> {
        self.check_connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().expect("broker lock poisoned");
        state.subs.push(SubEntry {
            pattern: subject.to_string(),
            mode,
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn rpc(&self, subject: &str, payload: Bytes, timeout: Duration) -> BusResult<Bytes> {
        self.check_connected()?;

        let inbox = format!("_inbox.{}", Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().expect("broker lock poisoned");
            state.inboxes.insert(inbox.clone(), tx);
        }

        self.deliver(subject, payload, Some(inbox.clone()));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // The inbox sender was dropped: the transport went down.
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => {
                let mut state = self.inner.state.lock().expect("broker lock poisoned");
                state.inboxes.remove(&inbox);
                Err(BusError::Timeout(timeout))
            }
        }
    }

    async fn kv_get(&self, bucket: &str, key: &str) -> BusResult<Option<RawEntry>> {
        self.check_connected()?;
        Ok(self.with_bucket(bucket, |bucket, now| {
            match bucket.entries.get(key) {
                Some(entry) if entry.is_expired(now) => {
                    bucket.purge(key);
                    None
                }
                Some(entry) => Some(RawEntry {
                    value: entry.value.clone(),
                    revision: entry.revision,
                }),
                None => None,
            }
        }))
    }

    async fn kv_put(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BusResult<Revision> {
        self.check_connected()?;
        Ok(self.with_bucket(bucket, |bucket, now| {
            bucket.seq += 1;
            let revision = Revision::new(bucket.seq);
            bucket.entries.insert(
                key.to_string(),
                StoredEntry {
                    value: value.clone(),
                    revision,
                    expires_at: ttl.map(|t| now + t),
                },
            );
            bucket.notify(&KvEvent {
                key: key.to_string(),
                op: KvOp::Put,
                value: Some(value),
                revision,
            });
            revision
        }))
    }

    async fn kv_create(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BusResult<Revision> {
        self.check_connected()?;
        self.with_bucket(bucket, |bucket, now| {
            if let Some(entry) = bucket.entries.get(key) {
                if entry.is_expired(now) {
                    bucket.purge(key);
                } else {
                    return Err(BusError::AlreadyExists(key.to_string()));
                }
            }
            bucket.seq += 1;
            let revision = Revision::new(bucket.seq);
            bucket.entries.insert(
                key.to_string(),
                StoredEntry {
                    value: value.clone(),
                    revision,
                    expires_at: ttl.map(|t| now + t),
                },
            );
            bucket.notify(&KvEvent {
                key: key.to_string(),
                op: KvOp::Put,
                value: Some(value),
                revision,
            });
            Ok(revision)
        })
    }

    async fn kv_update(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        expected: Revision,
        ttl: Option<Duration>,
    ) -> BusResult<Revision> {
        self.check_connected()?;
        self.with_bucket(bucket, |bucket, now| {
            let current = match bucket.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => entry.revision,
                _ => {
                    // A vanished key can never match the caller's revision.
                    return Err(BusError::RevisionMismatch {
                        key: key.to_string(),
                        expected,
                    });
                }
            };
            if current != expected {
                return Err(BusError::RevisionMismatch {
                    key: key.to_string(),
                    expected,
                });
            }
            bucket.seq += 1;
            let revision = Revision::new(bucket.seq);
            bucket.entries.insert(
                key.to_string(),
                StoredEntry {
                    value: value.clone(),
                    revision,
                    expires_at: ttl.map(|t| now + t),
                },
            );
            bucket.notify(&KvEvent {
                key: key.to_string(),
                op: KvOp::Put,
                value: Some(value),
                revision,
            });
            Ok(revision)
        })
    }

    async fn kv_delete(
        &self,
        bucket: &str,
        key: &str,
        expected: Option<Revision>,
    ) -> BusResult<()> {
        self.check_connected()?;
        self.with_bucket(bucket, |bucket, now| {
            let current = match bucket.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => entry.revision,
                // Missing or already expired: deleting is a no-op success.
                _ => return Ok(()),
            };
            if let Some(expected) = expected {
                if current != expected {
                    return Err(BusError::RevisionMismatch {
                        key: key.to_string(),
                        expected,
                    });
                }
            }
            bucket.entries.remove(key);
            bucket.seq += 1;
            bucket.notify(&KvEvent {
                key: key.to_string(),
                op: KvOp::Delete,
                value: None,
                revision: Revision::new(bucket.seq),
            });
            Ok(())
        })
    }

    async fn kv_keys(&self, bucket: &str, pattern: &str) -> BusResult<Vec<String>> {
        self.check_connected()?;
        Ok(self.with_bucket(bucket, |bucket, now| {
            bucket.sweep(now);
            bucket
                .entries
                .keys()
                .filter(|key| subject::matches(pattern, key))
                .cloned()
                .collect()
        }))
    }

    async fn kv_watch(&self, bucket: &str, pattern: &str) -> BusResult<KvWatch> {
        self.check_connected()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_bucket(bucket, |bucket, _| {
            bucket.watchers.push(Watcher {
                pattern: pattern.to_string(),
                tx,
            });
        });
        Ok(KvWatch::new(rx))
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
