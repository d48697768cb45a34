//! # lodestone-bus: Message-bus port and in-memory adapter
//!
//! This crate is the single seam between the Lodestone coordination core
//! and the message transport. It defines:
//!
//! - The [`MessageBus`] port: pub/sub, request/reply, and a replicated KV
//!   store with atomic create, revision CAS, per-message TTL and change
//!   feeds ([`port`])
//! - The subject grammar shared by all services ([`subject`])
//! - A complete in-memory adapter used for tests and local development
//!   ([`memory`])
//! - A named adapter registry so transports are selected by configuration,
//!   never probed at runtime ([`registry`])
//! - Jittered backoff for transient transport failures ([`backoff`])
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  registry / election / discovery / runtime / client      │
//! │                          │                               │
//! │                 MessageBus (port)                        │
//! │                   │              │                       │
//! │             InMemoryBus     nats adapter (out of tree)   │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod backoff;
mod error;
mod memory;
mod port;
mod registry;
pub mod subject;

pub use backoff::Backoff;
pub use error::{BusError, BusResult};
pub use memory::InMemoryBus;
pub use port::{
    BusMessage, KvEvent, KvOp, KvWatch, MessageBus, RawEntry, SubscribeMode, Subscription,
};
pub use registry::{BusBuildError, BusFactory, BusOptions, BusRegistry};
