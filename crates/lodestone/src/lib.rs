//! # Lodestone
//!
//! Distributed service coordination core for message-bus microservices:
//! a TTL-heartbeat service registry, sticky single-active leader election,
//! and client-side discovery with sticky RPC routing.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Lodestone                             │
//! │  ┌──────────┐  ┌──────────┐  ┌───────────┐  ┌──────────────┐   │
//! │  │ Registry │  │ Election │  │ Discovery │  │ StickyClient │   │
//! │  │(TTL beat)│  │(CAS+TTL) │  │ (+ cache) │  │ (retry/NA)   │   │
//! │  └──────────┘  └──────────┘  └───────────┘  └──────────────┘   │
//! │        │             │             │               │           │
//! │        └───────── MessageBus port (KV, pub/sub, RPC) ──────────│
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # How it fits together
//!
//! A service instance boots, registers itself in the shared KV bucket and
//! starts heartbeating. A single-active instance additionally competes for
//! its group's leader record: an atomic create-if-absent win makes it
//! ACTIVE, everyone else stands by watching the record. Callers use
//! [`ServiceDiscovery`] to resolve the active instance and
//! [`StickyClient`] to call it, retrying transparently across leadership
//! changes.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use lodestone::{
//!     InMemoryBus, LodestoneConfig, ServiceRuntime, StickyClient,
//! };
//!
//! let bus = Arc::new(InMemoryBus::new());
//! let config = LodestoneConfig::default();
//!
//! let mut runtime = ServiceRuntime::builder(bus.clone(), config.clone())
//!     .service_name("trader")
//!     .single_active()
//!     .handler("submit_order", |request| async move {
//!         Ok(serde_json::json!({ "accepted": request.payload }))
//!     })
//!     .build()?;
//! runtime.start().await?;
//! ```
//!
//! The in-memory bus ships with the core for tests and local development;
//! production deployments select a transport adapter (e.g. `nats`) through
//! [`BusKind`] and the adapter registry.

// Core vocabulary
pub use lodestone_types::{
    ErrorCode, ErrorEnvelope, GroupName, InstanceId, InstanceStatus, LeaderRecord, Revision,
    RpcReply, RpcRequest, ServiceDefinition, ServiceInstance, ServiceName, Term, TypeError,
};

// Configuration
pub use lodestone_config::{
    BusConfig, BusKind, ConfigError, ConfigLoader, LodestoneConfig, ServiceConfig, TimingConfig,
};

// Transport port and adapters
pub use lodestone_bus::{
    BusBuildError, BusError, BusFactory, BusMessage, BusOptions, BusRegistry, BusResult,
    InMemoryBus, KvEvent, KvOp, KvWatch, MessageBus, SubscribeMode, Subscription, subject,
};

// Typed KV layer
pub use lodestone_kv::{CreateOutcome, Entry, KvError, KvStore, UpdateOutcome, keys};

// Registry
pub use lodestone_registry::{
    DefinitionError, HeartbeatTask, RegistryError, ServiceDefinitions, ServiceRegistry,
};

// Election
pub use lodestone_election::{
    ElectionConfig, ElectionCoordinator, ElectionHandle, ElectionState,
};

// Discovery
pub use lodestone_discovery::{DiscoveryError, ServiceDiscovery};

// Runtime host
pub use lodestone_runtime::{
    HandlerResult, LifecycleState, RuntimeError, ServiceRuntime, ServiceRuntimeBuilder,
};

// Client
pub use lodestone_client::{ClientError, StickyClient};
