//! # lodestone-runtime: Service lifecycle host
//!
//! [`ServiceRuntime`] composes the coordination pieces into one running
//! service instance:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ServiceRuntime                         │
//! │  ┌──────────┐  ┌──────────────┐  ┌─────────┐  ┌───────────┐  │
//! │  │ Registry │  │  Election    │  │ Handler │  │ Lifecycle │  │
//! │  │(heartbeat│  │ (optional,   │  │  table  │  │  (watch   │  │
//! │  │   loop)  │  │single-active)│  │ (RPC)   │  │  channel) │  │
//! │  └──────────┘  └──────────────┘  └─────────┘  └───────────┘  │
//! │                          │                                   │
//! │                  MessageBus (injected)                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Single-active versus plain is a construction-time choice on the
//! builder, not a type hierarchy: a plain runtime is the same host minus
//! the election coordinator.

use thiserror::Error;

use lodestone_bus::BusError;
use lodestone_config::ConfigError;
use lodestone_registry::RegistryError;
use lodestone_types::TypeError;

mod handler;
mod runtime;

pub use handler::{HandlerFuture, HandlerResult};
pub use runtime::{ServiceRuntime, ServiceRuntimeBuilder};

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors from building, starting or stopping a service runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configured service identity failed name validation.
    #[error("invalid service identity: {0}")]
    Identity(#[from] TypeError),

    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `start` on a runtime that is already running (or stopped).
    #[error("runtime already started")]
    AlreadyStarted,

    /// `shutdown` on a runtime that never started.
    #[error("runtime not started")]
    NotStarted,

    /// Registry write failed during startup or shutdown.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Bus operation failed during startup.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// An event payload failed to encode.
    #[error("failed to encode event payload: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Observable lifecycle of a service instance.
///
/// `Active`/`Standby` mirror the election for single-active services; a
/// plain service goes straight to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// Built, not yet started.
    #[default]
    Initialized,
    /// `start` is wiring up loops and registering the instance.
    Starting,
    /// Serving; for single-active services, holding leadership.
    Active,
    /// Registered and heartbeating, waiting for leadership.
    Standby,
    /// `shutdown` is draining in-flight handlers.
    Stopping,
    /// Fully stopped and deregistered.
    Stopped,
}

impl LifecycleState {
    /// Whether the instance is past startup and not yet stopping.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::Standby)
    }
}
