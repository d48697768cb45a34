//! Configuration management for Lodestone
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (LODE_* prefix, highest precedence)
//! 2. lodestone.local.toml (gitignored, local overrides)
//! 3. lodestone.toml (git-tracked, project config)
//! 4. Built-in defaults (lowest precedence)
//!
//! All timing knobs are integer-valued. Heartbeat cadence is whole seconds
//! with a minimum of 1 s; sub-second failover is deliberately out of reach
//! of configuration (the registry TTL arithmetic depends on whole-second
//! heartbeats).

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

/// Main Lodestone configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LodestoneConfig {
    pub service: ServiceConfig,
    pub bus: BusConfig,
    pub timing: TimingConfig,
}

impl LodestoneConfig {
    /// Validates the relations between timing knobs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] when any relation required
    /// by the coordination protocol is violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timing.validate()
    }
}

/// Identity of the service instance being configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Logical service name.
    pub name: String,
    /// Version string published in registry entries.
    pub version: String,
    /// Sticky group for single-active services.
    pub sticky_group: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "lodestone-service".to_string(),
            version: "0.0.0".to_string(),
            sticky_group: "default".to_string(),
        }
    }
}

/// Message-bus selection and addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Which registered bus adapter to construct.
    pub kind: BusKind,
    /// Transport URL, interpreted by the adapter.
    pub url: String,
    /// KV bucket holding registry, election and definition entries.
    pub bucket: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::InMemory,
            url: "nats://127.0.0.1:4222".to_string(),
            bucket: "service-registry".to_string(),
        }
    }
}

/// Bus adapter selection.
///
/// Adapters are looked up by name in the bus registry; `in-memory` ships
/// with the core, `nats` is registered by the transport adapter crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BusKind {
    #[default]
    InMemory,
    Nats,
}

impl BusKind {
    /// The adapter name used for registry lookup.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InMemory => "in-memory",
            Self::Nats => "nats",
        }
    }
}

/// Timing knobs of the coordination protocol.
///
/// Defaults give an observed failover of roughly two seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Registry heartbeat cadence, whole seconds, minimum 1.
    pub heartbeat_interval_secs: u64,
    /// Registry entry TTL as a multiple of the heartbeat interval (k ≥ 2).
    pub heartbeat_ttl_factor: u32,
    /// Leader record TTL in seconds; must exceed the heartbeat interval.
    pub leader_ttl_secs: u64,
    /// Leader renewal cadence in seconds; at most half the leader TTL.
    pub renewal_interval_secs: u64,
    /// Standby safety-net poll cadence in seconds.
    pub standby_poll_secs: u64,
    /// Timeout for a single KV operation, milliseconds.
    pub kv_op_timeout_ms: u64,
    /// Default per-call RPC timeout, milliseconds.
    pub rpc_timeout_ms: u64,
    /// Sticky discovery cache TTL in seconds.
    pub discovery_cache_ttl_secs: u64,
    /// Maximum sticky RPC attempts before surfacing UNAVAILABLE.
    pub rpc_max_attempts: u32,
    /// Grace period for in-flight handlers during shutdown, seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 1,
            heartbeat_ttl_factor: 3,
            leader_ttl_secs: 2,
            renewal_interval_secs: 1,
            standby_poll_secs: 1,
            kv_op_timeout_ms: 500,
            rpc_timeout_ms: 5_000,
            discovery_cache_ttl_secs: 5,
            rpc_max_attempts: 3,
            shutdown_grace_secs: 5,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Registry entry TTL: heartbeat interval × k.
    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * u64::from(self.heartbeat_ttl_factor))
    }

    pub fn leader_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_ttl_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn standby_poll_interval(&self) -> Duration {
        Duration::from_secs(self.standby_poll_secs)
    }

    pub fn kv_op_timeout(&self) -> Duration {
        Duration::from_millis(self.kv_op_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn discovery_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.discovery_cache_ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs < 1 {
            return Err(ConfigError::ValidationError(
                "timing.heartbeat_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_ttl_factor < 2 {
            return Err(ConfigError::ValidationError(
                "timing.heartbeat_ttl_factor must be at least 2".to_string(),
            ));
        }
        if self.leader_ttl_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::ValidationError(format!(
                "timing.leader_ttl_secs ({}) must exceed heartbeat_interval_secs ({})",
                self.leader_ttl_secs, self.heartbeat_interval_secs
            )));
        }
        if self.renewal_interval_secs * 2 > self.leader_ttl_secs {
            return Err(ConfigError::ValidationError(format!(
                "timing.renewal_interval_secs ({}) must be at most half of leader_ttl_secs ({})",
                self.renewal_interval_secs, self.leader_ttl_secs
            )));
        }
        if self.renewal_interval_secs < 1 || self.standby_poll_secs < 1 {
            return Err(ConfigError::ValidationError(
                "timing.renewal_interval_secs and timing.standby_poll_secs must be at least 1"
                    .to_string(),
            ));
        }
        if self.kv_op_timeout_ms == 0 || self.rpc_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timing.kv_op_timeout_ms and timing.rpc_timeout_ms must be positive".to_string(),
            ));
        }
        if self.rpc_max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "timing.rpc_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
