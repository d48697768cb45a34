//! # lodestone-types: Core types for Lodestone
//!
//! This crate contains the shared vocabulary used across the Lodestone
//! coordination core:
//! - Naming newtypes ([`ServiceName`], [`InstanceId`], [`GroupName`])
//! - Coordination counters ([`Term`], [`Revision`])
//! - Registry records ([`ServiceInstance`], [`InstanceStatus`])
//! - Election records ([`LeaderRecord`])
//! - Management-plane records ([`ServiceDefinition`])
//! - The RPC wire envelope ([`RpcRequest`], [`RpcReply`], [`ErrorEnvelope`],
//!   [`ErrorCode`])
//!
//! All records serialize to JSON with stable field names; field order is
//! irrelevant on decode.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[cfg(test)]
mod tests;

/// Characters that the bus reserves for subject and key structure.
///
/// Names containing these cannot be embedded into subjects
/// (`rpc.<service>.<instance>.<method>`) or KV keys
/// (`service-instances.<service>.<instance>`) without changing their
/// meaning, so they are rejected at construction time.
const RESERVED: &[char] = &['.', '*', '>', ' ', '\t', '\n', '\r'];

/// Errors produced when constructing or interpreting core types.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    /// A name was empty or contained bus-reserved characters.
    #[error("invalid {what}: {value:?} ({reason})")]
    InvalidName {
        what: &'static str,
        value: String,
        reason: &'static str,
    },
}

fn validate_token(what: &'static str, value: &str) -> Result<(), TypeError> {
    if value.is_empty() {
        return Err(TypeError::InvalidName {
            what,
            value: value.to_string(),
            reason: "must not be empty",
        });
    }
    if value.contains(RESERVED) {
        return Err(TypeError::InvalidName {
            what,
            value: value.to_string(),
            reason: "must not contain '.', '*', '>' or whitespace",
        });
    }
    Ok(())
}

// ============================================================================
// Naming newtypes
// ============================================================================

macro_rules! name_newtype {
    ($(#[$doc:meta])* $name:ident, $what:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new validated name.
            ///
            /// # Errors
            ///
            /// Returns [`TypeError::InvalidName`] if the value is empty or
            /// contains bus-reserved characters.
            pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
                let value = value.into();
                validate_token($what, &value)?;
                Ok(Self(value))
            }

            /// Returns the name as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = TypeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

name_newtype!(
    /// Logical name of a service (e.g. `order-gateway`).
    ServiceName,
    "service name"
);

name_newtype!(
    /// Cluster-unique identifier of one service instance.
    ///
    /// Opaque to the coordination core; by convention instances of the same
    /// sticky group share a prefix so operators can read routing subjects.
    InstanceId,
    "instance id"
);

name_newtype!(
    /// Name of a sticky-active group within a service.
    GroupName,
    "group name"
);

impl InstanceId {
    /// Generates a fresh instance id with the given prefix.
    ///
    /// The suffix is the first eight hex digits of a v4 UUID, enough to
    /// avoid collisions between instances started from the same template.
    pub fn generate(prefix: &str) -> Result<Self, TypeError> {
        let uuid = Uuid::new_v4().simple().to_string();
        Self::new(format!("{prefix}-{}", &uuid[..8]))
    }
}

impl GroupName {
    /// The default sticky group.
    ///
    /// Every single-active service belongs to a group; services that do not
    /// declare one are placed here.
    pub fn default_group() -> Self {
        Self("default".to_string())
    }
}

// ============================================================================
// Coordination counters
// ============================================================================

/// Leadership epoch counter.
///
/// Strictly increases across successive leaders of a group: a new leader
/// that observed a prior record takes `prior + 1`, the very first leader
/// takes 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Self(term)
    }

    /// The term a leader takes when succeeding a record with this term.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Term> for u64 {
    fn from(term: Term) -> Self {
        term.0
    }
}

/// KV-store revision number.
///
/// Assigned by the store on every write; compare-and-swap proves ownership
/// by presenting the revision of the last write one has seen.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    pub fn new(revision: u64) -> Self {
        Self(revision)
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Revision> for u64 {
    fn from(revision: Revision) -> Self {
        revision.0
    }
}

// ============================================================================
// Registry records
// ============================================================================

/// Health/election status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Serving traffic. For single-active services this means the instance
    /// currently holds the leader record of its group.
    Active,
    /// Alive and registered, waiting to take over leadership.
    Standby,
    /// Alive but failing its self-check; excluded from discovery.
    Unhealthy,
    /// Gracefully stopping; written just before deregistration.
    Shutdown,
}

impl InstanceStatus {
    /// Whether discovery may hand this instance to callers.
    pub fn is_routable(self) -> bool {
        matches!(self, Self::Active | Self::Standby)
    }
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Standby => "STANDBY",
            Self::Unhealthy => "UNHEALTHY",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// One live service instance, as stored in the registry bucket.
///
/// The entry is written with a TTL of `heartbeat_interval × k` and refreshed
/// on every heartbeat; liveness is decided by entry expiry, never by
/// comparing `last_heartbeat` against a local clock (clock skew between
/// nodes makes timestamp arithmetic unreliable; the timestamp is advisory,
/// for operators).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Logical service this instance belongs to.
    pub service_name: ServiceName,
    /// Cluster-unique instance identifier.
    pub instance_id: InstanceId,
    /// Build/deploy version string.
    pub version: String,
    /// Current status as of the last heartbeat.
    pub status: InstanceStatus,
    /// Wall-clock time of the last heartbeat write (advisory).
    pub last_heartbeat: DateTime<Utc>,
    /// Sticky group, present on single-active services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_group: Option<GroupName>,
    /// Free-form instance metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    /// Creates a new registry entry in `Standby` status.
    pub fn new(
        service_name: ServiceName,
        instance_id: InstanceId,
        version: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            service_name,
            instance_id,
            version: version.into(),
            status: InstanceStatus::Standby,
            last_heartbeat: now,
            sticky_group: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Assigns the sticky group.
    pub fn with_sticky_group(mut self, group: GroupName) -> Self {
        self.sticky_group = Some(group);
        self
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Refreshes the entry for a heartbeat write.
    ///
    /// `last_heartbeat` is monotonically non-decreasing across updates by
    /// the same instance even if the local clock steps backwards.
    pub fn touch(&mut self, status: InstanceStatus, now: DateTime<Utc>) {
        self.status = status;
        self.last_heartbeat = self.last_heartbeat.max(now);
    }
}

// ============================================================================
// Election records
// ============================================================================

/// The single KV entry whose existence identifies the current leader of a
/// sticky-active group.
///
/// At most one record exists per group key at any instant: it is created
/// with an atomic create-if-absent, refreshed by compare-and-swap on its
/// revision, and reaped by TTL when the holder stops refreshing. The
/// KV-provided revision travels beside the record, not inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    /// Deterministic group key, `<service_name>.<sticky_group>`.
    pub group_key: String,
    /// Instance currently holding leadership.
    pub holder_id: InstanceId,
    /// Wall-clock time of acquisition (advisory).
    pub acquired_at: DateTime<Utc>,
    /// Leadership epoch; strictly increases across successive leaders.
    pub term: Term,
}

impl LeaderRecord {
    pub fn new(
        group_key: impl Into<String>,
        holder_id: InstanceId,
        term: Term,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            group_key: group_key.into(),
            holder_id,
            acquired_at: now,
            term,
        }
    }

    /// Builds the group key for a service/group pair.
    pub fn group_key_for(service: &ServiceName, group: &GroupName) -> String {
        format!("{service}.{group}")
    }
}

// ============================================================================
// Management-plane records
// ============================================================================

/// Declaration of a service that is allowed to register.
///
/// Written by the management plane, revision-tracked for optimistic
/// concurrency, never expired by TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Service name; also the KV key suffix.
    pub name: ServiceName,
    /// Owning team or person.
    pub owner: String,
    /// Human-readable description.
    pub description: String,
    /// Declared service version.
    pub version: String,
}

// ============================================================================
// RPC envelope
// ============================================================================

/// Error codes carried in RPC error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The called instance is not the active leader of its group.
    NotActive,
    /// The request was malformed; never retried.
    ValidationFailed,
    /// The addressed entity does not exist.
    NotFound,
    /// Optimistic concurrency conflict.
    Conflict,
    /// The operation timed out.
    Timeout,
    /// Unexpected server-side failure.
    Internal,
    /// No instance could serve the request.
    Unavailable,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotActive => "NOT_ACTIVE",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
        };
        f.write_str(s)
    }
}

/// Structured error carried in RPC replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ErrorEnvelope {
    /// Machine-readable error class.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional structured context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches structured context.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The reply a non-leader sends to a sticky call.
    ///
    /// Carries the caller-usable hint to rediscover the active instance.
    pub fn not_active(instance_id: &InstanceId) -> Self {
        Self::new(
            ErrorCode::NotActive,
            format!("instance {instance_id} is not the active leader"),
        )
        .with_details(serde_json::json!({ "hint": "retry with discovery" }))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

/// A single RPC request as published on `rpc.<service>.<instance>.<method>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Method name, matching the subject's last token.
    pub method: String,
    /// JSON request payload.
    pub payload: Value,
    /// Correlation id propagated into logs on both sides of the call.
    pub correlation_id: Uuid,
}

impl RpcRequest {
    /// Creates a request with a fresh correlation id.
    pub fn new(method: impl Into<String>, payload: Value) -> Self {
        Self {
            method: method.into(),
            payload,
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// A single RPC reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcReply {
    /// Successful call.
    Ok {
        /// JSON response payload.
        payload: Value,
    },
    /// Failed call.
    Error {
        /// Structured error envelope.
        error: ErrorEnvelope,
    },
}

impl RpcReply {
    pub fn ok(payload: Value) -> Self {
        Self::Ok { payload }
    }

    pub fn error(error: ErrorEnvelope) -> Self {
        Self::Error { error }
    }

    /// Collapses the reply into a `Result`.
    pub fn into_result(self) -> Result<Value, ErrorEnvelope> {
        match self {
            Self::Ok { payload } => Ok(payload),
            Self::Error { error } => Err(error),
        }
    }
}
