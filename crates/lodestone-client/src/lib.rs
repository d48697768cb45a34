//! # lodestone-client: Sticky RPC client
//!
//! Routes calls to the currently active instance of a service and rides
//! out leadership changes transparently:
//!
//! 1. Ask discovery for the active instance.
//! 2. Send the RPC to `rpc.<service>.<instance>.<method>`.
//! 3. On `NOT_ACTIVE`, an RPC timeout or a transport error: invalidate the
//!    sticky cache, back off with jitter, retry, up to the attempt limit
//!    and within the overall deadline.
//!
//! Validation failures and business errors are never retried; only the
//! routing layer's own failure modes are.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use lodestone_bus::{Backoff, BusError, MessageBus, subject};
use lodestone_config::TimingConfig;
use lodestone_discovery::{DiscoveryError, ServiceDiscovery};
use lodestone_types::{ErrorCode, ErrorEnvelope, GroupName, RpcReply, RpcRequest, ServiceName};

#[cfg(test)]
mod tests;

/// Result type for client calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced to callers of the sticky client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every attempt failed with a retryable condition.
    #[error("service {service} unavailable after {attempts} attempts")]
    Unavailable {
        service: ServiceName,
        attempts: u32,
    },

    /// The overall deadline elapsed before any attempt succeeded.
    #[error("call deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The handler answered with a non-retryable error envelope.
    #[error(transparent)]
    Remote(ErrorEnvelope),

    /// A reply arrived but was not a valid envelope.
    #[error("failed to decode rpc reply: {0}")]
    Codec(#[from] serde_json::Error),

    /// Non-transient discovery failure.
    #[error(transparent)]
    Discovery(DiscoveryError),

    /// Non-transient transport failure.
    #[error(transparent)]
    Bus(BusError),
}

/// Sticky RPC client.
///
/// Cheap to clone; clones share the discovery cache.
#[derive(Clone)]
pub struct StickyClient {
    bus: Arc<dyn MessageBus>,
    discovery: ServiceDiscovery,
    per_call_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl StickyClient {
    pub fn new(bus: Arc<dyn MessageBus>, discovery: ServiceDiscovery, timing: &TimingConfig) -> Self {
        Self {
            bus,
            discovery,
            per_call_timeout: timing.rpc_timeout(),
            max_attempts: timing.rpc_max_attempts,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(1),
        }
    }

    /// The discovery client backing this client.
    pub fn discovery(&self) -> &ServiceDiscovery {
        &self.discovery
    }

    /// Calls the active instance, with the default overall deadline
    /// (`per_call_timeout × max_attempts`).
    pub async fn call_active(
        &self,
        service: &ServiceName,
        group: Option<&GroupName>,
        method: &str,
        payload: Value,
    ) -> ClientResult<Value> {
        let overall = self.per_call_timeout * self.max_attempts;
        self.call_active_with_deadline(service, group, method, payload, overall)
            .await
    }

    /// Calls the active instance; `overall` bounds total wall time
    /// including discovery, backoff and every retry.
    pub async fn call_active_with_deadline(
        &self,
        service: &ServiceName,
        group: Option<&GroupName>,
        method: &str,
        payload: Value,
        overall: Duration,
    ) -> ClientResult<Value> {
        let deadline = Instant::now() + overall;
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_cap);

        for attempt in 1..=self.max_attempts {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(ClientError::DeadlineExceeded(overall));
            };
            let Some(remaining) = non_zero(remaining) else {
                return Err(ClientError::DeadlineExceeded(overall));
            };

            match self.attempt(service, group, method, &payload, remaining).await? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Retry(reason) => {
                    debug!(
                        service = %service,
                        operation = method,
                        attempt,
                        reason = %reason,
                        "sticky call attempt failed, retrying"
                    );
                }
            }

            if attempt < self.max_attempts {
                let delay = backoff.next_delay();
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Err(ClientError::DeadlineExceeded(overall));
                };
                tokio::time::sleep(delay.min(remaining)).await;
            }
        }

        warn!(
            service = %service,
            operation = method,
            attempts = self.max_attempts,
            "sticky call exhausted its attempts"
        );
        Err(ClientError::Unavailable {
            service: service.clone(),
            attempts: self.max_attempts,
        })
    }

    /// Queue-group routed call: any one instance of the service answers.
    pub async fn call_any(
        &self,
        service: &ServiceName,
        method: &str,
        payload: Value,
    ) -> ClientResult<Value> {
        let request = RpcRequest::new(method, payload);
        let bytes = Bytes::from(serde_json::to_vec(&request)?);
        let reply = self
            .bus
            .rpc(
                &subject::rpc_any(service, method),
                bytes,
                self.per_call_timeout,
            )
            .await
            .map_err(ClientError::Bus)?;
        let reply: RpcReply = serde_json::from_slice(&reply)?;
        reply.into_result().map_err(ClientError::Remote)
    }

    /// One routing attempt: discover, call, classify the outcome.
    async fn attempt(
        &self,
        service: &ServiceName,
        group: Option<&GroupName>,
        method: &str,
        payload: &Value,
        remaining: Duration,
    ) -> ClientResult<Attempt> {
        let instance = match self.discovery.find_active(service, group).await {
            Ok(instance) => instance,
            Err(DiscoveryError::NoActiveInstance { .. }) => {
                return Ok(Attempt::Retry("no active instance visible"));
            }
            Err(error) if error.is_transient() => {
                return Ok(Attempt::Retry("discovery transport failure"));
            }
            Err(other) => return Err(ClientError::Discovery(other)),
        };

        let request = RpcRequest::new(method, payload.clone());
        let correlation_id = request.correlation_id;
        let bytes = Bytes::from(serde_json::to_vec(&request)?);
        let call_timeout = self.per_call_timeout.min(remaining);

        let reply = match self
            .bus
            .rpc(
                &subject::rpc_instance(service, &instance, method),
                bytes,
                call_timeout,
            )
            .await
        {
            Ok(reply) => reply,
            Err(error) if error.is_transient() => {
                // The instance we aimed at may be gone; make discovery
                // rediscover before the next attempt.
                debug!(
                    service = %service,
                    instance = %instance,
                    operation = method,
                    correlation_id = %correlation_id,
                    error = %error,
                    "rpc transport failure, invalidating sticky cache"
                );
                self.discovery.invalidate(service, group);
                return Ok(Attempt::Retry("rpc transport failure"));
            }
            Err(error) => return Err(ClientError::Bus(error)),
        };

        let reply: RpcReply = serde_json::from_slice(&reply)?;
        match reply.into_result() {
            Ok(value) => Ok(Attempt::Done(value)),
            Err(envelope) if envelope.code == ErrorCode::NotActive => {
                debug!(
                    service = %service,
                    instance = %instance,
                    operation = method,
                    correlation_id = %correlation_id,
                    "instance is not active, invalidating sticky cache"
                );
                self.discovery.invalidate(service, group);
                Ok(Attempt::Retry("instance not active"))
            }
            // Anything else is the handler talking to the caller;
            // retrying would not change the answer.
            Err(envelope) => Err(ClientError::Remote(envelope)),
        }
    }
}

enum Attempt {
    Done(Value),
    Retry(&'static str),
}

fn non_zero(d: Duration) -> Option<Duration> {
    (d > Duration::ZERO).then_some(d)
}
