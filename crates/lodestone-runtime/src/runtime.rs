//! The service runtime host.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use lodestone_bus::{
    Backoff, BusMessage, MessageBus, SubscribeMode, Subscription, subject,
};
use lodestone_config::{LodestoneConfig, TimingConfig};
use lodestone_election::{ElectionConfig, ElectionCoordinator, ElectionHandle, ElectionState};
use lodestone_kv::KvStore;
use lodestone_registry::{HeartbeatTask, ServiceRegistry};
use lodestone_types::{
    ErrorEnvelope, GroupName, InstanceId, InstanceStatus, RpcReply, RpcRequest, ServiceInstance,
    ServiceName,
};

use crate::handler::{HandlerResult, HandlerTable};
use crate::{LifecycleState, RuntimeError, RuntimeResult};

type SelfCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Builder for [`ServiceRuntime`].
///
/// Handlers and identity are fixed here; after
/// [`build`](ServiceRuntimeBuilder::build) the handler table is frozen.
pub struct ServiceRuntimeBuilder {
    bus: Arc<dyn MessageBus>,
    config: LodestoneConfig,
    service_name: Option<String>,
    instance_id: Option<String>,
    version: Option<String>,
    single_active: bool,
    sticky_group: Option<String>,
    metadata: BTreeMap<String, String>,
    self_check: Option<SelfCheck>,
    handlers: HandlerTable,
}

impl ServiceRuntimeBuilder {
    /// Overrides the service name from configuration.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Pins the instance id instead of generating one.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Overrides the version from configuration.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Makes this a single-active service: the runtime competes for
    /// leadership of its sticky group and only the leader serves RPCs.
    pub fn single_active(mut self) -> Self {
        self.single_active = true;
        self
    }

    /// Overrides the sticky group from configuration (single-active only).
    pub fn sticky_group(mut self, group: impl Into<String>) -> Self {
        self.sticky_group = Some(group.into());
        self
    }

    /// Attaches instance metadata published in registry entries.
    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Installs a health self-check sampled at every heartbeat; a `false`
    /// flips the registry status to `UNHEALTHY`.
    pub fn self_check(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.self_check = Some(Arc::new(check));
        self
    }

    /// Registers an RPC handler for `method`.
    pub fn handler<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.insert(method, handler);
        self
    }

    /// Validates identity and configuration and builds the runtime.
    pub fn build(self) -> RuntimeResult<ServiceRuntime> {
        self.config.validate()?;

        let service = ServiceName::new(
            self.service_name
                .unwrap_or_else(|| self.config.service.name.clone()),
        )?;
        let version = self
            .version
            .unwrap_or_else(|| self.config.service.version.clone());

        let group = if self.single_active {
            Some(GroupName::new(
                self.sticky_group
                    .unwrap_or_else(|| self.config.service.sticky_group.clone()),
            )?)
        } else {
            None
        };

        let instance_id = match self.instance_id {
            Some(id) => InstanceId::new(id)?,
            None => {
                // Instances of a sticky group share a prefix by convention
                // so routing subjects stay readable.
                let prefix = match &group {
                    Some(group) => format!("{service}-{group}"),
                    None => service.to_string(),
                };
                InstanceId::generate(&prefix)?
            }
        };

        let timing = self.config.timing.clone();
        let kv = KvStore::new(
            self.bus.clone(),
            self.config.bus.bucket.clone(),
            timing.kv_op_timeout(),
        );
        let registry = ServiceRegistry::new(kv.clone(), timing.registry_ttl());

        let (lifecycle, _) = watch::channel(LifecycleState::Initialized);

        Ok(ServiceRuntime {
            shared: Arc::new(Shared {
                bus: self.bus,
                kv,
                registry,
                service,
                instance_id,
                group,
                version,
                metadata: self.metadata,
                timing,
                handlers: self.handlers,
                self_check: self.self_check,
                lifecycle,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
            election: None,
            tasks: Vec::new(),
        })
    }
}

struct Shared {
    bus: Arc<dyn MessageBus>,
    kv: KvStore,
    registry: ServiceRegistry,
    service: ServiceName,
    instance_id: InstanceId,
    /// Present exactly when the service is single-active.
    group: Option<GroupName>,
    version: String,
    metadata: BTreeMap<String, String>,
    timing: TimingConfig,
    handlers: HandlerTable,
    self_check: Option<SelfCheck>,
    lifecycle: watch::Sender<LifecycleState>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// One running service instance.
pub struct ServiceRuntime {
    shared: Arc<Shared>,
    election: Option<ElectionHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceRuntime {
    /// Starts building a runtime on the given bus.
    pub fn builder(bus: Arc<dyn MessageBus>, config: LodestoneConfig) -> ServiceRuntimeBuilder {
        ServiceRuntimeBuilder {
            bus,
            config,
            service_name: None,
            instance_id: None,
            version: None,
            single_active: false,
            sticky_group: None,
            metadata: BTreeMap::new(),
            self_check: None,
            handlers: HandlerTable::default(),
        }
    }

    pub fn service_name(&self) -> &ServiceName {
        &self.shared.service
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.shared.instance_id
    }

    /// The sticky group, for single-active runtimes.
    pub fn sticky_group(&self) -> Option<&GroupName> {
        self.shared.group.as_ref()
    }

    /// A channel following every lifecycle transition.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.shared.lifecycle.subscribe()
    }

    /// The lifecycle state right now.
    pub fn current_state(&self) -> LifecycleState {
        *self.shared.lifecycle.borrow()
    }

    /// The election state channel, for single-active runtimes that have
    /// been started.
    pub fn election_state(&self) -> Option<watch::Receiver<ElectionState>> {
        self.election.as_ref().map(ElectionHandle::state)
    }

    /// Registers the instance, spawns the coordination loops and begins
    /// serving RPCs.
    pub async fn start(&mut self) -> RuntimeResult<()> {
        if *self.shared.lifecycle.borrow() != LifecycleState::Initialized {
            return Err(RuntimeError::AlreadyStarted);
        }
        self.shared
            .lifecycle
            .send_replace(LifecycleState::Starting);

        let shared = &self.shared;

        // Election first, so the heartbeat below can report the real state.
        let election_rx = match &shared.group {
            Some(group) => {
                let handle = ElectionCoordinator::spawn(
                    shared.kv.clone(),
                    ElectionConfig::from(&shared.timing),
                    shared.service.clone(),
                    group.clone(),
                    shared.instance_id.clone(),
                );
                let rx = handle.state();
                self.election = Some(handle);
                Some(rx)
            }
            None => None,
        };

        // Initial registry entry.
        let mut instance = ServiceInstance::new(
            shared.service.clone(),
            shared.instance_id.clone(),
            shared.version.clone(),
            Utc::now(),
        )
        .with_metadata(shared.metadata.clone());
        instance.sticky_group = shared.group.clone();
        instance.status = status_of(election_rx.as_ref(), shared.self_check.as_ref());
        shared.registry.register(&instance).await?;

        // Heartbeat loop, sampling election + health state at every tick.
        let status_fn: Arc<dyn Fn() -> InstanceStatus + Send + Sync> = {
            let election_rx = election_rx.clone();
            let self_check = shared.self_check.clone();
            Arc::new(move || status_of(election_rx.as_ref(), self_check.as_ref()))
        };
        self.tasks.push(
            HeartbeatTask::new(
                shared.registry.clone(),
                instance,
                shared.timing.heartbeat_interval(),
                status_fn,
                shared.cancel.clone(),
            )
            .spawn(),
        );

        // Lifecycle mirrors the election for single-active services.
        if let Some(rx) = &election_rx {
            self.tasks.push(tokio::spawn(mirror_election(
                rx.clone(),
                shared.lifecycle.clone(),
                shared.cancel.clone(),
            )));
        }

        // RPC dispatchers: one instance-addressed subscription per method,
        // plus a queue-group subscription for plain services.
        for method in shared.handlers.methods() {
            let instance_subject =
                subject::rpc_instance(&shared.service, &shared.instance_id, method);
            let sub = shared
                .bus
                .subscribe(&instance_subject, SubscribeMode::Broadcast)
                .await?;
            self.tasks.push(tokio::spawn(dispatch(
                self.shared.clone(),
                election_rx.clone(),
                instance_subject,
                SubscribeMode::Broadcast,
                sub,
            )));

            if shared.group.is_none() {
                let any_subject = subject::rpc_any(&shared.service, method);
                let mode = SubscribeMode::Compete {
                    queue_group: subject::rpc_queue_group(&shared.service),
                };
                let sub = shared.bus.subscribe(&any_subject, mode.clone()).await?;
                self.tasks.push(tokio::spawn(dispatch(
                    self.shared.clone(),
                    None,
                    any_subject,
                    mode,
                    sub,
                )));
            }
        }

        // Plain services serve as soon as their subscriptions are up;
        // single-active ones wait for the election to promote them.
        if election_rx.is_none() {
            self.shared.lifecycle.send_replace(LifecycleState::Active);
        }

        info!(
            service = %self.shared.service,
            instance = %self.shared.instance_id,
            single_active = self.shared.group.is_some(),
            "service instance started"
        );
        Ok(())
    }

    /// Graceful shutdown: stop accepting calls, drain in-flight handlers
    /// within the grace period, relinquish leadership, deregister.
    pub async fn shutdown(&mut self) -> RuntimeResult<()> {
        match *self.shared.lifecycle.borrow() {
            LifecycleState::Initialized => return Err(RuntimeError::NotStarted),
            LifecycleState::Stopping | LifecycleState::Stopped => return Ok(()),
            _ => {}
        }
        self.shared
            .lifecycle
            .send_replace(LifecycleState::Stopping);

        // Stop the loops. Dispatchers quit accepting; handlers already
        // running are tracked and get the grace period to finish.
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        let grace = self.shared.timing.shutdown_grace();
        if tokio::time::timeout(grace, self.shared.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                service = %self.shared.service,
                instance = %self.shared.instance_id,
                grace = ?grace,
                "in-flight handlers did not finish within the grace period"
            );
        }

        // Hand leadership over before disappearing from the registry.
        if let Some(election) = self.election.take() {
            election.shutdown().await;
        }

        // Final status write, then deregistration. Failures are logged and
        // ignored: the TTL cleans up after us either way.
        let mut parting = ServiceInstance::new(
            self.shared.service.clone(),
            self.shared.instance_id.clone(),
            self.shared.version.clone(),
            Utc::now(),
        );
        parting.sticky_group = self.shared.group.clone();
        parting.status = InstanceStatus::Shutdown;
        if let Err(error) = self.shared.registry.heartbeat(&parting).await {
            warn!(
                service = %self.shared.service,
                instance = %self.shared.instance_id,
                operation = "shutdown_status",
                error = %error,
                "failed to write SHUTDOWN status"
            );
        }
        if let Err(error) = self
            .shared
            .registry
            .deregister(&self.shared.service, &self.shared.instance_id)
            .await
        {
            warn!(
                service = %self.shared.service,
                instance = %self.shared.instance_id,
                operation = "deregister",
                error = %error,
                "failed to deregister"
            );
        }

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        self.shared.lifecycle.send_replace(LifecycleState::Stopped);
        info!(
            service = %self.shared.service,
            instance = %self.shared.instance_id,
            "service instance stopped"
        );
        Ok(())
    }

    /// Hard stop without relinquishment or deregistration.
    ///
    /// Models a crash: the leader record and registry entry are left to
    /// expire by TTL. Used by supervisors for fail-fast termination and by
    /// failover tests.
    pub async fn abort(&mut self) {
        if let Some(election) = self.election.take() {
            election.abort();
        }
        self.shared.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared.lifecycle.send_replace(LifecycleState::Stopped);
    }

    /// Publishes a service event on `events.<service>.<event>`.
    pub async fn publish_event(&self, event_name: &str, payload: &Value) -> RuntimeResult<()> {
        let bytes = serde_json::to_vec(payload).map_err(RuntimeError::Codec)?;
        self.shared
            .bus
            .publish(
                &subject::event(&self.shared.service, event_name),
                Bytes::from(bytes),
            )
            .await?;
        Ok(())
    }

    /// Subscribes to another service's events, in the chosen mode.
    pub async fn subscribe_event(
        &self,
        service: &ServiceName,
        event_name: &str,
        mode: SubscribeMode,
    ) -> RuntimeResult<Subscription> {
        Ok(self
            .shared
            .bus
            .subscribe(&subject::event(service, event_name), mode)
            .await?)
    }
}

/// Current registry status: self-check failure dominates, then the
/// election state, then plain-service ACTIVE.
fn status_of(
    election_rx: Option<&watch::Receiver<ElectionState>>,
    self_check: Option<&SelfCheck>,
) -> InstanceStatus {
    if let Some(check) = self_check {
        if !check() {
            return InstanceStatus::Unhealthy;
        }
    }
    match election_rx {
        Some(rx) => match *rx.borrow() {
            ElectionState::Active { .. } => InstanceStatus::Active,
            ElectionState::Standby => InstanceStatus::Standby,
            ElectionState::Stopped => InstanceStatus::Shutdown,
        },
        None => InstanceStatus::Active,
    }
}

/// Mirrors election transitions into the lifecycle channel.
async fn mirror_election(
    mut election_rx: watch::Receiver<ElectionState>,
    lifecycle: watch::Sender<LifecycleState>,
    cancel: CancellationToken,
) {
    loop {
        apply_election(&lifecycle, *election_rx.borrow());
        tokio::select! {
            () = cancel.cancelled() => return,
            changed = election_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

fn apply_election(lifecycle: &watch::Sender<LifecycleState>, election: ElectionState) {
    let target = match election {
        ElectionState::Active { .. } => LifecycleState::Active,
        ElectionState::Standby => LifecycleState::Standby,
        // Shutdown owns the terminal transitions.
        ElectionState::Stopped => return,
    };
    lifecycle.send_if_modified(|state| {
        let running = matches!(
            *state,
            LifecycleState::Starting | LifecycleState::Active | LifecycleState::Standby
        );
        if running && *state != target {
            *state = target;
            true
        } else {
            false
        }
    });
}

/// Consumes one subscription, spawning a tracked task per call.
///
/// A feed killed by the transport is re-established with backoff; calls
/// that raced the outage are lost, which is exactly the at-most-once
/// delivery the RPC layer's retries are built for.
async fn dispatch(
    shared: Arc<Shared>,
    election_rx: Option<watch::Receiver<ElectionState>>,
    subject_name: String,
    mode: SubscribeMode,
    mut sub: Subscription,
) {
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2));
    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => return,
            msg = sub.next() => match msg {
                Some(msg) => {
                    let shared = shared.clone();
                    let election_rx = election_rx.clone();
                    shared.tracker.clone().spawn(async move {
                        handle_call(shared, election_rx, msg).await;
                    });
                }
                None => {
                    // Transport drop; resubscribe until cancelled.
                    let delay = backoff.next_delay();
                    tokio::select! {
                        () = shared.cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                    match shared.bus.subscribe(&subject_name, mode.clone()).await {
                        Ok(new_sub) => {
                            sub = new_sub;
                            backoff.reset();
                        }
                        Err(error) => debug!(
                            subject = %subject_name,
                            error = %error,
                            "resubscribe failed, backing off"
                        ),
                    }
                }
            }
        }
    }
}

async fn handle_call(
    shared: Arc<Shared>,
    election_rx: Option<watch::Receiver<ElectionState>>,
    msg: BusMessage,
) {
    let request: RpcRequest = match serde_json::from_slice(&msg.payload) {
        Ok(request) => request,
        Err(error) => {
            debug!(
                service = %shared.service,
                instance = %shared.instance_id,
                subject = %msg.subject,
                error = %error,
                "rejecting malformed rpc request"
            );
            reply(
                &shared,
                msg.reply_to.as_deref(),
                RpcReply::error(ErrorEnvelope::validation("malformed rpc request")),
            )
            .await;
            return;
        }
    };

    // Single-active gate, checked on every call: only the current leader
    // answers, everyone else redirects the caller back to discovery.
    if let Some(rx) = &election_rx {
        if !rx.borrow().is_active() {
            debug!(
                service = %shared.service,
                instance = %shared.instance_id,
                operation = %request.method,
                correlation_id = %request.correlation_id,
                "rejecting call while not active"
            );
            reply(
                &shared,
                msg.reply_to.as_deref(),
                RpcReply::error(ErrorEnvelope::not_active(&shared.instance_id)),
            )
            .await;
            return;
        }
    }

    let Some(handler) = shared.handlers.get(&request.method) else {
        reply(
            &shared,
            msg.reply_to.as_deref(),
            RpcReply::error(ErrorEnvelope::not_found(format!(
                "unknown method: {}",
                request.method
            ))),
        )
        .await;
        return;
    };

    let correlation_id = request.correlation_id;
    let method = request.method.clone();
    let result = handler(request).await;
    if let Err(envelope) = &result {
        debug!(
            service = %shared.service,
            instance = %shared.instance_id,
            operation = %method,
            correlation_id = %correlation_id,
            code = %envelope.code,
            "handler returned error envelope"
        );
    }

    let wire_reply = match result {
        Ok(payload) => RpcReply::ok(payload),
        Err(envelope) => RpcReply::error(envelope),
    };
    reply(&shared, msg.reply_to.as_deref(), wire_reply).await;
}

async fn reply(shared: &Shared, reply_to: Option<&str>, reply: RpcReply) {
    let Some(reply_to) = reply_to else {
        // Fire-and-forget call; nothing to answer.
        return;
    };
    let Ok(bytes) = serde_json::to_vec(&reply) else {
        return;
    };
    if let Err(error) = shared.bus.publish(reply_to, Bytes::from(bytes)).await {
        warn!(
            service = %shared.service,
            instance = %shared.instance_id,
            operation = "rpc_reply",
            error = %error,
            "failed to publish rpc reply"
        );
    }
}
