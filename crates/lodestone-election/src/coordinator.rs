//! The election coordinator task.

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lodestone_bus::{Backoff, KvOp};
use lodestone_kv::{CreateOutcome, KvStore, UpdateOutcome, decode, keys};
use lodestone_types::{GroupName, InstanceId, LeaderRecord, Revision, ServiceName, Term};

use crate::{ElectionConfig, ElectionState};

/// A held leadership: the record we wrote and the revision proving it.
struct Held {
    record: LeaderRecord,
    revision: Revision,
}

/// Handle on a running election coordinator.
pub struct ElectionHandle {
    state_rx: watch::Receiver<ElectionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ElectionHandle {
    /// A channel following every state transition.
    pub fn state(&self) -> watch::Receiver<ElectionState> {
        self.state_rx.clone()
    }

    /// The state right now.
    pub fn current(&self) -> ElectionState {
        *self.state_rx.borrow()
    }

    /// Stops the coordinator, relinquishing leadership if held.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }

    /// Kills the coordinator without relinquishing.
    ///
    /// Models a crash: a held leader record is left to expire by TTL.
    /// Used by fail-fast supervisors and failover tests.
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Competes for leadership of one sticky group.
pub struct ElectionCoordinator {
    kv: KvStore,
    config: ElectionConfig,
    service: ServiceName,
    group: GroupName,
    instance_id: InstanceId,
    leader_key: String,
    group_key: String,
    state_tx: watch::Sender<ElectionState>,
    cancel: CancellationToken,
    /// Highest term seen in any leader record, from reads and watch
    /// events. A takeover writes `last_observed_term + 1`.
    last_observed_term: Option<Term>,
    held: Option<Held>,
}

impl ElectionCoordinator {
    /// Spawns a coordinator for `instance_id` in `(service, group)`.
    pub fn spawn(
        kv: KvStore,
        config: ElectionConfig,
        service: ServiceName,
        group: GroupName,
        instance_id: InstanceId,
    ) -> ElectionHandle {
        let (state_tx, state_rx) = watch::channel(ElectionState::Standby);
        let cancel = CancellationToken::new();

        let coordinator = Self {
            leader_key: keys::leader(&service, &group),
            group_key: LeaderRecord::group_key_for(&service, &group),
            kv,
            config,
            service,
            group,
            instance_id,
            state_tx,
            cancel: cancel.clone(),
            last_observed_term: None,
            held: None,
        };

        let task = tokio::spawn(coordinator.run());
        ElectionHandle {
            state_rx,
            cancel,
            task,
        }
    }

    async fn run(mut self) {
        while !self.cancel.is_cancelled() {
            if self.held.is_some() {
                self.active_cycle().await;
            } else {
                self.standby_cycle().await;
            }
        }
        self.relinquish().await;
        self.state_tx.send_replace(ElectionState::Stopped);
    }

    // ------------------------------------------------------------------
    // STANDBY
    // ------------------------------------------------------------------

    /// One standby stretch: watch the leader key, attempt acquisition when
    /// it vanishes, and poll as a safety net against missed watch events.
    ///
    /// Returns when leadership is won, the watch dies, or shutdown starts.
    async fn standby_cycle(&mut self) {
        // Establish the watch before probing so no deletion can fall into
        // the gap between the read and the first watch event.
        let mut watch = match self.kv.watch(&self.leader_key).await {
            Ok(watch) => watch,
            Err(error) => {
                warn!(
                    service = %self.service,
                    instance = %self.instance_id,
                    operation = "watch_leader",
                    error = %error,
                    "failed to open leader watch, backing off"
                );
                self.idle(self.config.retry_backoff_cap).await;
                return;
            }
        };

        if self.try_acquire().await {
            return;
        }

        let mut poll = interval_at(
            Instant::now() + self.config.standby_poll_interval,
            self.config.standby_poll_interval,
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                event = watch.next() => match event {
                    Some(event) => match event.op {
                        KvOp::Put => {
                            if let Some(value) = &event.value {
                                match decode::<LeaderRecord>(&event.key, value) {
                                    Ok(record) => self.observe_term(record.term),
                                    Err(error) => debug!(
                                        key = %event.key,
                                        error = %error,
                                        "ignoring unparseable leader record"
                                    ),
                                }
                            }
                        }
                        KvOp::Delete | KvOp::Purge => {
                            debug!(
                                service = %self.service,
                                instance = %self.instance_id,
                                "leader key vanished, attempting acquisition"
                            );
                            if self.try_acquire().await {
                                return;
                            }
                        }
                    },
                    // The transport dropped the feed; re-enter standby to
                    // re-establish it (and re-probe, covering anything the
                    // dead watch missed).
                    None => {
                        self.idle(self.config.retry_backoff_cap).await;
                        return;
                    }
                },
                _ = poll.tick() => {
                    if self.try_acquire().await {
                        return;
                    }
                }
            }
        }
    }

    /// One acquisition attempt. Returns `true` when leadership was won.
    async fn try_acquire(&mut self) -> bool {
        // Learn the incumbent's term first; an existing record means
        // standing by, not contending.
        match self.kv.get::<LeaderRecord>(&self.leader_key).await {
            Ok(Some(entry)) => {
                self.observe_term(entry.value.term);
                return false;
            }
            Ok(None) => {}
            Err(error) => {
                warn!(
                    service = %self.service,
                    instance = %self.instance_id,
                    operation = "read_leader",
                    error = %error,
                    "failed to read leader record"
                );
                return false;
            }
        }

        let term = self.last_observed_term.map_or(Term::new(0), Term::next);
        let record = LeaderRecord::new(
            self.group_key.clone(),
            self.instance_id.clone(),
            term,
            Utc::now(),
        );

        match self
            .kv
            .create(&self.leader_key, &record, Some(self.config.leader_ttl))
            .await
        {
            Ok(CreateOutcome::Created(revision)) => {
                info!(
                    service = %self.service,
                    group = %self.group,
                    instance = %self.instance_id,
                    term = %term,
                    "acquired leadership"
                );
                self.observe_term(term);
                self.held = Some(Held { record, revision });
                self.state_tx.send_replace(ElectionState::Active { term });
                true
            }
            Ok(CreateOutcome::AlreadyExists) => {
                debug!(
                    service = %self.service,
                    instance = %self.instance_id,
                    "lost acquisition race, standing by"
                );
                false
            }
            Err(error) => {
                warn!(
                    service = %self.service,
                    instance = %self.instance_id,
                    operation = "acquire_leader",
                    error = %error,
                    "acquisition attempt failed"
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // ACTIVE
    // ------------------------------------------------------------------

    /// One leadership stretch: renew the record ahead of its TTL until
    /// superseded, persistently failing, or shut down.
    async fn active_cycle(&mut self) {
        let mut renew = interval_at(
            Instant::now() + self.config.renewal_interval,
            self.config.renewal_interval,
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = renew.tick() => {
                    if !self.renew_once().await {
                        return;
                    }
                }
            }
        }
    }

    /// One renewal, with bounded retries on transient transport failures.
    ///
    /// Returns `false` after demoting to standby.
    async fn renew_once(&mut self) -> bool {
        let (record, revision) = match &self.held {
            Some(held) => (held.record.clone(), held.revision),
            None => return false,
        };

        let mut backoff = Backoff::new(
            self.config.retry_backoff_base,
            self.config.retry_backoff_cap,
        );

        loop {
            match self
                .kv
                .update(
                    &self.leader_key,
                    &record,
                    revision,
                    Some(self.config.leader_ttl),
                )
                .await
            {
                Ok(UpdateOutcome::Updated(revision)) => {
                    if let Some(held) = self.held.as_mut() {
                        held.revision = revision;
                    }
                    return true;
                }
                Ok(UpdateOutcome::Superseded) => {
                    // Another instance owns the key now (or it expired and
                    // was re-created). We are no longer the leader.
                    warn!(
                        service = %self.service,
                        group = %self.group,
                        instance = %self.instance_id,
                        operation = "renew_leader",
                        "leadership superseded, demoting to standby"
                    );
                    self.demote();
                    return false;
                }
                Err(error) if error.is_transient() => {
                    if backoff.attempts() >= self.config.max_renewal_failures {
                        // Ownership is uncertain; stop claiming it.
                        warn!(
                            service = %self.service,
                            group = %self.group,
                            instance = %self.instance_id,
                            operation = "renew_leader",
                            error = %error,
                            "renewal kept failing, self-demoting"
                        );
                        self.demote();
                        return false;
                    }
                    let delay = backoff.next_delay();
                    if self.cancel.is_cancelled() {
                        return false;
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    warn!(
                        service = %self.service,
                        group = %self.group,
                        instance = %self.instance_id,
                        operation = "renew_leader",
                        error = %error,
                        "renewal failed, self-demoting"
                    );
                    self.demote();
                    return false;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn demote(&mut self) {
        self.held = None;
        self.state_tx.send_replace(ElectionState::Standby);
    }

    fn observe_term(&mut self, term: Term) {
        self.last_observed_term = Some(self.last_observed_term.map_or(term, |t| t.max(term)));
    }

    /// Best-effort graceful relinquishment: delete the record we hold,
    /// guarded by our revision so a successor's record is never deleted.
    async fn relinquish(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };

        match self.kv.delete(&self.leader_key, Some(held.revision)).await {
            Ok(()) => info!(
                service = %self.service,
                group = %self.group,
                instance = %self.instance_id,
                "relinquished leadership"
            ),
            // TTL reaps the record shortly; shutdown continues regardless.
            Err(error) => warn!(
                service = %self.service,
                group = %self.group,
                instance = %self.instance_id,
                operation = "relinquish_leader",
                error = %error,
                "failed to delete leader record on shutdown"
            ),
        }
    }

    /// Sleeps unless shutdown is already in progress.
    async fn idle(&self, duration: std::time::Duration) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(duration) => {}
        }
    }
}
