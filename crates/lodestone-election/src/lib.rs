//! # lodestone-election: Sticky single-active leader election
//!
//! Exactly one instance per `(service, sticky_group)` holds leadership at
//! any instant. Leadership is a single KV entry (`sticky-active.<service>.
//! <group>`) created with an atomic create-if-absent, refreshed by CAS on
//! its revision, and reaped by TTL when the holder goes silent.
//!
//! Per-instance state machine:
//!
//! ```text
//!         start
//!           │
//!           ▼
//!      ┌─STANDBY─┐     create succeeds
//!      │         ├──────────────────────────► ACTIVE
//!      │         │                              │
//!      │         │◄─────────────────────────────┤ renewal CAS superseded
//!      │         │                              │  or renewals keep failing
//!      │         │ watch: leader key gone       │
//!      │         │◄─────────────────────────────┤
//!      └────┬────┘                              │
//!           │ shutdown                          │ shutdown (delete key)
//!           ▼                                   ▼
//!        STOPPED                             STOPPED
//! ```
//!
//! The coordinator never keeps serving as ACTIVE while uncertain about
//! ownership: a failed or superseded renewal demotes first and re-competes
//! after. Safety over liveness.

use std::time::Duration;

use lodestone_config::TimingConfig;
use lodestone_types::Term;

mod coordinator;

pub use coordinator::{ElectionCoordinator, ElectionHandle};

/// Observable state of one election participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElectionState {
    /// Watching the leader key, ready to take over.
    #[default]
    Standby,
    /// Holding the leader record.
    Active {
        /// Leadership epoch of the held record.
        term: Term,
    },
    /// The coordinator has shut down.
    Stopped,
}

impl ElectionState {
    /// Whether this instance currently holds leadership.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// The held term, when active.
    pub fn term(self) -> Option<Term> {
        match self {
            Self::Active { term } => Some(term),
            _ => None,
        }
    }
}

/// Election timing parameters.
///
/// Configuration validation guarantees `leader_ttl > heartbeat_interval`
/// and `renewal_interval ≤ leader_ttl / 2`.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// TTL stamped on the leader record by create and every renewal.
    pub leader_ttl: Duration,
    /// Cadence of renewal CAS writes while active.
    pub renewal_interval: Duration,
    /// Safety-net poll cadence while standby (watches can miss events
    /// across reconnections).
    pub standby_poll_interval: Duration,
    /// Consecutive transient renewal failures tolerated before
    /// self-demotion.
    pub max_renewal_failures: u32,
    /// Base delay for transient-failure backoff.
    pub retry_backoff_base: Duration,
    /// Cap for transient-failure backoff.
    pub retry_backoff_cap: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for ElectionConfig {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            leader_ttl: timing.leader_ttl(),
            renewal_interval: timing.renewal_interval(),
            standby_poll_interval: timing.standby_poll_interval(),
            max_renewal_failures: 3,
            retry_backoff_base: Duration::from_millis(50),
            retry_backoff_cap: Duration::from_millis(400),
        }
    }
}
