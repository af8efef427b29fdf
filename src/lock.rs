//! Single-device, best-effort mutual exclusion for queue drains.
//!
//! The lock is an advisory lease. A holder that stops renewing for longer
//! than the stale window loses it to the next caller, even if it is still
//! running. Two drains can therefore overlap after a takeover; this trades
//! safety for liveness after an app kill and is not a distributed mutex.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, UnixTimeMs};
use crate::error::StoreError;
use crate::store::{PersistedState, StoreKey};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted lock record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub session_id: SessionId,
    pub ts: UnixTimeMs,
}

impl Lease {
    #[must_use]
    pub fn new(session_id: SessionId, now: UnixTimeMs) -> Self {
        Self { session_id, ts: now }
    }

    #[must_use]
    pub fn is_stale(&self, now: UnixTimeMs, stale_ms: u64) -> bool {
        now.elapsed_since(self.ts) > stale_ms
    }

    #[must_use]
    pub fn is_held_by(&self, session: &SessionId) -> bool {
        &self.session_id == session
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Fresh,
    Reentered,
    /// Previous holder went quiet past the stale window.
    TookOver,
    Contended,
}

impl AcquireOutcome {
    #[must_use]
    pub const fn acquired(self) -> bool {
        !matches!(self, Self::Contended)
    }
}

/// Pure acquisition rule over the current record.
#[must_use]
pub fn evaluate(
    current: Option<&Lease>,
    session: &SessionId,
    now: UnixTimeMs,
    stale_ms: u64,
) -> AcquireOutcome {
    match current {
        None => AcquireOutcome::Fresh,
        Some(lease) if lease.is_stale(now, stale_ms) => AcquireOutcome::TookOver,
        Some(lease) if lease.is_held_by(session) => AcquireOutcome::Reentered,
        Some(_) => AcquireOutcome::Contended,
    }
}

pub struct ProcessingLock {
    state: Arc<PersistedState>,
    clock: Arc<dyn Clock>,
    stale_ms: u64,
}

impl ProcessingLock {
    pub fn new(state: Arc<PersistedState>, clock: Arc<dyn Clock>, stale_ms: u64) -> Self {
        Self {
            state,
            clock,
            stale_ms,
        }
    }

    /// Returns `false` when another live session holds the lock. That is a
    /// normal outcome, not an error.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn try_acquire(&self, session: &SessionId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let stale_ms = self.stale_ms;
        let outcome = self
            .state
            .modify(StoreKey::Lock, |record: &mut Option<Lease>| {
                let outcome = evaluate(record.as_ref(), session, now, stale_ms);
                if outcome.acquired() {
                    *record = Some(Lease::new(session.clone(), now));
                }
                Ok::<_, StoreError>(outcome)
            })
            .await?;

        match outcome {
            AcquireOutcome::Fresh | AcquireOutcome::Reentered => debug!("Lock acquired"),
            AcquireOutcome::TookOver => warn!("Took over stale processing lock"),
            AcquireOutcome::Contended => debug!("Lock held by another session"),
        }
        Ok(outcome.acquired())
    }

    /// Renew the lease. Returns `false` if the lock now belongs to someone else.
    pub async fn refresh(&self, session: &SessionId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        self.state
            .modify(StoreKey::Lock, |record: &mut Option<Lease>| {
                Ok(match record {
                    Some(lease) if lease.is_held_by(session) => {
                        lease.ts = now;
                        true
                    }
                    _ => false,
                })
            })
            .await
    }

    /// Drop the lock if this session still holds it.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn release(&self, session: &SessionId) -> Result<(), StoreError> {
        let released = self
            .state
            .modify(StoreKey::Lock, |record: &mut Option<Lease>| {
                let ours = record.as_ref().is_some_and(|l| l.is_held_by(session));
                if ours {
                    *record = None;
                }
                Ok::<_, StoreError>(ours)
            })
            .await?;
        if released {
            debug!("Lock released");
        } else {
            info!("Lock no longer ours at release");
        }
        Ok(())
    }

    pub async fn current(&self) -> Result<Option<Lease>, StoreError> {
        self.state.load(StoreKey::Lock).await
    }
}

// ============================================================================
// Session record
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounts {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub requeued_stuck: usize,
}

/// Diagnostics for the last drain attempt that held the lock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSession {
    pub id: SessionId,
    pub started_at: UnixTimeMs,
    #[serde(default)]
    pub finished_at: Option<UnixTimeMs>,
    #[serde(default)]
    pub counts: SessionCounts,
    #[serde(default)]
    pub cancelled: bool,
}

impl ProcessingSession {
    #[must_use]
    pub fn start(now: UnixTimeMs) -> Self {
        Self {
            id: SessionId::generate(),
            started_at: now,
            finished_at: None,
            counts: SessionCounts::default(),
            cancelled: false,
        }
    }
}
