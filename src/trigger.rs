//! Turns connectivity and lifecycle events into debounced drains.
//!
//! Events only schedule work. The host pushes them through a
//! [`TriggerHandle`] without waiting, and bursts collapse into one drain.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TriggerConfig;
use crate::network::Connectivity;
use crate::processor::{DrainOutcome, QueueProcessor};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppLifecycle {
    Foreground,
    Background,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEvent {
    ConnectivityChanged { online: bool },
    AppStateChanged { state: AppLifecycle },
    Manual,
}

/// Sender side given to the host.
#[derive(Clone, Debug)]
pub struct TriggerHandle {
    tx: mpsc::Sender<TriggerEvent>,
}

impl TriggerHandle {
    /// Never blocks. When the channel is full a drain is already pending,
    /// so the event is dropped.
    pub fn notify(&self, event: TriggerEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!(error = %e, "Trigger event dropped");
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TriggerStats {
    pub drains: usize,
    pub contended: usize,
    pub skipped_offline: usize,
    pub errors: usize,
}

pub struct SyncTrigger {
    processor: Arc<QueueProcessor>,
    connectivity: Arc<dyn Connectivity>,
    config: TriggerConfig,
}

impl SyncTrigger {
    pub const CHANNEL_CAPACITY: usize = 32;

    pub fn new(
        processor: Arc<QueueProcessor>,
        connectivity: Arc<dyn Connectivity>,
        config: TriggerConfig,
    ) -> Self {
        Self {
            processor,
            connectivity,
            config,
        }
    }

    #[must_use]
    pub fn channel() -> (TriggerHandle, mpsc::Receiver<TriggerEvent>) {
        let (tx, rx) = mpsc::channel(Self::CHANNEL_CAPACITY);
        (TriggerHandle { tx }, rx)
    }

    /// Runs until `cancel` fires or every handle is dropped.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<TriggerEvent>,
        cancel: CancellationToken,
    ) -> TriggerStats {
        let mut stats = TriggerStats::default();
        let mut deadline: Option<Instant> = None;
        let mut foreground = true;
        let mut ticker = self.config.interval().map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        info!(
            debounce_ms = self.config.debounce_ms,
            interval_ms = self.config.interval_ms,
            "Sync trigger started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if self.schedules_drain(event, &mut foreground) {
                        deadline = Some(Instant::now() + self.config.debounce());
                    }
                }
                () = wait_until(deadline) => {
                    deadline = None;
                    self.fire(&cancel, &mut stats).await;
                }
                () = tick(&mut ticker), if foreground => {
                    deadline.get_or_insert_with(|| Instant::now() + self.config.debounce());
                }
            }
        }

        info!(drains = stats.drains, "Sync trigger stopped");
        stats
    }

    fn schedules_drain(&self, event: TriggerEvent, foreground: &mut bool) -> bool {
        debug!(?event, "Trigger event");
        match event {
            TriggerEvent::ConnectivityChanged { online } => online,
            TriggerEvent::AppStateChanged { state } => {
                *foreground = state == AppLifecycle::Foreground;
                *foreground
            }
            TriggerEvent::Manual => true,
        }
    }

    async fn fire(&self, cancel: &CancellationToken, stats: &mut TriggerStats) {
        if !self.connectivity.is_connected().await {
            stats.skipped_offline += 1;
            debug!("Offline, drain skipped");
            return;
        }
        match self.processor.drain_with(cancel).await {
            Ok(DrainOutcome::Completed(_)) => stats.drains += 1,
            Ok(DrainOutcome::Contended) => stats.contended += 1,
            Err(e) => {
                stats.errors += 1;
                warn!(error = %e, "Triggered drain failed");
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
