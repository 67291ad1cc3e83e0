use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ide_core::model::ProgressId;
use storage::repository::{ProgressRepository, TimeSpentPatch};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::TrackerConfig;

const SECS_PER_MINUTE: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerStatus {
    Stopped,
    Running,
}

#[derive(Debug)]
struct TrackerState {
    status: TrackerStatus,
    record_id: Option<ProgressId>,
    seed_minutes: u32,
    ticks: u64,
    session: Duration,
    flushed_minutes: u32,
    in_flight_minutes: u32,
}

struct Shared {
    config: TrackerConfig,
    progress: Arc<dyn ProgressRepository>,
    state: Mutex<TrackerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Local session clock that pushes whole minutes to the progress record.
///
/// Every tick adds one tick period to the session total. Every
/// `flush_every` ticks, the minutes accumulated since the last successful
/// flush are sent without blocking the tick loop. A failed flush leaves
/// those minutes pending for the next one. Without a record id nothing is
/// sent.
#[derive(Clone)]
pub struct TimeTracker {
    shared: Arc<Shared>,
}

impl TimeTracker {
    /// A stopped tracker seeded with the record's accumulated minutes.
    #[must_use]
    pub fn new(
        config: TrackerConfig,
        progress: Arc<dyn ProgressRepository>,
        record_id: Option<ProgressId>,
        seed_minutes: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                progress,
                state: Mutex::new(TrackerState {
                    status: TrackerStatus::Stopped,
                    record_id,
                    seed_minutes,
                    ticks: 0,
                    session: Duration::ZERO,
                    flushed_minutes: 0,
                    in_flight_minutes: 0,
                }),
                task: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn status(&self) -> TrackerStatus {
        self.state().status
    }

    /// Ticks counted since mount.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.state().ticks
    }

    /// Time spent in this session.
    #[must_use]
    pub fn session_elapsed(&self) -> Duration {
        self.state().session
    }

    /// Seeded minutes plus this session's time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let state = self.state();
        Duration::from_secs(u64::from(state.seed_minutes) * SECS_PER_MINUTE) + state.session
    }

    /// Minutes the remote record is known to hold.
    #[must_use]
    pub fn remote_minutes(&self) -> u32 {
        let state = self.state();
        state.seed_minutes.saturating_add(state.flushed_minutes)
    }

    /// Give a tracker that started without a record somewhere to flush to.
    pub fn attach_record(&self, record_id: ProgressId) {
        let mut state = self.state();
        if state.record_id.is_none() {
            debug!(record = %record_id, "tracker attached to progress record");
            state.record_id = Some(record_id);
        }
    }

    /// Enter `Running` and drive ticks on `runtime`. No-op when running.
    pub fn start(&self, runtime: &Handle) {
        {
            let mut state = self.state();
            if state.status == TrackerStatus::Running {
                return;
            }
            state.status = TrackerStatus::Running;
        }

        let tracker = self.clone();
        let period = self.shared.config.tick;
        let flush_runtime = runtime.clone();
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Some((record_id, minutes)) = tracker.tick() {
                    let flusher = tracker.clone();
                    flush_runtime.spawn(async move { flusher.flush(record_id, minutes).await });
                }
            }
        });

        let mut slot = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Enter `Stopped` and cancel the tick loop. Issues no final flush.
    pub fn stop(&self) {
        self.state().status = TrackerStatus::Stopped;
        let task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Count one tick. Returns the flush to issue when this tick lands on a
    /// flush boundary and whole minutes are pending.
    pub fn tick(&self) -> Option<(ProgressId, u32)> {
        let mut state = self.state();
        if state.status != TrackerStatus::Running {
            return None;
        }
        state.ticks += 1;
        state.session += self.shared.config.tick;

        let flush_every = u64::from(self.shared.config.flush_every.max(1));
        if state.ticks % flush_every != 0 {
            return None;
        }
        let record_id = state.record_id.clone()?;
        let total = u32::try_from(state.session.as_secs() / SECS_PER_MINUTE).unwrap_or(u32::MAX);
        let pending = total
            .saturating_sub(state.flushed_minutes)
            .saturating_sub(state.in_flight_minutes);
        if pending == 0 {
            return None;
        }
        state.in_flight_minutes += pending;
        Some((record_id, pending))
    }

    /// Send `minutes` to the record. Failure is logged and the minutes stay
    /// pending.
    pub async fn flush(&self, record_id: ProgressId, minutes: u32) {
        let result = self
            .shared
            .progress
            .update_time_spent(&record_id, &TimeSpentPatch::minutes(minutes))
            .await;

        let mut state = self.state();
        state.in_flight_minutes = state.in_flight_minutes.saturating_sub(minutes);
        match result {
            Ok(()) => {
                state.flushed_minutes = state.flushed_minutes.saturating_add(minutes);
                debug!(record = %record_id, minutes, "time flushed");
            }
            Err(err) => warn!(%err, record = %record_id, minutes, "time flush failed"),
        }
    }
}
