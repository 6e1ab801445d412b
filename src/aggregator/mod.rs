//! Activity aggregator: the stateful core of a tracking session.
//!
//! `start` validates the session preconditions, seeds totals from the latest
//! persisted row and brings up both samplers. One session task then owns the
//! totals: it consumes the samplers' latest-value slots, counts steps and
//! distance, publishes snapshots and flushes at most once per flush interval.
//! `stop` detaches the samplers, joins the task and writes one final row.

pub mod listeners;
mod totals;

pub use listeners::{EventKind, Listener, ListenerHandle, ListenerRegistry, TrackerEvent};

use crate::auth::UserSession;
use crate::backend::SensorBackend;
use crate::clock::{self, Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::notify::{self, Notifier};
use crate::permissions::PermissionGate;
use crate::persistence::SnapshotStore;
use crate::sampler::{LocationSampler, MotionSampler, SamplerStatus};
use crate::types::{ActivitySnapshot, Capability, MotionSample, PositionFix};
use chrono::{DateTime, Local, NaiveDate, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use totals::SessionTotals;

/// External collaborators an aggregator is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub session: Arc<dyn UserSession>,
    pub store: Arc<dyn SnapshotStore>,
    pub gate: Arc<PermissionGate>,
    pub backend: Arc<dyn SensorBackend>,
    pub notifier: Arc<dyn Notifier>,
}

/// Point-in-time view of the tracker, serialised into `live_status.json`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackerStatus {
    pub recording: bool,
    pub user_id: Option<String>,
    pub session_started: Option<DateTime<Utc>>,
    pub snapshot: ActivitySnapshot,
    pub display_distance_km: f64,
    pub motion: SamplerStatus,
    pub location: SamplerStatus,
    pub motion_samples: u64,
    pub location_fixes: u64,
    pub flushes: u64,
    pub last_flush: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
struct SessionInfo {
    user_id: String,
    started_at: DateTime<Utc>,
}

struct ActiveSession {
    cancel: CancellationToken,
    task: JoinHandle<SessionTotals>,
    flusher: Flusher,
}

/// Writes one snapshot row and records the outcome.
#[derive(Clone)]
struct Flusher {
    user_id: String,
    device_label: String,
    store: Arc<dyn SnapshotStore>,
    notifier: Arc<dyn Notifier>,
    listeners: Arc<ListenerRegistry>,
    flushes: Arc<AtomicU64>,
    last_flush: Arc<Mutex<Option<DateTime<Utc>>>>,
    clock: Arc<dyn Clock>,
}

impl Flusher {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().with_timezone(&Utc)
    }

    /// Stamp for the row that closes `day`.
    fn closing_stamp(&self, day: NaiveDate) -> DateTime<Utc> {
        clock::end_of_day(day).unwrap_or_else(|| self.now())
    }

    async fn flush(&self, snapshot: ActivitySnapshot, recorded_at: DateTime<Utc>) -> TrackerResult<()> {
        self.store
            .insert_snapshot(&self.user_id, &snapshot, &self.device_label, recorded_at)
            .await?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_flush.lock() {
            *last = Some(recorded_at);
        }
        debug!(
            "[aggregator] flushed {} steps, {:.3} km",
            snapshot.steps, snapshot.distance_km
        );
        self.listeners.emit(&TrackerEvent::Flush {
            snapshot,
            recorded_at,
        });
        Ok(())
    }

    /// Failures are reported and swallowed; totals stay in memory until
    /// the next successful flush.
    async fn flush_best_effort(&self, snapshot: ActivitySnapshot, recorded_at: DateTime<Utc>) -> bool {
        match self.flush(snapshot, recorded_at).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[aggregator] flush failed, keeping totals in memory: {}", e);
                notify::report(self.notifier.as_ref(), &e);
                false
            }
        }
    }
}

pub struct ActivityAggregator {
    config: TrackerConfig,
    deps: Collaborators,
    motion: MotionSampler,
    location: LocationSampler,
    listeners: Arc<ListenerRegistry>,
    current: Arc<watch::Sender<ActivitySnapshot>>,
    recording: AtomicBool,
    flushes: Arc<AtomicU64>,
    last_flush: Arc<Mutex<Option<DateTime<Utc>>>>,
    info: RwLock<Option<SessionInfo>>,
    lifecycle: tokio::sync::Mutex<Option<ActiveSession>>,
    clock: Arc<dyn Clock>,
}

impl ActivityAggregator {
    pub fn new(config: &TrackerConfig, deps: Collaborators) -> Self {
        Self::with_clock(config, deps, Arc::new(SystemClock))
    }

    /// Like [`ActivityAggregator::new`] with the calendar day taken from
    /// `clock`.
    pub fn with_clock(config: &TrackerConfig, deps: Collaborators, clock: Arc<dyn Clock>) -> Self {
        let motion = MotionSampler::new(
            deps.backend.clone(),
            deps.gate.clone(),
            deps.notifier.clone(),
            config,
        );
        let location = LocationSampler::new(
            deps.backend.clone(),
            deps.gate.clone(),
            deps.notifier.clone(),
            config,
        );
        let (current, _) = watch::channel(ActivitySnapshot::default());
        Self {
            config: config.clone(),
            deps,
            motion,
            location,
            listeners: Arc::new(ListenerRegistry::new()),
            current: Arc::new(current),
            recording: AtomicBool::new(false),
            flushes: Arc::new(AtomicU64::new(0)),
            last_flush: Arc::new(Mutex::new(None)),
            info: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
            clock,
        }
    }

    /// Start a session. Returns false, after notifying, on any failed
    /// precondition; an already running session counts as success.
    pub async fn start(&self) -> bool {
        match self.try_start().await {
            Ok(()) => true,
            Err(TrackerError::AlreadyRunning) => {
                debug!("[aggregator] start ignored, already recording");
                true
            }
            Err(e) => {
                warn!("[aggregator] start failed: {}", e);
                notify::report(self.deps.notifier.as_ref(), &e);
                false
            }
        }
    }

    pub async fn try_start(&self) -> TrackerResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(TrackerError::AlreadyRunning);
        }

        let user_id = self
            .deps
            .session
            .user_id()
            .ok_or(TrackerError::NotAuthenticated)?;
        if !self.deps.backend.is_available() {
            return Err(TrackerError::UnsupportedRuntime);
        }
        let permissions = self.deps.gate.ensure_tracking().await;
        for capability in [Capability::Location, Capability::Motion] {
            if !permissions.get(capability) {
                return Err(TrackerError::PermissionDenied(capability));
            }
        }

        let today = self.clock.today();
        let seed = self.seed(&user_id).await;
        let totals = SessionTotals::seeded(seed, self.config.max_jump_km, today);
        self.current.send_replace(totals.snapshot());

        let motion_rx = self.motion.subscribe();
        let location_rx = self.location.subscribe();
        self.motion.try_start().await?;
        if let Err(e) = self.location.try_start().await {
            warn!("[aggregator] location failed to start, rolling back motion");
            self.motion.stop().await;
            return Err(e);
        }

        let flusher = Flusher {
            user_id: user_id.clone(),
            device_label: self.config.device_label.clone(),
            store: self.deps.store.clone(),
            notifier: self.deps.notifier.clone(),
            listeners: self.listeners.clone(),
            flushes: self.flushes.clone(),
            last_flush: self.last_flush.clone(),
            clock: self.clock.clone(),
        };
        let cancel = CancellationToken::new();
        let session = SessionTask {
            totals,
            flusher: flusher.clone(),
            listeners: self.listeners.clone(),
            current: self.current.clone(),
            flush_interval: self.config.flush_interval(),
            reset_daily: self.config.reset_daily,
        };
        let task = tokio::spawn(session.run(motion_rx, location_rx, cancel.clone()));

        *lifecycle = Some(ActiveSession {
            cancel,
            task,
            flusher,
        });
        if let Ok(mut info) = self.info.write() {
            *info = Some(SessionInfo {
                user_id: user_id.clone(),
                started_at: Utc::now(),
            });
        }
        self.recording.store(true, Ordering::SeqCst);
        self.listeners.emit(&TrackerEvent::Recording { active: true });
        info!(
            "[aggregator] recording for {} from {} steps, {:.3} km",
            user_id, seed.steps, seed.distance_km
        );
        Ok(())
    }

    /// Stop the session and write one final row. Returns true even when the
    /// final flush fails; a second call is a no-op.
    pub async fn stop(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(active) = lifecycle.take() else {
            debug!("[aggregator] stop ignored, not recording");
            return true;
        };

        if !self.motion.stop().await {
            warn!("[aggregator] motion sampler did not stop cleanly");
        }
        if !self.location.stop().await {
            warn!("[aggregator] location sampler did not stop cleanly");
        }

        active.cancel.cancel();
        let totals = match active.task.await {
            Ok(totals) => Some(totals),
            Err(e) => {
                error!("[aggregator] session task ended abnormally: {}", e);
                None
            }
        };

        self.recording.store(false, Ordering::SeqCst);
        if let Ok(mut info) = self.info.write() {
            *info = None;
        }

        // A session stopped after midnight closes the old day instead of
        // carrying its totals into the new one.
        let closed = match totals {
            Some(mut totals) if self.config.reset_daily => totals
                .roll_over(self.clock.today())
                .map(|closed| (closed, totals.snapshot())),
            _ => None,
        };
        let (row, recorded_at) = match closed {
            Some(((day, closing), fresh)) => {
                info!("[aggregator] day {} closed while stopping", day);
                self.current.send_replace(fresh);
                self.listeners.emit(&TrackerEvent::Snapshot(fresh));
                (closing, active.flusher.closing_stamp(day))
            }
            None => (*self.current.borrow(), active.flusher.now()),
        };
        active.flusher.flush_best_effort(row, recorded_at).await;
        self.listeners.emit(&TrackerEvent::Recording { active: false });
        info!(
            "[aggregator] stopped at {} steps, {:.2} km",
            row.steps,
            row.display_distance_km()
        );
        true
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn get_steps(&self) -> u64 {
        self.current.borrow().steps
    }

    pub fn get_distance(&self) -> f64 {
        self.current.borrow().distance_km
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        *self.current.borrow()
    }

    /// Latest snapshot as a watch; only the newest value is retained.
    pub fn subscribe(&self) -> watch::Receiver<ActivitySnapshot> {
        self.current.subscribe()
    }

    pub fn add_listener(
        &self,
        kind: EventKind,
        listener: impl Fn(&TrackerEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.listeners.add(kind, Arc::new(listener))
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    pub fn remove_all_listeners(&self) {
        self.listeners.clear();
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn motion_sampler(&self) -> &MotionSampler {
        &self.motion
    }

    pub fn location_sampler(&self) -> &LocationSampler {
        &self.location
    }

    /// True when a sampler gave up during the current session.
    pub fn has_failed_sampler(&self) -> bool {
        self.motion.status() == SamplerStatus::Failed
            || self.location.status() == SamplerStatus::Failed
    }

    pub fn status(&self) -> TrackerStatus {
        let info = self.info.read().ok().and_then(|i| i.clone());
        let snapshot = self.snapshot();
        TrackerStatus {
            recording: self.is_recording(),
            user_id: info.as_ref().map(|i| i.user_id.clone()),
            session_started: info.map(|i| i.started_at),
            snapshot,
            display_distance_km: snapshot.display_distance_km(),
            motion: self.motion.status(),
            location: self.location.status(),
            motion_samples: self.motion.sample_count(),
            location_fixes: self.location.sample_count(),
            flushes: self.flush_count(),
            last_flush: self.last_flush.lock().ok().and_then(|l| *l),
        }
    }

    /// Latest persisted totals for today, or zero. A failing store does not
    /// block the session.
    async fn seed(&self, user_id: &str) -> ActivitySnapshot {
        match self.deps.store.query_latest_snapshot(user_id).await {
            Ok(Some(row)) => {
                let row_day = row.recorded_at.with_timezone(&Local).date_naive();
                if self.config.reset_daily && row_day != self.clock.today() {
                    info!("[aggregator] latest row is from {}, starting the day at zero", row_day);
                    ActivitySnapshot::default()
                } else {
                    ActivitySnapshot::from_totals(row.snapshot.steps, row.snapshot.distance_km)
                }
            }
            Ok(None) => ActivitySnapshot::default(),
            Err(e) => {
                warn!("[aggregator] could not read latest snapshot: {}", e);
                notify::report(self.deps.notifier.as_ref(), &e);
                ActivitySnapshot::default()
            }
        }
    }
}

/// The single writer of a session's totals.
struct SessionTask {
    totals: SessionTotals,
    flusher: Flusher,
    listeners: Arc<ListenerRegistry>,
    current: Arc<watch::Sender<ActivitySnapshot>>,
    flush_interval: Duration,
    reset_daily: bool,
}

impl SessionTask {
    async fn run(
        mut self,
        mut motion_rx: watch::Receiver<Option<MotionSample>>,
        mut location_rx: watch::Receiver<Option<PositionFix>>,
        cancel: CancellationToken,
    ) -> SessionTotals {
        let mut flush_tick = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut motion_open = true;
        let mut location_open = true;
        let mut dirty = false;
        let mut pending_flush: Option<JoinHandle<bool>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                changed = motion_rx.changed(), if motion_open => {
                    if changed.is_err() {
                        motion_open = false;
                        continue;
                    }
                    let sample = *motion_rx.borrow_and_update();
                    if let Some(sample) = sample {
                        dirty |= self.on_motion(sample);
                    }
                }

                changed = location_rx.changed(), if location_open => {
                    if changed.is_err() {
                        location_open = false;
                        continue;
                    }
                    let fix = *location_rx.borrow_and_update();
                    if let Some(fix) = fix {
                        dirty |= self.on_fix(fix);
                    }
                }

                _ = flush_tick.tick() => {
                    if self.reset_daily {
                        if let Some((day, closing)) = self.totals.roll_over(self.flusher.clock.today()) {
                            info!("[aggregator] day rolled over to {}", self.totals.day());
                            let flusher = self.flusher.clone();
                            let recorded_at = flusher.closing_stamp(day);
                            pending_flush = Some(tokio::spawn(async move {
                                flusher.flush_best_effort(closing, recorded_at).await
                            }));
                            self.publish(self.totals.snapshot());
                            dirty = false;
                            continue;
                        }
                    }
                    if dirty {
                        let flusher = self.flusher.clone();
                        let snapshot = self.totals.snapshot();
                        let recorded_at = flusher.now();
                        pending_flush = Some(tokio::spawn(async move {
                            flusher.flush_best_effort(snapshot, recorded_at).await
                        }));
                        dirty = false;
                    }
                }
            }
        }

        if let Some(pending) = pending_flush {
            let _ = pending.await;
        }
        debug!("[aggregator] session task exiting");
        self.totals
    }

    fn on_motion(&mut self, sample: MotionSample) -> bool {
        if !self.totals.apply_motion(sample) {
            return false;
        }
        let snapshot = self.totals.snapshot();
        self.listeners.emit(&TrackerEvent::Step {
            steps: snapshot.steps,
        });
        self.publish(snapshot);
        true
    }

    fn on_fix(&mut self, fix: PositionFix) -> bool {
        let delta_km = self.totals.apply_fix(fix);
        if delta_km <= 0.0 {
            return false;
        }
        let snapshot = self.totals.snapshot();
        self.listeners.emit(&TrackerEvent::Distance {
            distance_km: snapshot.distance_km,
            delta_km,
        });
        self.publish(snapshot);
        true
    }

    fn publish(&self, snapshot: ActivitySnapshot) {
        self.current.send_replace(snapshot);
        self.listeners.emit(&TrackerEvent::Snapshot(snapshot));
    }
}
