//! Motion and location samplers.
//!
//! Both share one feed core: permission and runtime checks, one active
//! listener at a time, a latest-value slot (`watch`) instead of a queue, and a
//! single task that owns the listener together with its recovery timers.
//! Cancelling that task is what stops a session from being revived by a late
//! self-heal or watchdog tick.

pub mod location;
pub mod motion;
pub mod watchdog;

pub use location::LocationSampler;
pub use motion::MotionSampler;

use crate::backend::SensorBackend;
use crate::error::{TrackerError, TrackerResult};
use crate::notify::{self, Notifier};
use crate::permissions::PermissionGate;
use crate::types::SensorKind;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use watchdog::{StaleWatchdog, Verdict};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerStatus {
    Stopped,
    Running,
    /// Gave up after recovery was exhausted; needs an explicit restart.
    Failed,
}

pub(crate) type FeedOpener<T> =
    Arc<dyn Fn() -> BoxFuture<'static, TrackerResult<mpsc::Receiver<T>>> + Send + Sync>;
pub(crate) type InitialReader<T> = Arc<dyn Fn() -> BoxFuture<'static, TrackerResult<T>> + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub(crate) struct WatchdogPolicy {
    pub period: Duration,
    pub stale_after: Duration,
    pub max_strikes: u32,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct FeedPolicy {
    pub first_sample_check: Duration,
    pub watchdog: Option<WatchdogPolicy>,
    pub initial_timeout: Duration,
}

struct RunningFeed {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningFeed {
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("[sampler] feed task panicked: {}", e);
            }
        }
    }
}

/// State shared between a sampler and its feed task.
struct FeedContext<T> {
    sensor: SensorKind,
    opener: FeedOpener<T>,
    notifier: Arc<dyn Notifier>,
    latest: Arc<watch::Sender<Option<T>>>,
    status: Arc<watch::Sender<SamplerStatus>>,
    samples: Arc<AtomicU64>,
    policy: FeedPolicy,
}

impl<T> FeedContext<T> {
    async fn reattach(&self) -> TrackerResult<mpsc::Receiver<T>> {
        let feed = (self.opener)().await?;
        info!("[{}] listener re-attached", self.sensor);
        Ok(feed)
    }

    fn fail(&self, err: TrackerError) {
        error!("[{}] giving up: {}", self.sensor, err);
        self.status.send_replace(SamplerStatus::Failed);
        notify::report(self.notifier.as_ref(), &err);
    }
}

pub(crate) struct FeedSampler<T> {
    sensor: SensorKind,
    backend: Arc<dyn SensorBackend>,
    gate: Arc<PermissionGate>,
    notifier: Arc<dyn Notifier>,
    opener: FeedOpener<T>,
    initial: Option<InitialReader<T>>,
    policy: FeedPolicy,
    latest: Arc<watch::Sender<Option<T>>>,
    status: Arc<watch::Sender<SamplerStatus>>,
    samples: Arc<AtomicU64>,
    running: tokio::sync::Mutex<Option<RunningFeed>>,
}

impl<T> FeedSampler<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        sensor: SensorKind,
        backend: Arc<dyn SensorBackend>,
        gate: Arc<PermissionGate>,
        notifier: Arc<dyn Notifier>,
        opener: FeedOpener<T>,
        initial: Option<InitialReader<T>>,
        policy: FeedPolicy,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        let (status, _) = watch::channel(SamplerStatus::Stopped);
        Self {
            sensor,
            backend,
            gate,
            notifier,
            opener,
            initial,
            policy,
            latest: Arc::new(latest),
            status: Arc::new(status),
            samples: Arc::new(AtomicU64::new(0)),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) async fn start(&self) -> bool {
        match self.try_start().await {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] start failed: {}", self.sensor, e);
                notify::report(self.notifier.as_ref(), &e);
                false
            }
        }
    }

    pub(crate) async fn try_start(&self) -> TrackerResult<()> {
        let capability = self.sensor.capability();
        if !self.gate.check().await.get(capability) {
            return Err(TrackerError::PermissionDenied(capability));
        }
        if !self.backend.is_available() {
            return Err(TrackerError::UnsupportedRuntime);
        }

        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            debug!("[{}] replacing active listener", self.sensor);
            previous.shutdown().await;
        }
        self.latest.send_replace(None);

        if let Some(read_initial) = &self.initial {
            match timeout(self.policy.initial_timeout, read_initial()).await {
                Ok(Ok(reading)) => {
                    self.latest.send_replace(Some(reading));
                }
                Ok(Err(e)) => warn!("[{}] initial reading failed: {}", self.sensor, e),
                Err(_) => warn!(
                    "[{}] no initial reading within {:?}, continuing with watch",
                    self.sensor, self.policy.initial_timeout
                ),
            }
        }

        let feed = match (self.opener)().await {
            Ok(feed) => feed,
            Err(first) => {
                warn!("[{}] attach failed ({}), retrying once", self.sensor, first);
                match (self.opener)().await {
                    Ok(feed) => feed,
                    Err(e) => {
                        self.status.send_replace(SamplerStatus::Failed);
                        return Err(e);
                    }
                }
            }
        };

        let cancel = CancellationToken::new();
        let ctx = FeedContext {
            sensor: self.sensor,
            opener: self.opener.clone(),
            notifier: self.notifier.clone(),
            latest: self.latest.clone(),
            status: self.status.clone(),
            samples: self.samples.clone(),
            policy: self.policy,
        };
        self.status.send_replace(SamplerStatus::Running);
        let task = tokio::spawn(run_feed(ctx, feed, cancel.clone()));
        *running = Some(RunningFeed { cancel, task });
        info!("[{}] listener attached", self.sensor);
        Ok(())
    }

    /// Detach the listener. Always safe, including when already stopped.
    pub(crate) async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        if let Some(feed) = running.take() {
            feed.shutdown().await;
            info!("[{}] listener detached", self.sensor);
        }
        self.status.send_replace(SamplerStatus::Stopped);
        true
    }

    pub(crate) fn latest(&self) -> Option<T> {
        self.latest.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.latest.subscribe()
    }

    pub(crate) fn status(&self) -> SamplerStatus {
        *self.status.borrow()
    }

    pub(crate) fn status_updates(&self) -> watch::Receiver<SamplerStatus> {
        self.status.subscribe()
    }

    pub(crate) fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

/// Owns one attached feed: forwards readings into the latest slot, runs the
/// one-shot first-sample check and, when configured, the stale watchdog.
async fn run_feed<T>(ctx: FeedContext<T>, mut feed: mpsc::Receiver<T>, cancel: CancellationToken)
where
    T: Clone + Send + Sync + 'static,
{
    let sensor = ctx.sensor;
    let mut received_since_attach = 0u64;
    let mut closed_in_a_row = 0u32;

    let first_sample_check = sleep(ctx.policy.first_sample_check);
    tokio::pin!(first_sample_check);
    let mut check_pending = true;

    let (period, mut dog) = match ctx.policy.watchdog {
        Some(p) => (p.period, Some(StaleWatchdog::new(p.stale_after, p.max_strikes))),
        None => (Duration::from_secs(3600), None),
    };
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            reading = feed.recv() => match reading {
                Some(reading) => {
                    received_since_attach += 1;
                    closed_in_a_row = 0;
                    if let Some(dog) = dog.as_mut() {
                        dog.record_sample();
                    }
                    ctx.samples.fetch_add(1, Ordering::Relaxed);
                    ctx.latest.send_replace(Some(reading));
                }
                None => {
                    closed_in_a_row += 1;
                    if closed_in_a_row > 1 {
                        ctx.fail(TrackerError::attach(sensor, "feed keeps closing"));
                        break;
                    }
                    warn!("[{}] feed closed by backend, re-attaching", sensor);
                    match ctx.reattach().await {
                        Ok(fresh) => {
                            feed = fresh;
                            received_since_attach = 0;
                        }
                        Err(e) => {
                            ctx.fail(e);
                            break;
                        }
                    }
                }
            },

            _ = &mut first_sample_check, if check_pending => {
                check_pending = false;
                if received_since_attach == 0 {
                    warn!(
                        "[{}] no sample {:?} after attach, re-attaching once",
                        sensor, ctx.policy.first_sample_check
                    );
                    match ctx.reattach().await {
                        Ok(fresh) => feed = fresh,
                        Err(e) => {
                            ctx.fail(e);
                            break;
                        }
                    }
                }
            }

            _ = ticker.tick(), if dog.is_some() => {
                let Some(verdict) = dog.as_mut().map(StaleWatchdog::check) else {
                    continue;
                };
                match verdict {
                    Verdict::Healthy => {}
                    Verdict::Stale { strikes, silent_for } => {
                        warn!(
                            "[{}] stale for {:.1}s (strike {}), re-attaching",
                            sensor,
                            silent_for.as_secs_f64(),
                            strikes
                        );
                        match ctx.reattach().await {
                            Ok(fresh) => feed = fresh,
                            Err(e) => warn!("[{}] re-attach failed: {}", sensor, e),
                        }
                    }
                    Verdict::Exhausted { strikes } => {
                        ctx.fail(TrackerError::SamplerStale { sensor, strikes });
                        break;
                    }
                }
            }
        }
    }
    debug!("[{}] feed task exiting", sensor);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NativeBackend, SimulatedBackend};
    use crate::config::{SimulationConfig, TrackerConfig};
    use crate::notify::{CollectingNotifier, NoticeAction};
    use crate::permissions::StaticPermissions;
    use crate::preferences::MemoryPreferences;
    use crate::types::{MotionSample, PermissionState};

    fn gate(grants: PermissionState) -> Arc<PermissionGate> {
        Arc::new(PermissionGate::new(
            Arc::new(StaticPermissions::new(grants)),
            Arc::new(MemoryPreferences::new()),
            &TrackerConfig::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_sampler_forwards_latest() {
        let (backend, bridge) = NativeBackend::new();
        let notifier = Arc::new(CollectingNotifier::new());
        let sampler = MotionSampler::new(
            Arc::new(backend),
            gate(PermissionState::all_granted()),
            notifier,
            &TrackerConfig::default(),
        );

        assert!(sampler.start().await);
        assert_eq!(sampler.status(), SamplerStatus::Running);
        bridge.push_motion(MotionSample::new(0.0, 0.0, 1.0, 100));
        bridge.push_motion(MotionSample::new(0.0, 0.0, 1.1, 200));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(sampler.latest().unwrap().timestamp_ms, 200);
        assert_eq!(sampler.sample_count(), 2);

        assert!(sampler.stop().await);
        assert!(sampler.stop().await);
        assert_eq!(sampler.status(), SamplerStatus::Stopped);
        assert!(!bridge.is_attached(SensorKind::Motion));
    }

    #[tokio::test]
    async fn test_start_refused_without_permission() {
        let (backend, bridge) = NativeBackend::new();
        let notifier = Arc::new(CollectingNotifier::new());
        let sampler = MotionSampler::new(
            Arc::new(backend),
            gate(PermissionState {
                location: true,
                motion: false,
                notifications: true,
            }),
            notifier.clone(),
            &TrackerConfig::default(),
        );

        assert!(!sampler.start().await);
        assert_eq!(bridge.attach_count(SensorKind::Motion), 0);
        assert_eq!(sampler.status(), SamplerStatus::Stopped);
        assert_eq!(notifier.notices()[0].action, Some(NoticeAction::OpenSettings));
    }

    #[tokio::test]
    async fn test_start_refused_on_sensorless_runtime() {
        let (backend, bridge) = NativeBackend::new();
        bridge.set_available(false);
        let sampler = LocationSampler::new(
            Arc::new(backend),
            gate(PermissionState::all_granted()),
            Arc::new(CollectingNotifier::new()),
            &TrackerConfig::default(),
        );
        assert!(!sampler.start().await);
        assert_eq!(bridge.attach_count(SensorKind::Location), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_listener() {
        let (backend, bridge) = NativeBackend::new();
        let sampler = MotionSampler::new(
            Arc::new(backend),
            gate(PermissionState::all_granted()),
            Arc::new(CollectingNotifier::new()),
            &TrackerConfig::default(),
        );
        assert!(sampler.start().await);
        assert!(sampler.start().await);
        assert_eq!(bridge.attach_count(SensorKind::Motion), 2);
        assert!(bridge.is_attached(SensorKind::Motion));
        sampler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_failure_retried_once() {
        let backend = Arc::new(SimulatedBackend::new(SimulationConfig::default()));
        let notifier = Arc::new(CollectingNotifier::new());
        let sampler = MotionSampler::new(
            backend.clone(),
            gate(PermissionState::all_granted()),
            notifier.clone(),
            &TrackerConfig::default(),
        );

        backend.refuse_attaches(SensorKind::Motion, 1);
        assert!(sampler.start().await);
        sampler.stop().await;

        backend.refuse_attaches(SensorKind::Motion, 2);
        assert!(!sampler.start().await);
        assert_eq!(sampler.status(), SamplerStatus::Failed);
        assert_eq!(notifier.notices()[0].action, Some(NoticeAction::Retry));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_feed_reattached_after_first_check() {
        let backend = Arc::new(SimulatedBackend::new(SimulationConfig::default()));
        backend.silence(SensorKind::Motion, true);
        let sampler = MotionSampler::new(
            backend.clone(),
            gate(PermissionState::all_granted()),
            Arc::new(CollectingNotifier::new()),
            &TrackerConfig::default(),
        );

        assert!(sampler.start().await);
        sleep(Duration::from_millis(1900)).await;
        assert_eq!(backend.attach_count(SensorKind::Motion), 1);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.attach_count(SensorKind::Motion), 2);

        // one-shot: no further re-attach before the watchdog period
        sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.attach_count(SensorKind::Motion), 2);
        sampler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_gives_up_after_three_strikes() {
        let backend = Arc::new(SimulatedBackend::new(SimulationConfig::default()));
        let notifier = Arc::new(CollectingNotifier::new());
        let sampler = MotionSampler::new(
            backend.clone(),
            gate(PermissionState::all_granted()),
            notifier.clone(),
            &TrackerConfig::default(),
        );

        assert!(sampler.start().await);
        sleep(Duration::from_secs(3)).await;
        assert!(sampler.sample_count() > 0);

        backend.silence(SensorKind::Motion, true);
        // strikes at 15 s (silent ~12 s), 30 s and 45 s
        sleep(Duration::from_secs(40)).await;
        assert_eq!(sampler.status(), SamplerStatus::Running);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(sampler.status(), SamplerStatus::Failed);

        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].message.contains("stale"));

        // no automatic retry afterwards
        let attaches = backend.attach_count(SensorKind::Motion);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.attach_count(SensorKind::Motion), attaches);

        backend.silence(SensorKind::Motion, false);
        assert!(sampler.start().await);
        assert_eq!(sampler.status(), SamplerStatus::Running);
        sampler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_self_heal() {
        let backend = Arc::new(SimulatedBackend::new(SimulationConfig::default()));
        backend.silence(SensorKind::Motion, true);
        let sampler = MotionSampler::new(
            backend.clone(),
            gate(PermissionState::all_granted()),
            Arc::new(CollectingNotifier::new()),
            &TrackerConfig::default(),
        );

        assert!(sampler.start().await);
        sampler.stop().await;
        sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.attach_count(SensorKind::Motion), 1);
        assert_eq!(sampler.status(), SamplerStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_publishes_initial_fix() {
        let backend = Arc::new(SimulatedBackend::new(SimulationConfig::default()));
        let sampler = LocationSampler::new(
            backend,
            gate(PermissionState::all_granted()),
            Arc::new(CollectingNotifier::new()),
            &TrackerConfig::default(),
        );
        assert!(sampler.start().await);
        assert!(sampler.latest().is_some());
        sampler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_proceeds_without_initial_fix() {
        let (backend, bridge) = NativeBackend::new();
        let sampler = LocationSampler::new(
            Arc::new(backend),
            gate(PermissionState::all_granted()),
            Arc::new(CollectingNotifier::new()),
            &TrackerConfig::default(),
        );

        let started = Instant::now();
        assert!(sampler.start().await);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(sampler.latest().is_none());
        assert!(bridge.is_attached(SensorKind::Location));
        sampler.stop().await;
    }
}
