//! Auto-tracking supervisor.
//!
//! Wraps the aggregator with the persisted `autoTrackingEnabled` preference,
//! the one-shot cold-start resume and a periodic permission re-validation
//! loop. A revoked permission or a sampler that gave up force-stops the
//! session; neither restarts it automatically.

use crate::aggregator::ActivityAggregator;
use crate::config::SupervisorConfig;
use crate::error::TrackerError;
use crate::notify::{self, Notice, Notifier};
use crate::permissions::PermissionGate;
use crate::preferences::{self, PreferenceStore, AUTO_TRACKING_KEY};
use crate::types::Capability;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TrackingState {
    Idle,
    Starting,
    Active,
}

struct Revalidation {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct AutoTrackingSupervisor {
    aggregator: Arc<ActivityAggregator>,
    gate: Arc<PermissionGate>,
    prefs: Arc<dyn PreferenceStore>,
    notifier: Arc<dyn Notifier>,
    config: SupervisorConfig,
    state: Arc<watch::Sender<TrackingState>>,
    resume_attempted: AtomicBool,
    resume_cancel: CancellationToken,
    revalidation: tokio::sync::Mutex<Option<Revalidation>>,
}

impl AutoTrackingSupervisor {
    pub fn new(
        aggregator: Arc<ActivityAggregator>,
        gate: Arc<PermissionGate>,
        prefs: Arc<dyn PreferenceStore>,
        notifier: Arc<dyn Notifier>,
        config: SupervisorConfig,
    ) -> Self {
        let (state, _) = watch::channel(TrackingState::Idle);
        Self {
            aggregator,
            gate,
            prefs,
            notifier,
            config,
            state: Arc::new(state),
            resume_attempted: AtomicBool::new(false),
            resume_cancel: CancellationToken::new(),
            revalidation: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> TrackingState {
        *self.state.borrow()
    }

    pub fn state_updates(&self) -> watch::Receiver<TrackingState> {
        self.state.subscribe()
    }

    pub fn aggregator(&self) -> &Arc<ActivityAggregator> {
        &self.aggregator
    }

    pub fn auto_tracking_enabled(&self) -> bool {
        preferences::load(self.prefs.as_ref(), AUTO_TRACKING_KEY).unwrap_or(false)
    }

    /// Turn tracking on or off and persist the choice. Enabling persists
    /// only when the session actually started.
    pub async fn toggle(&self, enable: bool) -> bool {
        let mut revalidation = self.revalidation.lock().await;
        if enable {
            self.enable(&mut revalidation).await
        } else {
            self.disable(&mut revalidation).await
        }
    }

    /// Resume tracking after a cold start when the user left it enabled and
    /// both tracking permissions are still granted. Runs at most once per
    /// supervisor; never prompts. A `toggle(false)` or `shutdown` during the
    /// delay abandons the resume.
    pub async fn resume_if_enabled(&self) -> bool {
        if self.resume_attempted.swap(true, Ordering::SeqCst) {
            debug!("[supervisor] auto-resume already attempted");
            return false;
        }
        if !self.auto_tracking_enabled() {
            debug!("[supervisor] auto-tracking disabled, not resuming");
            return false;
        }
        if !self.gate.check().await.tracking_allowed() {
            info!("[supervisor] auto-tracking enabled but permissions missing, not resuming");
            return false;
        }

        tokio::select! {
            _ = self.resume_cancel.cancelled() => {
                debug!("[supervisor] resume abandoned during delay");
                return false;
            }
            _ = sleep(self.config.resume_delay()) => {}
        }

        let mut revalidation = self.revalidation.lock().await;
        // the user may have turned tracking off while we waited for the lock
        if self.resume_cancel.is_cancelled() || !self.auto_tracking_enabled() {
            debug!("[supervisor] auto-tracking turned off, resume skipped");
            return false;
        }
        if self.state() != TrackingState::Idle {
            debug!("[supervisor] already tracking, resume skipped");
            return false;
        }
        info!("[supervisor] resuming auto-tracking");
        self.enable(&mut revalidation).await
    }

    pub fn spawn_resume(self: &Arc<Self>) -> JoinHandle<bool> {
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.resume_if_enabled().await })
    }

    /// Stop everything without touching the preference, e.g. at shutdown.
    pub async fn shutdown(&self) {
        self.resume_cancel.cancel();
        let mut revalidation = self.revalidation.lock().await;
        if let Some(loop_task) = revalidation.take() {
            stop_revalidation(loop_task).await;
        }
        self.aggregator.stop().await;
        self.state.send_replace(TrackingState::Idle);
    }

    async fn enable(&self, revalidation: &mut Option<Revalidation>) -> bool {
        if self.state() == TrackingState::Active && self.aggregator.is_recording() {
            self.persist_preference(true);
            return true;
        }
        if let Some(stale) = revalidation.take() {
            stop_revalidation(stale).await;
        }

        self.state.send_replace(TrackingState::Starting);
        if !self.aggregator.start().await {
            self.state.send_replace(TrackingState::Idle);
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(revalidate(
            self.aggregator.clone(),
            self.gate.clone(),
            self.notifier.clone(),
            self.state.clone(),
            self.config.revalidate_interval(),
            cancel.clone(),
        ));
        *revalidation = Some(Revalidation { cancel, task });
        self.state.send_replace(TrackingState::Active);
        self.persist_preference(true);
        info!("[supervisor] tracking active");
        true
    }

    async fn disable(&self, revalidation: &mut Option<Revalidation>) -> bool {
        self.resume_cancel.cancel();
        if let Some(loop_task) = revalidation.take() {
            stop_revalidation(loop_task).await;
        }
        if self.aggregator.is_recording() {
            self.aggregator.stop().await;
        }
        self.state.send_replace(TrackingState::Idle);
        self.persist_preference(false);
        info!("[supervisor] tracking disabled");
        true
    }

    fn persist_preference(&self, enabled: bool) {
        if let Err(e) = preferences::save(self.prefs.as_ref(), AUTO_TRACKING_KEY, &enabled) {
            warn!("[supervisor] failed to persist auto-tracking preference: {}", e);
            notify::report(self.notifier.as_ref(), &e);
        }
    }
}

async fn stop_revalidation(revalidation: Revalidation) {
    revalidation.cancel.cancel();
    if let Err(e) = revalidation.task.await {
        error!("[supervisor] re-validation task ended abnormally: {}", e);
    }
}

/// Re-checks permissions every `period` while a session is active and ends
/// the session on revocation or when a sampler gives up.
async fn revalidate(
    aggregator: Arc<ActivityAggregator>,
    gate: Arc<PermissionGate>,
    notifier: Arc<dyn Notifier>,
    state: Arc<watch::Sender<TrackingState>>,
    period: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut motion_status = aggregator.motion_sampler().status_updates();
    let mut location_status = aggregator.location_sampler().status_updates();
    let mut motion_open = true;
    let mut location_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            _ = ticker.tick() => {
                let permissions = gate.check().await;
                if permissions.tracking_allowed() {
                    debug!("[supervisor] permissions still granted");
                    continue;
                }
                let revoked = if permissions.location {
                    Capability::Motion
                } else {
                    Capability::Location
                };
                warn!("[supervisor] {} permission revoked, stopping tracking", revoked);
                aggregator.stop().await;
                state.send_replace(TrackingState::Idle);
                notify::report(notifier.as_ref(), &TrackerError::PermissionDenied(revoked));
                return;
            }

            changed = motion_status.changed(), if motion_open => {
                motion_open = changed.is_ok();
            }

            changed = location_status.changed(), if location_open => {
                location_open = changed.is_ok();
            }
        }

        if aggregator.has_failed_sampler() {
            error!("[supervisor] sampler gave up, ending session");
            aggregator.stop().await;
            state.send_replace(TrackingState::Idle);
            notifier.notify(Notice::info("Tracking stopped; restart it to try again"));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Collaborators;
    use crate::auth::StaticSession;
    use crate::backend::SimulatedBackend;
    use crate::config::{SimulationConfig, TrackerConfig};
    use crate::notify::{CollectingNotifier, NoticeAction};
    use crate::permissions::StaticPermissions;
    use crate::persistence::MemorySnapshotStore;
    use crate::preferences::MemoryPreferences;
    use crate::types::{PermissionState, SensorKind};
    use tokio::time::Duration;

    struct Harness {
        supervisor: Arc<AutoTrackingSupervisor>,
        platform: Arc<StaticPermissions>,
        prefs: Arc<MemoryPreferences>,
        backend: Arc<SimulatedBackend>,
        store: Arc<MemorySnapshotStore>,
        notifier: Arc<CollectingNotifier>,
    }

    fn harness_with(
        session: StaticSession,
        grants: PermissionState,
        prefs: Arc<MemoryPreferences>,
    ) -> Harness {
        let config = TrackerConfig::default();
        let platform = Arc::new(StaticPermissions::new(grants));
        let backend = Arc::new(SimulatedBackend::new(SimulationConfig::default()));
        let store = Arc::new(MemorySnapshotStore::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let gate = Arc::new(PermissionGate::new(platform.clone(), prefs.clone(), &config));
        let aggregator = Arc::new(ActivityAggregator::new(
            &config,
            Collaborators {
                session: Arc::new(session),
                store: store.clone(),
                gate: gate.clone(),
                backend: backend.clone(),
                notifier: notifier.clone(),
            },
        ));
        let supervisor = Arc::new(AutoTrackingSupervisor::new(
            aggregator,
            gate,
            prefs.clone(),
            notifier.clone(),
            config.supervisor.clone(),
        ));
        Harness {
            supervisor,
            platform,
            prefs,
            backend,
            store,
            notifier,
        }
    }

    fn harness() -> Harness {
        harness_with(
            StaticSession::signed_in("user-1"),
            PermissionState::all_granted(),
            Arc::new(MemoryPreferences::new()),
        )
    }

    fn enabled_prefs() -> Arc<MemoryPreferences> {
        let prefs = Arc::new(MemoryPreferences::new());
        preferences::save(prefs.as_ref(), AUTO_TRACKING_KEY, &true).unwrap();
        prefs
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_persists_preference() {
        let h = harness();
        assert!(h.supervisor.toggle(true).await);
        assert_eq!(h.supervisor.state(), TrackingState::Active);
        assert!(h.supervisor.aggregator().is_recording());
        assert!(h.supervisor.auto_tracking_enabled());

        sleep(Duration::from_secs(5)).await;
        assert!(h.supervisor.toggle(false).await);
        assert_eq!(h.supervisor.state(), TrackingState::Idle);
        assert!(!h.supervisor.aggregator().is_recording());
        assert!(!h.supervisor.auto_tracking_enabled());
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_enable_leaves_preference_alone() {
        let h = harness_with(
            StaticSession::signed_out(),
            PermissionState::all_granted(),
            Arc::new(MemoryPreferences::new()),
        );
        assert!(!h.supervisor.toggle(true).await);
        assert_eq!(h.supervisor.state(), TrackingState::Idle);
        assert!(h.prefs.get(AUTO_TRACKING_KEY).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_resumes_after_delay() {
        let h = harness_with(
            StaticSession::signed_in("user-1"),
            PermissionState::all_granted(),
            enabled_prefs(),
        );

        let resume = h.supervisor.spawn_resume();
        sleep(Duration::from_millis(900)).await;
        assert_eq!(h.supervisor.state(), TrackingState::Idle);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(h.supervisor.state(), TrackingState::Active);
        assert!(resume.await.unwrap());

        // once per cold start
        assert!(!h.supervisor.resume_if_enabled().await);
        assert_eq!(h.backend.attach_count(SensorKind::Motion), 1);
        h.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_during_resume_delay_wins() {
        let h = harness_with(
            StaticSession::signed_in("user-1"),
            PermissionState::all_granted(),
            enabled_prefs(),
        );

        let resume = h.supervisor.spawn_resume();
        sleep(Duration::from_millis(300)).await;
        assert!(h.supervisor.toggle(false).await);
        sleep(Duration::from_secs(2)).await;

        assert!(!resume.await.unwrap());
        assert_eq!(h.supervisor.state(), TrackingState::Idle);
        assert!(!h.supervisor.aggregator().is_recording());
        assert!(!h.supervisor.auto_tracking_enabled());
        assert_eq!(h.backend.attach_count(SensorKind::Motion), 0);
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preference_cleared_during_delay_skips_resume() {
        let h = harness_with(
            StaticSession::signed_in("user-1"),
            PermissionState::all_granted(),
            enabled_prefs(),
        );

        let resume = h.supervisor.spawn_resume();
        sleep(Duration::from_millis(300)).await;
        // another surface wrote the preference directly
        preferences::save(h.prefs.as_ref(), AUTO_TRACKING_KEY, &false).unwrap();

        assert!(!resume.await.unwrap());
        assert_eq!(h.supervisor.state(), TrackingState::Idle);
        assert_eq!(h.backend.attach_count(SensorKind::Motion), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_resume_delay_wins() {
        let h = harness_with(
            StaticSession::signed_in("user-1"),
            PermissionState::all_granted(),
            enabled_prefs(),
        );

        let resume = h.supervisor.spawn_resume();
        sleep(Duration::from_millis(300)).await;
        h.supervisor.shutdown().await;

        assert!(!resume.await.unwrap());
        assert_eq!(h.supervisor.state(), TrackingState::Idle);
        assert_eq!(h.backend.attach_count(SensorKind::Motion), 0);
        // shutdown leaves the user's choice in place for the next cold start
        assert!(h.supervisor.auto_tracking_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_requires_preference() {
        let h = harness();
        assert!(!h.supervisor.resume_if_enabled().await);
        assert_eq!(h.supervisor.state(), TrackingState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_never_prompts() {
        let h = harness_with(
            StaticSession::signed_in("user-1"),
            PermissionState {
                location: true,
                motion: false,
                notifications: true,
            },
            enabled_prefs(),
        );
        assert!(!h.supervisor.resume_if_enabled().await);
        assert_eq!(h.platform.prompt_count(), 0);
        assert_eq!(h.backend.attach_count(SensorKind::Motion), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revocation_force_stops() {
        let h = harness();
        assert!(h.supervisor.toggle(true).await);

        h.platform.set(Capability::Location, false);
        sleep(Duration::from_secs(59)).await;
        assert_eq!(h.supervisor.state(), TrackingState::Active);
        sleep(Duration::from_secs(2)).await;

        assert_eq!(h.supervisor.state(), TrackingState::Idle);
        assert!(!h.supervisor.aggregator().is_recording());
        let notices = h.notifier.notices();
        assert_eq!(notices.last().unwrap().action, Some(NoticeAction::OpenSettings));
        // the user's choice survives; resume will pick it up once granted again
        assert!(h.supervisor.auto_tracking_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_give_up_ends_session() {
        let h = harness();
        assert!(h.supervisor.toggle(true).await);
        sleep(Duration::from_secs(3)).await;

        h.backend.silence(SensorKind::Motion, true);
        sleep(Duration::from_secs(50)).await;

        assert_eq!(h.supervisor.state(), TrackingState::Idle);
        assert!(!h.supervisor.aggregator().is_recording());
        assert!(h.store.len() >= 1);
    }
}
