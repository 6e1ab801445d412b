use super::{FeedOpener, FeedPolicy, FeedSampler, SamplerStatus, WatchdogPolicy};
use crate::backend::SensorBackend;
use crate::config::TrackerConfig;
use crate::error::TrackerResult;
use crate::notify::Notifier;
use crate::permissions::PermissionGate;
use crate::types::{MotionSample, SensorKind};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::watch;

/// Accelerometer listener with first-sample self-heal and a stale watchdog.
pub struct MotionSampler {
    inner: FeedSampler<MotionSample>,
}

impl MotionSampler {
    pub fn new(
        backend: Arc<dyn SensorBackend>,
        gate: Arc<PermissionGate>,
        notifier: Arc<dyn Notifier>,
        config: &TrackerConfig,
    ) -> Self {
        let source = backend.clone();
        let opener: FeedOpener<MotionSample> = Arc::new(move || {
            let backend = source.clone();
            async move { backend.open_motion().await }.boxed()
        });
        let policy = FeedPolicy {
            first_sample_check: config.sampler.first_sample_check(),
            watchdog: Some(WatchdogPolicy {
                period: config.sampler.watchdog_period(),
                stale_after: config.sampler.stale_after(),
                max_strikes: config.sampler.max_stale_strikes,
            }),
            initial_timeout: config.sampler.first_fix_timeout(),
        };
        Self {
            inner: FeedSampler::new(
                SensorKind::Motion,
                backend,
                gate,
                notifier,
                opener,
                None,
                policy,
            ),
        }
    }

    /// Returns false, after notifying, when permission or the runtime is
    /// missing or the listener cannot be attached.
    pub async fn start(&self) -> bool {
        self.inner.start().await
    }

    pub(crate) async fn try_start(&self) -> TrackerResult<()> {
        self.inner.try_start().await
    }

    pub async fn stop(&self) -> bool {
        self.inner.stop().await
    }

    pub fn latest(&self) -> Option<MotionSample> {
        self.inner.latest()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<MotionSample>> {
        self.inner.subscribe()
    }

    pub fn status(&self) -> SamplerStatus {
        self.inner.status()
    }

    pub fn status_updates(&self) -> watch::Receiver<SamplerStatus> {
        self.inner.status_updates()
    }

    pub fn sample_count(&self) -> u64 {
        self.inner.sample_count()
    }
}
