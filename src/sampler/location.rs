use super::{FeedOpener, FeedPolicy, FeedSampler, InitialReader, SamplerStatus};
use crate::backend::SensorBackend;
use crate::config::TrackerConfig;
use crate::error::TrackerResult;
use crate::notify::Notifier;
use crate::permissions::PermissionGate;
use crate::types::{PositionFix, SensorKind};
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::watch;

/// GPS watch. On start it asks for one fix (bounded by the first-fix
/// timeout) and then keeps the watch open whether or not that fix arrived.
pub struct LocationSampler {
    inner: FeedSampler<PositionFix>,
}

impl LocationSampler {
    pub fn new(
        backend: Arc<dyn SensorBackend>,
        gate: Arc<PermissionGate>,
        notifier: Arc<dyn Notifier>,
        config: &TrackerConfig,
    ) -> Self {
        let source = backend.clone();
        let opener: FeedOpener<PositionFix> = Arc::new(move || {
            let backend = source.clone();
            async move { backend.open_location().await }.boxed()
        });
        let source = backend.clone();
        let initial: InitialReader<PositionFix> = Arc::new(move || {
            let backend = source.clone();
            async move { backend.current_position().await }.boxed()
        });
        let policy = FeedPolicy {
            first_sample_check: config.sampler.first_sample_check(),
            watchdog: None,
            initial_timeout: config.sampler.first_fix_timeout(),
        };
        Self {
            inner: FeedSampler::new(
                SensorKind::Location,
                backend,
                gate,
                notifier,
                opener,
                Some(initial),
                policy,
            ),
        }
    }

    pub async fn start(&self) -> bool {
        self.inner.start().await
    }

    pub(crate) async fn try_start(&self) -> TrackerResult<()> {
        self.inner.try_start().await
    }

    pub async fn stop(&self) -> bool {
        self.inner.stop().await
    }

    pub fn latest(&self) -> Option<PositionFix> {
        self.inner.latest()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PositionFix>> {
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
