//! Push-based backend for host glue (JNI/FFI). The host's sensor callbacks
//! call into [`NativeBridge`]; the crate sees them as ordinary feeds.

use super::{SensorBackend, LOCATION_FEED_CAPACITY, MOTION_FEED_CAPACITY};
use crate::config::BackendKind;
use crate::error::{TrackerError, TrackerResult};
use crate::types::{MotionSample, PositionFix, SensorKind};
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

struct NativeShared {
    available: AtomicBool,
    motion: Mutex<Option<mpsc::Sender<MotionSample>>>,
    location: Mutex<Option<mpsc::Sender<PositionFix>>>,
    last_fix: watch::Sender<Option<PositionFix>>,
    motion_attaches: AtomicU32,
    location_attaches: AtomicU32,
}

pub struct NativeBackend {
    shared: Arc<NativeShared>,
}

/// Host-side handle. Cloneable so several platform callbacks can hold it.
#[derive(Clone)]
pub struct NativeBridge {
    shared: Arc<NativeShared>,
}

impl NativeBackend {
    pub fn new() -> (NativeBackend, NativeBridge) {
        let (last_fix, _) = watch::channel(None);
        let shared = Arc::new(NativeShared {
            available: AtomicBool::new(true),
            motion: Mutex::new(None),
            location: Mutex::new(None),
            last_fix,
            motion_attaches: AtomicU32::new(0),
            location_attaches: AtomicU32::new(0),
        });
        (
            NativeBackend {
                shared: shared.clone(),
            },
            NativeBridge { shared },
        )
    }
}

/// Deliver without blocking; a full feed drops the sample and a closed feed
/// is forgotten.
fn deliver<T>(slot: &Mutex<Option<mpsc::Sender<T>>>, value: T) -> bool {
    let Ok(mut guard) = slot.lock() else {
        return false;
    };
    let Some(tx) = guard.as_ref() else {
        return false;
    };
    match tx.try_send(value) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => false,
        Err(mpsc::error::TrySendError::Closed(_)) => {
            *guard = None;
            false
        }
    }
}

fn is_open<T>(slot: &Mutex<Option<mpsc::Sender<T>>>) -> bool {
    slot.lock()
        .map(|g| g.as_ref().is_some_and(|tx| !tx.is_closed()))
        .unwrap_or(false)
}

impl NativeBridge {
    /// Returns whether an attached listener accepted the sample.
    pub fn push_motion(&self, sample: MotionSample) -> bool {
        deliver(&self.shared.motion, sample)
    }

    /// Records the fix as the current position and forwards it to the feed.
    pub fn push_fix(&self, fix: PositionFix) -> bool {
        self.shared.last_fix.send_replace(Some(fix));
        deliver(&self.shared.location, fix)
    }

    /// Host reports whether the device sensors exist and are usable.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::Relaxed);
    }

    pub fn is_attached(&self, sensor: SensorKind) -> bool {
        match sensor {
            SensorKind::Motion => is_open(&self.shared.motion),
            SensorKind::Location => is_open(&self.shared.location),
        }
    }

    pub fn attach_count(&self, sensor: SensorKind) -> u32 {
        match sensor {
            SensorKind::Motion => self.shared.motion_attaches.load(Ordering::Relaxed),
            SensorKind::Location => self.shared.location_attaches.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl SensorBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::Relaxed)
    }

    async fn open_motion(&self) -> TrackerResult<mpsc::Receiver<MotionSample>> {
        if !self.is_available() {
            return Err(TrackerError::attach(SensorKind::Motion, "native sensors unavailable"));
        }
        let (tx, rx) = mpsc::channel(MOTION_FEED_CAPACITY);
        let mut slot = self
            .shared
            .motion
            .lock()
            .map_err(|_| TrackerError::attach(SensorKind::Motion, "bridge lock poisoned"))?;
        *slot = Some(tx);
        let n = self.shared.motion_attaches.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("[native] motion listener attached (#{})", n);
        Ok(rx)
    }

    async fn open_location(&self) -> TrackerResult<mpsc::Receiver<PositionFix>> {
        if !self.is_available() {
            return Err(TrackerError::attach(SensorKind::Location, "native sensors unavailable"));
        }
        let (tx, rx) = mpsc::channel(LOCATION_FEED_CAPACITY);
        let mut slot = self
            .shared
            .location
            .lock()
            .map_err(|_| TrackerError::attach(SensorKind::Location, "bridge lock poisoned"))?;
        *slot = Some(tx);
        let n = self.shared.location_attaches.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("[native] location watch attached (#{})", n);
        Ok(rx)
    }

    /// Waits for the host to push a fix; callers bound this with a timeout.
    async fn current_position(&self) -> TrackerResult<PositionFix> {
        let mut rx = self.shared.last_fix.subscribe();
        let fix = rx
            .wait_for(|fix| fix.is_some())
            .await
            .map_err(|_| TrackerError::attach(SensorKind::Location, "bridge dropped"))?;
        (*fix).ok_or_else(|| TrackerError::attach(SensorKind::Location, "no fix"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_reaches_open_feed() {
        let (backend, bridge) = NativeBackend::new();
        assert!(!bridge.push_motion(MotionSample::new(0.0, 0.0, 1.0, 0)));

        let mut rx = backend.open_motion().await.unwrap();
        assert!(bridge.is_attached(SensorKind::Motion));
        assert!(bridge.push_motion(MotionSample::new(0.0, 0.0, 1.0, 10)));
        assert_eq!(rx.recv().await.unwrap().timestamp_ms, 10);

        drop(rx);
        assert!(!bridge.is_attached(SensorKind::Motion));
        assert!(!bridge.push_motion(MotionSample::new(0.0, 0.0, 1.0, 20)));
    }

    #[tokio::test]
    async fn test_full_feed_drops_samples() {
        let (backend, bridge) = NativeBackend::new();
        let mut rx = backend.open_motion().await.unwrap();
        for i in 0..MOTION_FEED_CAPACITY as i64 {
            assert!(bridge.push_motion(MotionSample::new(0.0, 0.0, 1.0, i)));
        }
        assert!(!bridge.push_motion(MotionSample::new(0.0, 0.0, 1.0, 999)));
        assert_eq!(rx.recv().await.unwrap().timestamp_ms, 0);
    }

    #[tokio::test]
    async fn test_unavailable_refuses_attach() {
        let (backend, bridge) = NativeBackend::new();
        bridge.set_available(false);
        assert!(!backend.is_available());
        assert!(matches!(
            backend.open_location().await,
            Err(TrackerError::SamplerAttachFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_current_position_waits_for_push() {
        let (backend, bridge) = NativeBackend::new();
        let pending = tokio::spawn(async move { backend.current_position().await });
        tokio::task::yield_now().await;
        bridge.push_fix(PositionFix::new(1.0, 2.0, 3.0, 4));
        let fix = pending.await.unwrap().unwrap();
        assert_eq!(fix.coords.latitude, 1.0);
    }
}
