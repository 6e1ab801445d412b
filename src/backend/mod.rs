//! Sensor backends.
//!
//! A backend turns a device's accelerometer and GPS into bounded `mpsc` feeds.
//! Dropping the receiver detaches the listener; each backend notices the
//! closed channel and stops producing. The backend is chosen once, from
//! configuration, and everything downstream is backend-agnostic.

pub mod native;
pub mod platform;
pub mod simulated;

use crate::config::{BackendKind, TrackerConfig};
use crate::error::TrackerResult;
use crate::types::{MotionSample, PositionFix};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use native::{NativeBackend, NativeBridge};
pub use platform::PlatformBackend;
pub use simulated::SimulatedBackend;

/// Feed capacity. Samples beyond it are dropped, never queued.
pub(crate) const MOTION_FEED_CAPACITY: usize = 32;
pub(crate) const LOCATION_FEED_CAPACITY: usize = 8;

#[async_trait]
pub trait SensorBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this runtime can deliver sensor data at all.
    fn is_available(&self) -> bool;

    async fn open_motion(&self) -> TrackerResult<mpsc::Receiver<MotionSample>>;

    async fn open_location(&self) -> TrackerResult<mpsc::Receiver<PositionFix>>;

    /// One position fix, outside any open feed.
    async fn current_position(&self) -> TrackerResult<PositionFix>;
}

pub struct BuiltBackend {
    pub backend: Arc<dyn SensorBackend>,
    /// Present for [`BackendKind::Native`]; the host pushes samples through it.
    pub bridge: Option<NativeBridge>,
}

pub fn build(config: &TrackerConfig) -> BuiltBackend {
    match config.backend {
        BackendKind::Native => {
            let (backend, bridge) = NativeBackend::new();
            BuiltBackend {
                backend: Arc::new(backend),
                bridge: Some(bridge),
            }
        }
        BackendKind::Platform => BuiltBackend {
            backend: Arc::new(PlatformBackend::new()),
            bridge: None,
        },
        BackendKind::Simulated => BuiltBackend {
            backend: Arc::new(SimulatedBackend::new(config.simulation.clone())),
            bridge: None,
        },
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
