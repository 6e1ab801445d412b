//! On-device activity tracking core.
//!
//! Raw accelerometer samples and GPS fixes flow from a [`backend`] through
//! the [`sampler`]s into the [`aggregator`], which counts steps, accumulates
//! distance, derives calories and fitscore, and flushes snapshots to a
//! [`persistence`] store. The [`permissions`] gate decides when sampling may
//! run and the [`supervisor`] keeps tracking alive across restarts.

pub mod aggregator;
pub mod auth;
pub mod backend;
pub mod clock;
pub mod config;
pub mod distance;
pub mod error;
pub mod live_status;
pub mod notify;
pub mod permissions;
pub mod persistence;
pub mod preferences;
pub mod sampler;
pub mod step_detector;
pub mod supervisor;
pub mod types;

pub use aggregator::{ActivityAggregator, Collaborators, EventKind, TrackerEvent, TrackerStatus};
pub use config::{BackendKind, TrackerConfig};
pub use error::{TrackerError, TrackerResult};
pub use supervisor::{AutoTrackingSupervisor, TrackingState};
pub use types::{ActivitySnapshot, MotionSample, PermissionState, PositionFix};
