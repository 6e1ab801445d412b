use crate::types::{Capability, SensorKind};
use thiserror::Error;

/// Fitness tracker error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Permission denied: {0}")]
    PermissionDenied(Capability),

    #[error("No authenticated user")]
    NotAuthenticated,

    #[error("Runtime has no motion/location sensors")]
    UnsupportedRuntime,

    #[error("Tracking already running")]
    AlreadyRunning,

    #[error("Failed to attach {sensor} listener: {reason}")]
    SamplerAttachFailure { sensor: SensorKind, reason: String },

    #[error("{sensor} sensor stale after {strikes} watchdog checks")]
    SamplerStale { sensor: SensorKind, strikes: u32 },

    #[error("Persistence error: {0}")]
    PersistenceFailure(String),

    #[error("Implausible reading: {0}")]
    ImplausibleReading(String),

    #[error("Preference store error: {0}")]
    Preferences(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TrackerError {
    pub fn attach(sensor: SensorKind, reason: impl Into<String>) -> Self {
        TrackerError::SamplerAttachFailure {
            sensor,
            reason: reason.into(),
        }
    }

    /// Diagnostics-only errors never reach the user.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, TrackerError::ImplausibleReading(_))
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::PersistenceFailure(err.to_string())
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(err: std::io::Error) -> Self {
        TrackerError::PersistenceFailure(err.to_string())
    }
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;
