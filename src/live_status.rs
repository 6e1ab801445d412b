use crate::aggregator::TrackerStatus;
use crate::sampler::SamplerStatus;
use crate::supervisor::TrackingState;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Flat status record written to `live_status.json` for dashboards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub tracking_state: String,
    pub auto_tracking: bool,
    pub recording: bool,
    pub user_id: Option<String>,
    // Totals
    pub steps: u64,
    pub distance_km: f64,
    pub calories: u64,
    pub fitscore: u64,
    // Sensor health
    pub motion_samples: u64,
    pub location_fixes: u64,
    pub motion_healthy: bool,
    pub location_healthy: bool,
    // Persistence
    pub flushes: u64,
    pub last_flush: Option<String>,
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            tracking_state: format!("{:?}", TrackingState::Idle),
            auto_tracking: false,
            recording: false,
            user_id: None,
            steps: 0,
            distance_km: 0.0,
            calories: 0,
            fitscore: 0,
            motion_samples: 0,
            location_fixes: 0,
            motion_healthy: true,
            location_healthy: true,
            flushes: 0,
            last_flush: None,
        }
    }

    pub fn capture(
        status: &TrackerStatus,
        state: TrackingState,
        auto_tracking: bool,
        uptime_seconds: u64,
    ) -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds,
            tracking_state: format!("{:?}", state),
            auto_tracking,
            recording: status.recording,
            user_id: status.user_id.clone(),
            steps: status.snapshot.steps,
            distance_km: status.display_distance_km,
            calories: status.snapshot.calories,
            fitscore: status.snapshot.fitscore,
            motion_samples: status.motion_samples,
            location_fixes: status.location_fixes,
            motion_healthy: status.motion != SamplerStatus::Failed,
            location_healthy: status.location != SamplerStatus::Failed,
            flushes: status.flushes,
            last_flush: status.last_flush.map(|t| t.to_rfc3339()),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
