use crate::config::DEFAULT_MAX_JUMP_KM;
use crate::error::{TrackerError, TrackerResult};
use crate::types::PositionFix;
use log::warn;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points, in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_KM * c
}

/// Distance between two consecutive fixes, or `ImplausibleReading` when it
/// exceeds `max_jump_km`. Invalid coordinates count as no movement.
pub fn checked_delta_km(
    current: &PositionFix,
    previous: &PositionFix,
    max_jump_km: f64,
) -> TrackerResult<f64> {
    if !current.has_valid_coords() || !previous.has_valid_coords() {
        return Ok(0.0);
    }

    let delta = haversine_km(
        previous.coords.latitude,
        previous.coords.longitude,
        current.coords.latitude,
        current.coords.longitude,
    );

    if delta > max_jump_km {
        return Err(TrackerError::ImplausibleReading(format!(
            "{:.3} km jump over {} ms (limit {:.3} km)",
            delta,
            current.timestamp_ms - previous.timestamp_ms,
            max_jump_km
        )));
    }
    Ok(delta)
}

/// Distance covered between two consecutive fixes.
///
/// Returns 0 when either fix has invalid coordinates, or when the jump exceeds
/// `max_jump_km` (logged, then discarded).
pub fn delta_distance_km(current: &PositionFix, previous: &PositionFix, max_jump_km: f64) -> f64 {
    match checked_delta_km(current, previous, max_jump_km) {
        Ok(delta) => delta,
        Err(e) => {
            warn!("[location] discarding fix: {}", e);
            0.0
        }
    }
}

/// Running distance over a stream of fixes.
#[derive(Clone, Debug)]
pub struct DistanceAccumulator {
    max_jump_km: f64,
    previous: Option<PositionFix>,
}

impl Default for DistanceAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JUMP_KM)
    }
}

impl DistanceAccumulator {
    pub fn new(max_jump_km: f64) -> Self {
        Self {
            max_jump_km,
            previous: None,
        }
    }

    /// Incremental distance for `fix` against the previously retained one.
    /// A rejected jump still replaces the retained fix, so a real relocation
    /// is only lost once.
    pub fn push(&mut self, fix: PositionFix) -> f64 {
        if !fix.has_valid_coords() {
            return 0.0;
        }
        let delta = match &self.previous {
            Some(previous) => delta_distance_km(&fix, previous, self.max_jump_km),
            None => 0.0,
        };
        self.previous = Some(fix);
        delta
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}
