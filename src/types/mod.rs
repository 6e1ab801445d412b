use serde::{Deserialize, Serialize};
use std::fmt;

/// Calories burned per counted step.
pub const CALORIES_PER_STEP: f64 = 0.04;
/// Fitscore points per step (`steps / 20`).
pub const STEPS_PER_FITSCORE_POINT: f64 = 20.0;
/// Fitscore points per kilometre.
pub const FITSCORE_PER_KM: f64 = 100.0;

/// Raw accelerometer axes, in g.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One accelerometer tick as delivered by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub acceleration: Acceleration,
    /// Unix epoch milliseconds.
    pub timestamp_ms: i64,
}

impl MotionSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp_ms: i64) -> Self {
        Self {
            acceleration: Acceleration { x, y, z },
            timestamp_ms,
        }
    }

    pub fn magnitude(&self) -> f64 {
        let a = &self.acceleration;
        (a.x * a.x + a.y * a.y + a.z * a.z).sqrt()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in metres.
    pub accuracy: f64,
}

/// One GPS position update.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub coords: Coordinates,
    /// Unix epoch milliseconds.
    pub timestamp_ms: i64,
}

impl PositionFix {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, timestamp_ms: i64) -> Self {
        Self {
            coords: Coordinates {
                latitude,
                longitude,
                accuracy,
            },
            timestamp_ms,
        }
    }

    /// Finite and inside the WGS84 latitude/longitude ranges.
    pub fn has_valid_coords(&self) -> bool {
        let c = &self.coords;
        c.latitude.is_finite()
            && c.longitude.is_finite()
            && (-90.0..=90.0).contains(&c.latitude)
            && (-180.0..=180.0).contains(&c.longitude)
    }
}

/// Cumulative activity totals. `calories` and `fitscore` are always derived
/// from `steps` and `distance_km`; build through [`ActivitySnapshot::from_totals`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub steps: u64,
    pub distance_km: f64,
    pub calories: u64,
    pub fitscore: u64,
}

impl ActivitySnapshot {
    pub fn from_totals(steps: u64, distance_km: f64) -> Self {
        let distance_km = distance_km.max(0.0);
        Self {
            steps,
            distance_km,
            calories: calories_for(steps),
            fitscore: fitscore_for(steps, distance_km),
        }
    }

    /// Distance rounded to two decimals for presentation.
    pub fn display_distance_km(&self) -> f64 {
        (self.distance_km * 100.0).round() / 100.0
    }
}

/// `round(steps * 0.04)`
pub fn calories_for(steps: u64) -> u64 {
    (steps as f64 * CALORIES_PER_STEP).round() as u64
}

/// `round(steps / 20 + distance_km * 100)`
pub fn fitscore_for(steps: u64, distance_km: f64) -> u64 {
    let score = steps as f64 / STEPS_PER_FITSCORE_POINT + distance_km.max(0.0) * FITSCORE_PER_KM;
    score.round() as u64
}

/// Device capabilities gated by [`crate::permissions::PermissionGate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Location,
    Motion,
    Notifications,
}

impl Capability {
    /// Request order used by `request_all`.
    pub const ALL: [Capability; 3] = [
        Capability::Location,
        Capability::Motion,
        Capability::Notifications,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Location => "location",
            Capability::Motion => "motion",
            Capability::Notifications => "notifications",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionState {
    pub location: bool,
    pub motion: bool,
    pub notifications: bool,
}

impl PermissionState {
    pub fn all_granted() -> Self {
        Self {
            location: true,
            motion: true,
            notifications: true,
        }
    }

    pub fn get(&self, capability: Capability) -> bool {
        match capability {
            Capability::Location => self.location,
            Capability::Motion => self.motion,
            Capability::Notifications => self.notifications,
        }
    }

    pub fn set(&mut self, capability: Capability, granted: bool) {
        match capability {
            Capability::Location => self.location = granted,
            Capability::Motion => self.motion = granted,
            Capability::Notifications => self.notifications = granted,
        }
    }

    /// Location and motion are required; notifications are best-effort.
    pub fn tracking_allowed(&self) -> bool {
        self.location && self.motion
    }
}

/// Raw feeds a backend can open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Motion,
    Location,
}

impl SensorKind {
    pub fn capability(self) -> Capability {
        match self {
            SensorKind::Motion => Capability::Motion,
            SensorKind::Location => Capability::Location,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Motion => f.write_str("motion"),
            SensorKind::Location => f.write_str("location"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_magnitude() {
        let sample = MotionSample::new(3.0, 4.0, 0.0, 0);
        assert_eq!(sample.magnitude(), 5.0);
    }

    #[test]
    fn test_fitscore_formula() {
        assert_eq!(fitscore_for(1000, 2.0), 250);
        assert_eq!(fitscore_for(0, 0.0), 0);
        // 10 / 20 = 0.5 rounds half away from zero
        assert_eq!(fitscore_for(10, 0.0), 1);
        assert_eq!(fitscore_for(0, 0.014), 1);
    }

    #[test]
    fn test_calorie_formula() {
        assert_eq!(calories_for(2500), 100);
        assert_eq!(calories_for(12), 0);
        assert_eq!(calories_for(13), 1);
    }

    #[test]
    fn test_snapshot_derives_fields() {
        let snapshot = ActivitySnapshot::from_totals(1000, 2.0);
        assert_eq!(snapshot.calories, 40);
        assert_eq!(snapshot.fitscore, 250);

        let negative = ActivitySnapshot::from_totals(0, -1.0);
        assert_eq!(negative.distance_km, 0.0);
    }

    #[test]
    fn test_display_distance_rounds_without_touching_state() {
        let snapshot = ActivitySnapshot::from_totals(0, 1.23456);
        assert_eq!(snapshot.display_distance_km(), 1.23);
        assert_eq!(snapshot.distance_km, 1.23456);
    }

    #[test]
    fn test_fix_validity() {
        assert!(PositionFix::new(37.77, -122.41, 5.0, 0).has_valid_coords());
        assert!(!PositionFix::new(f64::NAN, 0.0, 5.0, 0).has_valid_coords());
        assert!(!PositionFix::new(91.0, 0.0, 5.0, 0).has_valid_coords());
        assert!(!PositionFix::new(0.0, 181.0, 5.0, 0).has_valid_coords());
    }

    #[test]
    fn test_permission_state_gating() {
        let mut state = PermissionState::default();
        assert!(!state.tracking_allowed());
        state.set(Capability::Location, true);
        state.set(Capability::Motion, true);
        assert!(state.tracking_allowed());
        assert!(!state.get(Capability::Notifications));
    }
}
