//! Threshold-crossing step detector.
//!
//! Coarse single-magnitude heuristic: it undercounts irregular gaits and
//! overcounts vehicle vibration. The constants below are part of the scoring
//! contract (fitscore is derived from steps produced by this detector) and
//! must not be retuned.

use crate::types::MotionSample;

/// Magnitude a sample must rise through, in g.
pub const STEP_THRESHOLD_G: f64 = 1.2;

/// Crossings closer than this to the previous sample are sensor jitter.
pub const MIN_SAMPLE_GAP_MS: i64 = 250;

/// Minimum spacing between two counted steps, enforced by the aggregator on
/// top of the detector's own gap check.
pub const STEP_REFRACTORY_MS: i64 = 500;

/// Returns 1 when `current` crosses [`STEP_THRESHOLD_G`] upward from
/// `previous`, else 0.
pub fn detect_step(current: &MotionSample, previous: &MotionSample) -> u32 {
    let magnitude = current.magnitude();
    let previous_magnitude = previous.magnitude();

    if !magnitude.is_finite() || !previous_magnitude.is_finite() {
        return 0;
    }
    if !(previous_magnitude < STEP_THRESHOLD_G && magnitude >= STEP_THRESHOLD_G) {
        return 0;
    }
    if current.timestamp_ms - previous.timestamp_ms < MIN_SAMPLE_GAP_MS {
        return 0;
    }
    1
}

/// Second debounce layer: counts a detected step only when
/// [`STEP_REFRACTORY_MS`] has passed since the last counted one.
#[derive(Clone, Debug, Default)]
pub struct StepGate {
    last_counted_ms: Option<i64>,
}

impl StepGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, timestamp_ms: i64) -> bool {
        if let Some(last) = self.last_counted_ms {
            if timestamp_ms - last < STEP_REFRACTORY_MS {
                return false;
            }
        }
        self.last_counted_ms = Some(timestamp_ms);
        true
    }
}
