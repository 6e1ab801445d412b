use crate::distance::DistanceAccumulator;
use crate::step_detector::{detect_step, StepGate};
use crate::types::{ActivitySnapshot, MotionSample, PositionFix};
use chrono::NaiveDate;

/// Running totals for one session. Owned by the session task, which is the
/// only writer; readers see published [`ActivitySnapshot`] copies.
#[derive(Clone, Debug)]
pub(crate) struct SessionTotals {
    steps: u64,
    distance_km: f64,
    gate: StepGate,
    distance: DistanceAccumulator,
    previous_motion: Option<MotionSample>,
    day: NaiveDate,
}

impl SessionTotals {
    pub(crate) fn seeded(seed: ActivitySnapshot, max_jump_km: f64, day: NaiveDate) -> Self {
        Self {
            steps: seed.steps,
            distance_km: seed.distance_km.max(0.0),
            gate: StepGate::new(),
            distance: DistanceAccumulator::new(max_jump_km),
            previous_motion: None,
            day,
        }
    }

    /// Returns true when the sample produced a counted step.
    pub(crate) fn apply_motion(&mut self, sample: MotionSample) -> bool {
        let previous = self.previous_motion.replace(sample);
        let Some(previous) = previous else {
            return false;
        };
        if detect_step(&sample, &previous) == 0 {
            return false;
        }
        if !self.gate.admit(sample.timestamp_ms) {
            return false;
        }
        self.steps += 1;
        true
    }

    /// Returns the accepted distance increment in km, zero when rejected.
    pub(crate) fn apply_fix(&mut self, fix: PositionFix) -> f64 {
        let delta = self.distance.push(fix);
        if delta > 0.0 {
            self.distance_km += delta;
        }
        delta
    }

    pub(crate) fn snapshot(&self) -> ActivitySnapshot {
        ActivitySnapshot::from_totals(self.steps, self.distance_km)
    }

    pub(crate) fn day(&self) -> NaiveDate {
        self.day
    }

    /// Closes the current day once `today` is past it. Returns the closed
    /// day and its totals; the counters restart at zero while the retained
    /// sample and fix carry over so nothing is counted twice.
    pub(crate) fn roll_over(&mut self, today: NaiveDate) -> Option<(NaiveDate, ActivitySnapshot)> {
        if today <= self.day {
            return None;
        }
        let closed = (self.day, self.snapshot());
        self.steps = 0;
        self.distance_km = 0.0;
        self.day = today;
        Some(closed)
    }
}
