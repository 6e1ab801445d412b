//! Synthetic walk: a stride-periodic accelerometer waveform and a GPS track
//! moving north at a constant speed. All state is per instance.
//!
//! Fault injection (availability, refused attaches, silenced feeds) drives the
//! sampler recovery paths without a device.

use super::{now_ms, SensorBackend, LOCATION_FEED_CAPACITY, MOTION_FEED_CAPACITY};
use crate::config::{BackendKind, SimulationConfig};
use crate::error::{TrackerError, TrackerResult};
use crate::types::{MotionSample, PositionFix, SensorKind};
use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Metres per degree of latitude.
const METRES_PER_DEG_LAT: f64 = 111_320.0;

#[derive(Default)]
struct SimState {
    available: bool,
    silenced: HashSet<SensorKind>,
    refuse_attaches: HashMap<SensorKind, u32>,
    attaches: HashMap<SensorKind, u32>,
    motion_tick: u64,
    fix_seq: u64,
}

pub struct SimulatedBackend {
    config: SimulationConfig,
    clock_origin_ms: i64,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBackend {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            clock_origin_ms: now_ms(),
            state: Arc::new(Mutex::new(SimState {
                available: true,
                ..SimState::default()
            })),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.with_state(|s| s.available = available);
    }

    /// Refuse the next `count` attach attempts for `sensor`.
    pub fn refuse_attaches(&self, sensor: SensorKind, count: u32) {
        self.with_state(|s| {
            s.refuse_attaches.insert(sensor, count);
        });
    }

    /// Keep the feed open but stop emitting (a stuck sensor).
    pub fn silence(&self, sensor: SensorKind, silenced: bool) {
        self.with_state(|s| {
            if silenced {
                s.silenced.insert(sensor);
            } else {
                s.silenced.remove(&sensor);
            }
        });
    }

    pub fn attach_count(&self, sensor: SensorKind) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.attaches.get(&sensor).copied())
            .unwrap_or(0)
    }

    fn with_state(&self, f: impl FnOnce(&mut SimState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }

    fn try_attach(&self, sensor: SensorKind) -> TrackerResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TrackerError::attach(sensor, "simulator lock poisoned"))?;
        if !state.available {
            return Err(TrackerError::attach(sensor, "simulated sensors unavailable"));
        }
        if let Some(remaining) = state.refuse_attaches.get_mut(&sensor) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TrackerError::attach(sensor, "simulated attach refusal"));
            }
        }
        *state.attaches.entry(sensor).or_insert(0) += 1;
        Ok(())
    }
}

/// Peak on the first tick of every stride, rest otherwise.
fn motion_at(config: &SimulationConfig, origin_ms: i64, tick: u64) -> MotionSample {
    let magnitude = if tick % config.ticks_per_stride.max(2) == 0 {
        config.peak_g
    } else {
        config.rest_g
    };
    let timestamp_ms = origin_ms + (tick * config.motion_period_ms) as i64;
    // Mostly vertical, with a little lateral sway.
    let sway = 0.05 * ((tick as f64) * 0.7).sin();
    let z = (magnitude * magnitude - sway * sway).max(0.0).sqrt();
    MotionSample::new(sway, 0.0, z, timestamp_ms)
}

fn fix_at(config: &SimulationConfig, origin_ms: i64, seq: u64) -> PositionFix {
    let metres = config.speed_mps * (seq * config.fix_period_ms) as f64 / 1000.0;
    let latitude = config.origin_lat + metres / METRES_PER_DEG_LAT;
    let accuracy = 5.0 + ((seq as f64) * 0.1).sin() * 2.0;
    let timestamp_ms = origin_ms + (seq * config.fix_period_ms) as i64;
    PositionFix::new(latitude, config.origin_lon, accuracy, timestamp_ms)
}

fn silenced(state: &Mutex<SimState>, sensor: SensorKind) -> bool {
    state
        .lock()
        .map(|s| s.silenced.contains(&sensor))
        .unwrap_or(true)
}

#[async_trait]
impl SensorBackend for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    fn is_available(&self) -> bool {
        self.state.lock().map(|s| s.available).unwrap_or(false)
    }

    async fn open_motion(&self) -> TrackerResult<mpsc::Receiver<MotionSample>> {
        self.try_attach(SensorKind::Motion)?;
        let (tx, rx) = mpsc::channel(MOTION_FEED_CAPACITY);
        let state = self.state.clone();
        let config = self.config.clone();
        let origin = self.clock_origin_ms;

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(config.motion_period_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                if silenced(&state, SensorKind::Motion) {
                    continue;
                }
                let tick = match state.lock() {
                    Ok(mut s) => {
                        let t = s.motion_tick;
                        s.motion_tick += 1;
                        t
                    }
                    Err(_) => break,
                };
                match tx.try_send(motion_at(&config, origin, tick)) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            debug!("[sim] motion feed detached");
        });
        Ok(rx)
    }

    async fn open_location(&self) -> TrackerResult<mpsc::Receiver<PositionFix>> {
        self.try_attach(SensorKind::Location)?;
        let (tx, rx) = mpsc::channel(LOCATION_FEED_CAPACITY);
        let state = self.state.clone();
        let config = self.config.clone();
        let origin = self.clock_origin_ms;

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(config.fix_period_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                if silenced(&state, SensorKind::Location) {
                    continue;
                }
                let seq = match state.lock() {
                    Ok(mut s) => {
                        s.fix_seq += 1;
                        s.fix_seq
                    }
                    Err(_) => break,
                };
                match tx.try_send(fix_at(&config, origin, seq)) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            debug!("[sim] location feed detached");
        });
        Ok(rx)
    }

    async fn current_position(&self) -> TrackerResult<PositionFix> {
        let state = self
            .state
            .lock()
            .map_err(|_| TrackerError::attach(SensorKind::Location, "simulator lock poisoned"))?;
        if !state.available || state.silenced.contains(&SensorKind::Location) {
            return Err(TrackerError::attach(SensorKind::Location, "no simulated fix"));
        }
        Ok(fix_at(&self.config, self.clock_origin_ms, state.fix_seq))
    }
}
