//! Termux:API backend. Polls `termux-sensor` and `termux-location` and
//! normalises their output; accelerometer values arrive in m/s² and are
//! converted to g.

use super::{now_ms, SensorBackend, LOCATION_FEED_CAPACITY, MOTION_FEED_CAPACITY};
use crate::config::BackendKind;
use crate::error::{TrackerError, TrackerResult};
use crate::types::{MotionSample, PositionFix, SensorKind};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};

const STANDARD_GRAVITY: f64 = 9.80665;
const SENSOR_TOOL: &str = "termux-sensor";
const LOCATION_TOOL: &str = "termux-location";
const SENSOR_TOOL_LIMIT: Duration = Duration::from_secs(2);
const LOCATION_TOOL_LIMIT: Duration = Duration::from_secs(30);

pub struct PlatformBackend {
    motion_poll: Duration,
    location_poll: Duration,
}

impl Default for PlatformBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformBackend {
    pub fn new() -> Self {
        Self {
            motion_poll: Duration::from_millis(300),
            location_poll: Duration::from_secs(5),
        }
    }
}

fn find_on_path(tool: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}

/// Runs a Termux tool to completion. A tool still running after `limit` is
/// killed, as is one whose caller goes away.
async fn run_tool(
    sensor: SensorKind,
    tool: &str,
    args: &[&str],
    limit: Duration,
) -> TrackerResult<Output> {
    let run = Command::new(tool).args(args).kill_on_drop(true).output();
    match timeout(limit, run).await {
        Ok(output) => output.map_err(|e| TrackerError::attach(sensor, format!("{tool}: {e}"))),
        Err(_) => Err(TrackerError::attach(
            sensor,
            format!("{tool} gave no answer within {:?}", limit),
        )),
    }
}

async fn read_accelerometer() -> Option<MotionSample> {
    let output = run_tool(
        SensorKind::Motion,
        SENSOR_TOOL,
        &["-n", "1", "-s", "accelerometer"],
        SENSOR_TOOL_LIMIT,
    )
    .await
    .ok()?;
    parse_accel_output(&String::from_utf8_lossy(&output.stdout), now_ms())
}

async fn read_location() -> TrackerResult<PositionFix> {
    let output = run_tool(
        SensorKind::Location,
        LOCATION_TOOL,
        &["-p", "gps", "-r", "once"],
        LOCATION_TOOL_LIMIT,
    )
    .await?;
    if !output.status.success() {
        return Err(TrackerError::attach(
            SensorKind::Location,
            format!("{} exited with {}", LOCATION_TOOL, output.status),
        ));
    }
    parse_location_output(&String::from_utf8_lossy(&output.stdout), now_ms())
        .ok_or_else(|| TrackerError::attach(SensorKind::Location, "unparseable location output"))
}

/// Accepts the JSON shape `{"<sensor name>": {"values": [x, y, z]}}` and the
/// older `x=.., y=.., z=..` line format. Values in m/s², returned in g.
pub(crate) fn parse_accel_output(output: &str, timestamp_ms: i64) -> Option<MotionSample> {
    let (x, y, z) = parse_accel_json(output).or_else(|| parse_accel_pairs(output))?;
    Some(MotionSample::new(
        x / STANDARD_GRAVITY,
        y / STANDARD_GRAVITY,
        z / STANDARD_GRAVITY,
        timestamp_ms,
    ))
}

fn parse_accel_json(output: &str) -> Option<(f64, f64, f64)> {
    let root: Value = serde_json::from_str(output.trim()).ok()?;
    let sensor = root.as_object()?.values().next()?;
    let values = sensor.get("values")?.as_array()?;
    let axis = |i: usize| values.get(i).and_then(Value::as_f64);
    Some((axis(0)?, axis(1)?, axis(2)?))
}

fn parse_accel_pairs(output: &str) -> Option<(f64, f64, f64)> {
    let mut x = None;
    let mut y = None;
    let mut z = None;
    for part in output.split(',') {
        let part = part.trim();
        let part = part.rsplit(' ').next().unwrap_or(part);
        if let Some(val) = part.strip_prefix("x=") {
            x = val.trim().parse().ok();
        } else if let Some(val) = part.strip_prefix("y=") {
            y = val.trim().parse().ok();
        } else if let Some(val) = part.strip_prefix("z=") {
            z = val.trim().parse().ok();
        }
    }
    Some((x?, y?, z?))
}

#[derive(Deserialize)]
struct TermuxLocation {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    accuracy: f64,
}

pub(crate) fn parse_location_output(output: &str, timestamp_ms: i64) -> Option<PositionFix> {
    let loc: TermuxLocation = serde_json::from_str(output.trim()).ok()?;
    let fix = PositionFix::new(loc.latitude, loc.longitude, loc.accuracy, timestamp_ms);
    fix.has_valid_coords().then_some(fix)
}

#[async_trait]
impl SensorBackend for PlatformBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Platform
    }

    fn is_available(&self) -> bool {
        find_on_path(SENSOR_TOOL).is_some() && find_on_path(LOCATION_TOOL).is_some()
    }

    async fn open_motion(&self) -> TrackerResult<mpsc::Receiver<MotionSample>> {
        if find_on_path(SENSOR_TOOL).is_none() {
            return Err(TrackerError::attach(
                SensorKind::Motion,
                format!("{SENSOR_TOOL} not found on PATH"),
            ));
        }
        let (tx, rx) = mpsc::channel(MOTION_FEED_CAPACITY);
        let period = self.motion_poll;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut failures = 0u64;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                let read = tokio::select! {
                    _ = tx.closed() => break,
                    read = read_accelerometer() => read,
                };
                let Some(sample) = read else {
                    failures += 1;
                    if failures % 20 == 1 {
                        warn!("[platform] accelerometer read failed ({} so far)", failures);
                    }
                    continue;
                };
                match tx.try_send(sample) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            debug!("[platform] accelerometer poll stopped");
        });
        Ok(rx)
    }

    async fn open_location(&self) -> TrackerResult<mpsc::Receiver<PositionFix>> {
        if find_on_path(LOCATION_TOOL).is_none() {
            return Err(TrackerError::attach(
                SensorKind::Location,
                format!("{LOCATION_TOOL} not found on PATH"),
            ));
        }
        let (tx, rx) = mpsc::channel(LOCATION_FEED_CAPACITY);
        let period = self.location_poll;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }
                let read = tokio::select! {
                    _ = tx.closed() => break,
                    read = read_location() => read,
                };
                match read {
                    Ok(fix) => match tx.try_send(fix) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    },
                    Err(e) => debug!("[platform] location read failed: {}", e),
                }
            }
            debug!("[platform] location poll stopped");
        });
        Ok(rx)
    }

    async fn current_position(&self) -> TrackerResult<PositionFix> {
        read_location().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_parse_termux_json() {
        let out = r#"{
  "BMI160 Accelerometer": {
    "values": [0.0, 0.0, 9.80665]
  }
}"#;
        let sample = parse_accel_output(out, 42).unwrap();
        assert_abs_diff_eq!(sample.magnitude(), 1.0, epsilon = 1e-9);
        assert_eq!(sample.timestamp_ms, 42);
    }

    #[test]
    fn test_parse_key_value_line() {
        let out = "Accelerometer event: x=0.5, y=0.3, z=9.8, accuracy=0, timestamp=1234567890";
        let sample = parse_accel_output(out, 0).unwrap();
        assert_abs_diff_eq!(sample.acceleration.x, 0.5 / STANDARD_GRAVITY, epsilon = 1e-9);
        assert_abs_diff_eq!(sample.acceleration.z, 9.8 / STANDARD_GRAVITY, epsilon = 1e-9);
    }

    #[test]
    fn test_parse_rejects_partial_output() {
        assert!(parse_accel_output("x=0.5, y=0.3", 0).is_none());
        assert!(parse_accel_output("", 0).is_none());
        assert!(parse_accel_output(r#"{"accel": {"values": [1.0]}}"#, 0).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_tool_is_cut_off() {
        let started = std::time::Instant::now();
        let err = run_tool(SensorKind::Location, "sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            err,
            TrackerError::SamplerAttachFailure {
                sensor: SensorKind::Location,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_tool_is_an_attach_failure() {
        let err = run_tool(
            SensorKind::Motion,
            "fittrack-no-such-tool",
            &[],
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::SamplerAttachFailure {
                sensor: SensorKind::Motion,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_location() {
        let out = r#"{"latitude": 37.77, "longitude": -122.41, "altitude": 10.0, "accuracy": 6.5, "provider": "gps"}"#;
        let fix = parse_location_output(out, 7).unwrap();
        assert_eq!(fix.coords.latitude, 37.77);
        assert_eq!(fix.coords.accuracy, 6.5);

        assert!(parse_location_output(r#"{"latitude": 95.0, "longitude": 0.0}"#, 0).is_none());
        assert!(parse_location_output("null", 0).is_none());
    }
}
