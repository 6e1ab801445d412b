use crate::error::{TrackerError, TrackerResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default rejection threshold for a single GPS jump, shared by every distance path.
pub const DEFAULT_MAX_JUMP_KM: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Samples pushed in by host glue (JNI/FFI) through a `NativeBridge`.
    Native,
    /// Termux:API command-line tools.
    Platform,
    /// Synthetic walk generator.
    Simulated,
}

impl std::str::FromStr for BackendKind {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(BackendKind::Native),
            "platform" => Ok(BackendKind::Platform),
            "simulated" | "mock" => Ok(BackendKind::Simulated),
            other => Err(TrackerError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub first_sample_check_ms: u64,
    pub watchdog_period_ms: u64,
    pub stale_after_ms: u64,
    pub max_stale_strikes: u32,
    pub first_fix_timeout_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            first_sample_check_ms: 2_000,
            watchdog_period_ms: 15_000,
            stale_after_ms: 10_000,
            max_stale_strikes: 3,
            first_fix_timeout_ms: 15_000,
        }
    }
}

impl SamplerConfig {
    pub fn first_sample_check(&self) -> Duration {
        Duration::from_millis(self.first_sample_check_ms)
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn first_fix_timeout(&self) -> Duration {
        Duration::from_millis(self.first_fix_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub revalidate_interval_ms: u64,
    pub resume_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            revalidate_interval_ms: 60_000,
            resume_delay_ms: 1_000,
        }
    }
}

impl SupervisorConfig {
    pub fn revalidate_interval(&self) -> Duration {
        Duration::from_millis(self.revalidate_interval_ms)
    }

    pub fn resume_delay(&self) -> Duration {
        Duration::from_millis(self.resume_delay_ms)
    }
}

/// Cadence of the simulated walk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Spacing between accelerometer ticks. Must stay above the detector's
    /// 250 ms sample gap or no step is ever reported.
    pub motion_period_ms: u64,
    /// Ticks per stride; the first tick of each stride carries the peak.
    pub ticks_per_stride: u64,
    pub peak_g: f64,
    pub rest_g: f64,
    pub fix_period_ms: u64,
    pub speed_mps: f64,
    pub origin_lat: f64,
    pub origin_lon: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            motion_period_ms: 300,
            ticks_per_stride: 2,
            peak_g: 1.5,
            rest_g: 0.4,
            fix_period_ms: 1_000,
            speed_mps: 1.4,
            origin_lat: 37.7749,
            origin_lon: -122.4194,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub backend: BackendKind,
    pub device_label: String,
    pub max_jump_km: f64,
    pub flush_interval_ms: u64,
    pub permission_debounce_ms: u64,
    pub permission_check_timeout_ms: u64,
    pub reset_daily: bool,
    pub sampler: SamplerConfig,
    pub supervisor: SupervisorConfig,
    pub simulation: SimulationConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Simulated,
            device_label: "rust-device".to_string(),
            max_jump_km: DEFAULT_MAX_JUMP_KM,
            flush_interval_ms: 30_000,
            permission_debounce_ms: 2_000,
            permission_check_timeout_ms: 3_000,
            reset_daily: true,
            sampler: SamplerConfig::default(),
            supervisor: SupervisorConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Read a JSON config file; missing fields fall back to defaults.
    pub fn load(path: &Path) -> TrackerResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            TrackerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: TrackerConfig = serde_json::from_str(&contents)
            .map_err(|e| TrackerError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TrackerResult<()> {
        if !(self.max_jump_km.is_finite() && self.max_jump_km > 0.0) {
            return Err(TrackerError::Config(format!(
                "max_jump_km must be positive, got {}",
                self.max_jump_km
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(TrackerError::Config("flush_interval_ms must be non-zero".into()));
        }
        if self.sampler.max_stale_strikes == 0 {
            return Err(TrackerError::Config("max_stale_strikes must be non-zero".into()));
        }
        if self.simulation.ticks_per_stride < 2 {
            return Err(TrackerError::Config(
                "simulation.ticks_per_stride must be at least 2".into(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn permission_debounce(&self) -> Duration {
        Duration::from_millis(self.permission_debounce_ms)
    }

    pub fn permission_check_timeout(&self) -> Duration {
        Duration::from_millis(self.permission_check_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_timings() {
        let config = TrackerConfig::default();
        assert_eq!(config.flush_interval(), Duration::from_secs(30));
        assert_eq!(config.permission_debounce(), Duration::from_secs(2));
        assert_eq!(config.sampler.watchdog_period(), Duration::from_secs(15));
        assert_eq!(config.sampler.stale_after(), Duration::from_secs(10));
        assert_eq!(config.sampler.max_stale_strikes, 3);
        assert_eq!(config.supervisor.revalidate_interval(), Duration::from_secs(60));
        assert_eq!(config.supervisor.resume_delay(), Duration::from_secs(1));
        assert_eq!(config.max_jump_km, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        fs::write(
            &path,
            r#"{ "backend": "platform", "max_jump_km": 0.1, "sampler": { "stale_after_ms": 5000 } }"#,
        )
        .unwrap();

        let config = TrackerConfig::load(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Platform);
        assert_eq!(config.max_jump_km, 0.1);
        assert_eq!(config.sampler.stale_after_ms, 5000);
        assert_eq!(config.sampler.watchdog_period_ms, 15_000);
        assert_eq!(config.device_label, "rust-device");
    }

    #[test]
    fn test_rejects_invalid_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        fs::write(&path, r#"{ "max_jump_km": 0 }"#).unwrap();
        assert!(matches!(TrackerConfig::load(&path), Err(TrackerError::Config(_))));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Native".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert_eq!("mock".parse::<BackendKind>().unwrap(), BackendKind::Simulated);
        assert!("bluetooth".parse::<BackendKind>().is_err());
    }
}
