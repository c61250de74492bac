use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_node::EngineConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid simulation config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid simulation config: {0}")]
    Invalid(String),
}

/// Scenario parameters for one simulator run.
///
/// Loaded from TOML; every field has a default so partial files work. The
/// `[engine]` table overrides engine tunables for every simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub devices: usize,
    /// Messages each device sends over the run.
    pub messages_per_device: usize,
    /// Send to everyone instead of the next device in the ring.
    pub broadcast: bool,
    pub loss: f64,
    pub duplicate: f64,
    pub seed: u64,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Virtual time advanced per simulation step.
    #[serde(with = "humantime_serde")]
    pub step: Duration,
    /// How often every published record is re-announced on the LAN.
    #[serde(with = "humantime_serde")]
    pub advertise_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub send_interval: Duration,
    pub engine: EngineConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            devices: 3,
            messages_per_device: 2,
            broadcast: false,
            loss: 0.0,
            duplicate: 0.0,
            seed: 7,
            duration: Duration::from_secs(180),
            step: Duration::from_millis(250),
            advertise_interval: Duration::from_secs(2),
            send_interval: Duration::from_secs(10),
            engine: EngineConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, SimConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, SimConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| SimConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), SimConfigError> {
        if self.devices < 2 {
            return Err(SimConfigError::Invalid(format!(
                "at least two devices are needed, got {}",
                self.devices
            )));
        }
        for (name, p) in [("loss", self.loss), ("duplicate", self.duplicate)] {
            if !(0.0..=1.0).contains(&p) {
                return Err(SimConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {p}"
                )));
            }
        }
        if self.step.is_zero() {
            return Err(SimConfigError::Invalid("step must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{SimConfig, SimConfigError};

    #[test]
    fn partial_file_keeps_defaults() {
        let config = SimConfig::from_toml_str(
            r#"
            devices = 5
            loss = 0.25
            duration = "5m"

            [engine]
            display_name = "bench"
            slot_timeout = "45s"
            "#,
        )
        .expect("parse");
        assert_eq!(config.devices, 5);
        assert_eq!(config.duration, Duration::from_secs(300));
        assert_eq!(config.step, Duration::from_millis(250));
        assert_eq!(config.engine.display_name, "bench");
        assert_eq!(config.engine.slot_timeout, Duration::from_secs(45));
        assert_eq!(config.engine.max_slots, 3);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(matches!(
            SimConfig::from_toml_str("loss = 1.5"),
            Err(SimConfigError::Invalid(_))
        ));
        assert!(matches!(
            SimConfig::from_toml_str("devices = 1"),
            Err(SimConfigError::Invalid(_))
        ));
        assert!(matches!(
            SimConfig::from_toml_str("devices = \"many\""),
            Err(SimConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sim.toml");
        std::fs::write(&path, "seed = 99\nbroadcast = true\n").expect("write");
        let config = SimConfig::load(&path).expect("load");
        assert_eq!(config.seed, 99);
        assert!(config.broadcast);
        assert!(matches!(
            SimConfig::load(&dir.path().join("missing.toml")),
            Err(SimConfigError::Read { .. })
        ));
    }
}
