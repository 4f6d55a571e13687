use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{ChannelLayout, DeviceMode, DeviceModel, SignalKind};

pub const MIN_WINDOW_SECONDS: u32 = 1;
pub const MAX_WINDOW_SECONDS: u32 = 60;

/// Environment variable naming the JSON config file read by the binary.
pub const CONFIG_ENV: &str = "MUSEPY_CONFIG";

/// Inputs consumed at the acquisition boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub sampling_rate_hz: f64,
    pub window_seconds: u32,
    pub channels: ChannelLayout,
    pub demo_mode: bool,
    pub device: DeviceModel,
    pub serial_port: Option<String>,
    pub mac_address: Option<String>,
    pub handshake_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Sent to the board after the session is prepared. `p61` enables the PPG sensor.
    pub board_config: Option<String>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: 256.0,
            window_seconds: 5,
            channels: ChannelLayout::muse(),
            demo_mode: true,
            device: DeviceModel::Muse2,
            serial_port: None,
            mac_address: None,
            handshake_timeout_ms: 15_000,
            read_timeout_ms: 5_000,
            board_config: Some("p61".to_owned()),
        }
    }
}

impl AcquisitionConfig {
    pub fn demo() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_window(self.window_seconds)?;
        if !(self.sampling_rate_hz > 0.0) || !self.sampling_rate_hz.is_finite() {
            return Err(ConfigError::InvalidSampleRate(self.sampling_rate_hz));
        }
        if self.channels.eeg.is_empty() {
            return Err(ConfigError::NoEegChannels);
        }
        let mut seen = HashSet::new();
        for kind in SignalKind::ALL {
            for name in self.channels.channels(kind) {
                if !seen.insert(name.as_str()) {
                    return Err(ConfigError::DuplicateChannel(name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Samples per channel held by the live window.
    pub fn window_samples(&self) -> usize {
        window_capacity(self.window_seconds, self.sampling_rate_hz)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn device_mode(&self) -> DeviceMode {
        DeviceMode {
            model: self.device,
            demo: self.demo_mode,
        }
    }
}

pub fn validate_window(window_seconds: u32) -> Result<(), ConfigError> {
    if !(MIN_WINDOW_SECONDS..=MAX_WINDOW_SECONDS).contains(&window_seconds) {
        return Err(ConfigError::WindowOutOfRange {
            min: MIN_WINDOW_SECONDS,
            max: MAX_WINDOW_SECONDS,
            actual: window_seconds,
        });
    }
    Ok(())
}

pub fn window_capacity(window_seconds: u32, sampling_rate_hz: f64) -> usize {
    ((window_seconds as f64 * sampling_rate_hz).round() as usize).max(1)
}

/// Settings for the headless binary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub acquisition: AcquisitionConfig,
    pub data_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub worker_threads: usize,
    pub demo_seconds: u64,
    pub subject_id: Option<String>,
    pub description: Option<String>,
    pub processing_library: Option<PathBuf>,
    pub experiment_library: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            acquisition: AcquisitionConfig::default(),
            data_dir: PathBuf::from("data"),
            sessions_dir: PathBuf::from("sessions"),
            worker_threads: 2,
            demo_seconds: 5,
            subject_id: None,
            description: None,
            processing_library: None,
            experiment_library: None,
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file_error = |reason: String| ConfigError::File {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        let config: AppConfig = serde_json::from_str(&text).map_err(|e| file_error(e.to_string()))?;
        config.acquisition.validate()?;
        Ok(config)
    }

    /// Reads the file named by `MUSEPY_CONFIG`, or falls back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn window_bounds_are_enforced() {
        let mut config = AcquisitionConfig::default();
        for secs in [1, 5, 60] {
            config.window_seconds = secs;
            assert!(config.validate().is_ok());
        }
        for secs in [0, 61, 120] {
            config.window_seconds = secs;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::WindowOutOfRange { actual, .. }) if actual == secs
            ));
        }
    }

    #[test]
    fn rejects_bad_rate_and_layout() {
        let mut config = AcquisitionConfig::default();
        config.sampling_rate_hz = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSampleRate(0.0)));

        let mut config = AcquisitionConfig::default();
        config.channels.eeg.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoEegChannels));

        let mut config = AcquisitionConfig::default();
        config.channels.ppg.push("TP9".into());
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateChannel("TP9".into()))
        );
    }

    #[test]
    fn window_samples_follow_rate() {
        let mut config = AcquisitionConfig::default();
        config.window_seconds = 10;
        assert_eq!(config.window_samples(), 2560);
    }

    #[test]
    fn app_config_reads_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "worker_threads": 4, "acquisition": {{ "window_seconds": 12 }} }}"#
        )
        .unwrap();
        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.acquisition.window_seconds, 12);
        assert_eq!(config.acquisition.sampling_rate_hz, 256.0);
        assert_eq!(config.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn app_config_rejects_invalid_window() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "acquisition": {{ "window_seconds": 90 }} }}"#).unwrap();
        assert!(matches!(
            AppConfig::from_file(file.path()),
            Err(ConfigError::WindowOutOfRange { actual: 90, .. })
        ));
    }
}
