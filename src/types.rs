// src/types.rs
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AcquisitionConfig;
use crate::device::ConnectionHandle;
use crate::error::AcquisitionError;
use crate::recorder::{RecordingArtifacts, RecordingMetadata, RecordingSummary};

/// Signal families delivered by the headband.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Eeg,
    Imu,
    Ppg,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Eeg, SignalKind::Imu, SignalKind::Ppg];

    /// Key used for this signal in recording exports.
    pub fn key(self) -> &'static str {
        match self {
            SignalKind::Eeg => "eeg",
            SignalKind::Imu => "imu",
            SignalKind::Ppg => "ppg",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Channel names per signal family. Fixed for the lifetime of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub eeg: Vec<String>,
    #[serde(default)]
    pub imu: Vec<String>,
    #[serde(default)]
    pub ppg: Vec<String>,
}

impl ChannelLayout {
    /// Muse 2 / Muse S electrode and sensor names.
    pub fn muse() -> Self {
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            eeg: names(&["TP9", "AF7", "AF8", "TP10"]),
            imu: names(&["AccX", "AccY", "AccZ", "GyroX", "GyroY", "GyroZ"]),
            ppg: names(&["PPG_1", "PPG_2"]),
        }
    }

    pub fn eeg_only(names: &[&str]) -> Self {
        Self {
            eeg: names.iter().map(|s| s.to_string()).collect(),
            imu: Vec::new(),
            ppg: Vec::new(),
        }
    }

    pub fn channels(&self, kind: SignalKind) -> &[String] {
        match kind {
            SignalKind::Eeg => &self.eeg,
            SignalKind::Imu => &self.imu,
            SignalKind::Ppg => &self.ppg,
        }
    }

    pub fn eeg_index(&self, name: &str) -> Option<usize> {
        self.eeg.iter().position(|c| c == name)
    }
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self::muse()
    }
}

/// An IMU or PPG reading, delivered at its own rate alongside the EEG stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuxReading {
    pub kind: SignalKind,
    pub timestamp: f64,
    pub values: Vec<f32>,
}

/// One timestamped multi-channel reading. `timestamp` is in unix seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    pub eeg: Vec<f32>,
    #[serde(default)]
    pub auxiliary: Vec<AuxReading>,
}

impl Sample {
    pub fn eeg(timestamp: f64, eeg: Vec<f32>) -> Self {
        Self {
            timestamp,
            eeg,
            auxiliary: Vec::new(),
        }
    }

    pub fn with_aux(mut self, kind: SignalKind, timestamp: f64, values: Vec<f32>) -> Self {
        self.auxiliary.push(AuxReading {
            kind,
            timestamp,
            values,
        });
        self
    }

    /// Checks every family present in the sample against the connection layout.
    pub fn check_layout(&self, layout: &ChannelLayout) -> Result<(), LayoutMismatch> {
        if self.eeg.len() != layout.eeg.len() {
            return Err(LayoutMismatch {
                kind: SignalKind::Eeg,
                expected: layout.eeg.len(),
                actual: self.eeg.len(),
            });
        }
        for aux in &self.auxiliary {
            let expected = layout.channels(aux.kind).len();
            if aux.kind == SignalKind::Eeg || aux.values.len() != expected {
                return Err(LayoutMismatch {
                    kind: aux.kind,
                    expected,
                    actual: aux.values.len(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("sample has {actual} {kind} values, connection expects {expected}")]
pub struct LayoutMismatch {
    pub kind: SignalKind,
    pub expected: usize,
    pub actual: usize,
}

/// Connection lifecycle. Written only by the connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Error => "in error",
        };
        f.write_str(s)
    }
}

/// Supported headbands. BLED variants go through the BLED112 dongle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceModel {
    #[default]
    Muse2,
    MuseS,
    Muse2Bled,
    MuseSBled,
}

impl DeviceModel {
    pub fn name(self) -> &'static str {
        match self {
            DeviceModel::Muse2 => "Muse 2",
            DeviceModel::MuseS => "Muse S",
            DeviceModel::Muse2Bled => "Muse 2 (BLED)",
            DeviceModel::MuseSBled => "Muse S (BLED)",
        }
    }

    pub fn is_bled(self) -> bool {
        matches!(self, DeviceModel::Muse2Bled | DeviceModel::MuseSBled)
    }
}

/// What produced a stream: a real headband or the simulator standing in for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMode {
    pub model: DeviceModel,
    pub demo: bool,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.demo {
            write!(f, "{} (demo)", self.model.name())
        } else {
            f.write_str(self.model.name())
        }
    }
}

// Control path -> acquisition engine
#[derive(Clone, Debug)]
pub enum EngineCommand {
    Connect(AcquisitionConfig),
    Disconnect,
    StartStream,
    StopStream,
    ResizeWindow(u32),
    SetChannelVisible(String, bool),
    StartRecording(RecordingMetadata),
    StopRecording,
    /// Persist the last sealed recording below the given data folder.
    KeepRecording(std::path::PathBuf),
    DiscardRecording,
    Shutdown,
}

// Acquisition engine -> control path
#[derive(Clone, Debug)]
pub enum EngineMessage {
    Log(String),
    State(ConnectionState),
    Connected(ConnectionHandle),
    Error(AcquisitionError),
    RecordingStarted(u64),
    RecordingStopped(RecordingSummary),
    RecordingSaved(RecordingArtifacts),
    RecordingDiscarded,
    RecordingFailed(String),
}
