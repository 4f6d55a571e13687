use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ConnectionState, LayoutMismatch};

/// Invalid acquisition parameters. Always raised before any state change.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("window length must be between {min} and {max} seconds, got {actual}")]
    WindowOutOfRange { min: u32, max: u32, actual: u32 },
    #[error("sampling rate must be greater than zero, got {0}")]
    InvalidSampleRate(f64),
    #[error("channel layout needs at least one EEG channel")]
    NoEegChannels,
    #[error("duplicate channel name `{0}` in channel layout")]
    DuplicateChannel(String),
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
    #[error("failed to read config {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// Handshake failures. Recoverable by an explicit disconnect and reconnect.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConnectError {
    #[error("{device}: handshake failed: {reason}")]
    Handshake { device: String, reason: String },
    #[error("{device}: handshake did not complete within {timeout_ms} ms")]
    HandshakeTimeout { device: String, timeout_ms: u64 },
    #[error("{device}: transport unavailable: {reason}")]
    Unavailable { device: String, reason: String },
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum AcquisitionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },
    #[error("{stage} failed: {reason}")]
    Transport { stage: &'static str, reason: String },
    #[error("no sample received for {timeout_ms} ms while streaming")]
    ReadTimeout { timeout_ms: u64 },
    #[error(transparent)]
    Layout(#[from] LayoutMismatch),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("a recording is already open (handle {0})")]
    AlreadyRecording(u64),
    #[error("recording handle {0} is not open")]
    UnknownHandle(u64),
    #[error(transparent)]
    Layout(#[from] LayoutMismatch),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path} is not a recording artifact: {reason}")]
    InvalidArtifact { path: PathBuf, reason: String },
    #[error("subject id `{0}` must be a plain folder name")]
    InvalidSubject(String),
}

/// Failures of submitted routines. Isolated to the job that raised them.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum JobError {
    #[error("routine `{routine}` violates its contract: {detail}")]
    ContractViolation { routine: String, detail: String },
    #[error("job {job} (`{routine}`) failed: {cause}")]
    JobFailed {
        job: u64,
        routine: String,
        cause: String,
    },
    #[error("dataset `{0}` is not loaded")]
    UnknownDataset(String),
    #[error("job {0} is unknown or its result was already taken")]
    UnknownJob(u64),
    #[error("job {0} was cancelled")]
    Cancelled(u64),
    #[error("worker pool is shut down")]
    PoolShutDown,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("dataset label must not be empty")]
    EmptyLabel,
    #[error("dataset label `{0}` is already in use")]
    DuplicateLabel(String),
    #[error("dataset label `{0}` is not loaded")]
    UnknownLabel(String),
    #[error("{path}: incompatible session: {reason}")]
    IncompatibleSession { path: PathBuf, reason: String },
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PlotError {
    #[error("figure `{0}` has nothing to draw")]
    Empty(String),
    #[error("failed to render figure: {0}")]
    Render(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for PlotError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        PlotError::Render(format!("{value:?}"))
    }
}

impl From<image::ImageError> for PlotError {
    fn from(value: image::ImageError) -> Self {
        PlotError::Render(value.to_string())
    }
}
