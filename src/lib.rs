// src/lib.rs
//! Acquisition, recording and background analysis core for Muse EEG headbands.
//!
//! Samples flow from a [`DeviceConnectionManager`] into the live
//! [`drivers::StreamingBuffer`], optionally into a [`RecordingSession`], and
//! from kept recordings into an [`AnalysisSession`] that a [`WorkerPool`] runs
//! user routines over. [`SessionStore`] persists the analysis state.
pub mod config;
pub mod device;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod recorder;
pub mod results;
pub mod session;
pub mod store;
pub mod types;

pub use config::{AcquisitionConfig, AppConfig};
pub use device::{ConnectionHandle, DeviceConnectionManager, StateWatch};
pub use engine::Engine;
pub use error::{
    AcquisitionError, ConfigError, ConnectError, JobError, PlotError, RecordError, SessionError,
};
pub use jobs::{JobHandle, JobKind, JobStatus, WorkerPool};
pub use recorder::{Recording, RecordingMetadata, RecordingSession};
pub use results::{ExperimentOutput, FigureDescriptor, TableDescriptor};
pub use session::AnalysisSession;
pub use store::SessionStore;
pub use types::{ChannelLayout, ConnectionState, EngineCommand, EngineMessage, Sample};
