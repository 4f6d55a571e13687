use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};
use parking_lot::RwLock;

use crate::config::AcquisitionConfig;
use crate::drivers::{
    BrainFlowTransport, BufferReader, DeviceTransport, SimulatedTransport, StreamingBuffer,
};
use crate::error::{AcquisitionError, ConnectError};
use crate::types::{ChannelLayout, ConnectionState, DeviceMode, Sample};

/// Upper bound on samples moved per `pump` call so callers keep servicing commands.
const MAX_PUMP_BATCH: usize = 512;

/// Builds the transport for a connection attempt.
pub type TransportFactory = Box<dyn Fn(&AcquisitionConfig) -> Box<dyn DeviceTransport> + Send>;

/// Returned by a successful `connect`.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub id: u64,
    pub device: String,
    pub mode: DeviceMode,
    pub layout: ChannelLayout,
    pub sample_rate_hz: f64,
    pub reader: BufferReader,
}

/// Read-only view of the connection state, for threads that do not own the manager.
#[derive(Clone, Debug)]
pub struct StateWatch(Arc<RwLock<ConnectionState>>);

impl StateWatch {
    pub fn get(&self) -> ConnectionState {
        *self.0.read()
    }
}

struct Link {
    transport: Box<dyn DeviceTransport>,
    buffer: StreamingBuffer,
    config: AcquisitionConfig,
    handle: ConnectionHandle,
    last_sample_at: Instant,
}

/// Owns the single device connection and its state machine.
///
/// Failures move the state to `Error` and are returned to the caller. Nothing
/// is retried here: leaving `Error` takes an explicit `disconnect`.
pub struct DeviceConnectionManager {
    factory: TransportFactory,
    state: Arc<RwLock<ConnectionState>>,
    last_error: Option<AcquisitionError>,
    link: Option<Link>,
    next_id: u64,
}

impl DeviceConnectionManager {
    pub fn new(factory: TransportFactory) -> Self {
        Self {
            factory,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            last_error: None,
            link: None,
            next_id: 1,
        }
    }

    /// Simulator in demo mode, BrainFlow otherwise.
    pub fn with_default_transports() -> Self {
        Self::new(Box::new(|config: &AcquisitionConfig| -> Box<dyn DeviceTransport> {
            if config.demo_mode {
                Box::new(SimulatedTransport::new(
                    config.channels.clone(),
                    config.sampling_rate_hz,
                ))
            } else {
                Box::new(BrainFlowTransport::new(config))
            }
        }))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn watch(&self) -> StateWatch {
        StateWatch(self.state.clone())
    }

    pub fn last_error(&self) -> Option<&AcquisitionError> {
        self.last_error.as_ref()
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.link.as_ref().map(|l| &l.handle)
    }

    pub fn buffer_reader(&self) -> Option<BufferReader> {
        self.link.as_ref().map(|l| l.buffer.reader())
    }

    fn set_state(&mut self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != next {
            info!("connection {} -> {}", *state, next);
            *state = next;
        }
    }

    fn fail(&mut self, err: AcquisitionError) -> AcquisitionError {
        warn!("acquisition failed: {err}");
        self.set_state(ConnectionState::Error);
        self.last_error = Some(err.clone());
        err
    }

    fn require(&self, operation: &'static str, expected: ConnectionState) -> Result<(), AcquisitionError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(AcquisitionError::InvalidState { operation, state })
        }
    }

    /// Validates `config`, then runs the transport handshake bounded by
    /// `handshake_timeout_ms`.
    pub fn connect(&mut self, config: AcquisitionConfig) -> Result<ConnectionHandle, AcquisitionError> {
        self.require("connect", ConnectionState::Disconnected)?;
        config.validate()?;
        let buffer = StreamingBuffer::new(
            config.channels.eeg.clone(),
            config.sampling_rate_hz,
            config.window_seconds,
        )?;

        self.set_state(ConnectionState::Connecting);
        self.last_error = None;
        let mut transport = (self.factory)(&config);
        let device = transport.describe();
        info!("connecting to {device} ({})", config.device_mode());

        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("musepy-handshake".into())
            .spawn(move || {
                let result = transport.open();
                // The receiver is gone if the handshake already timed out.
                let _ = tx.send((transport, result));
            });
        if let Err(e) = spawned {
            return Err(self.fail(
                ConnectError::Unavailable {
                    device,
                    reason: e.to_string(),
                }
                .into(),
            ));
        }

        let timeout = config.handshake_timeout();
        let transport = match rx.recv_timeout(timeout) {
            Ok((transport, Ok(()))) => transport,
            Ok((mut transport, Err(e))) => {
                let _ = transport.close();
                return Err(self.fail(e.into()));
            }
            Err(RecvTimeoutError::Timeout) => {
                return Err(self.fail(
                    ConnectError::HandshakeTimeout {
                        device,
                        timeout_ms: config.handshake_timeout_ms,
                    }
                    .into(),
                ));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(self.fail(
                    ConnectError::Handshake {
                        device,
                        reason: "handshake thread exited without reporting".into(),
                    }
                    .into(),
                ));
            }
        };

        let handle = ConnectionHandle {
            id: self.next_id,
            device,
            mode: config.device_mode(),
            layout: config.channels.clone(),
            sample_rate_hz: config.sampling_rate_hz,
            reader: buffer.reader(),
        };
        self.next_id += 1;
        self.link = Some(Link {
            transport,
            buffer,
            config,
            handle: handle.clone(),
            last_sample_at: Instant::now(),
        });
        self.set_state(ConnectionState::Connected);
        Ok(handle)
    }

    /// Tears down the link from any state, including `Error`.
    pub fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.transport.stop() {
                warn!("stop during disconnect: {e}");
            }
            if let Err(e) = link.transport.close() {
                warn!("close during disconnect: {e}");
            }
        }
        self.last_error = None;
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn start_stream(&mut self) -> Result<(), AcquisitionError> {
        self.require("start streaming", ConnectionState::Connected)?;
        let Some(link) = self.link.as_mut() else {
            return Err(AcquisitionError::InvalidState {
                operation: "start streaming",
                state: self.state(),
            });
        };
        if let Err(e) = link.transport.start() {
            return Err(self.fail(e));
        }
        link.last_sample_at = Instant::now();
        self.set_state(ConnectionState::Streaming);
        Ok(())
    }

    pub fn stop_stream(&mut self) -> Result<(), AcquisitionError> {
        self.require("stop streaming", ConnectionState::Streaming)?;
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.transport.stop() {
                return Err(self.fail(e));
            }
        }
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Moves ready samples from the transport into the live buffer, handing each
    /// accepted sample to `sink` in arrival order. Returns how many were moved.
    ///
    /// Never waits for data. A quiet transport past `read_timeout_ms` is an error.
    pub fn pump(&mut self, mut sink: impl FnMut(&Sample)) -> Result<usize, AcquisitionError> {
        if self.state() != ConnectionState::Streaming {
            return Ok(0);
        }
        let Some(link) = self.link.as_mut() else {
            return Ok(0);
        };
        let mut moved = 0;
        let outcome = loop {
            if moved == MAX_PUMP_BATCH {
                break Ok(());
            }
            match link.transport.read_next_sample() {
                Ok(Some(sample)) => {
                    if let Err(e) = sample.check_layout(&link.config.channels) {
                        break Err(AcquisitionError::from(e));
                    }
                    if let Err(e) = link.buffer.push(&sample) {
                        break Err(e.into());
                    }
                    sink(&sample);
                    moved += 1;
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let now = Instant::now();
        let outcome = outcome.and_then(|()| {
            if moved > 0 {
                link.last_sample_at = now;
                Ok(())
            } else if now.duration_since(link.last_sample_at) > link.config.read_timeout() {
                Err(AcquisitionError::ReadTimeout {
                    timeout_ms: link.config.read_timeout_ms,
                })
            } else {
                Ok(())
            }
        });
        match outcome {
            Ok(()) => Ok(moved),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Changes the live window length. Samples that no longer fit are dropped.
    pub fn resize_window(&mut self, window_seconds: u32) -> Result<(), AcquisitionError> {
        crate::config::validate_window(window_seconds)?;
        let state = self.state();
        let link = self.link.as_mut().ok_or(AcquisitionError::InvalidState {
            operation: "resize the window",
            state,
        })?;
        link.buffer.resize(window_seconds)?;
        link.config.window_seconds = window_seconds;
        debug!("live window is now {window_seconds}s");
        Ok(())
    }

    pub fn set_channel_visible(&mut self, name: &str, visible: bool) -> Result<(), AcquisitionError> {
        let state = self.state();
        let link = self.link.as_ref().ok_or(AcquisitionError::InvalidState {
            operation: "toggle channel visibility",
            state,
        })?;
        link.buffer.set_channel_visible(name, visible)?;
        Ok(())
    }
}

impl Drop for DeviceConnectionManager {
    fn drop(&mut self) {
        if self.link.is_some() {
            self.disconnect();
        }
    }
}
