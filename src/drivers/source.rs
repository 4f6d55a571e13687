use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::error::{AcquisitionError, ConnectError};
use crate::types::Sample;

/// Device I/O primitives the connection manager drives.
///
/// `open` performs the handshake and may block; the manager runs it on a helper
/// thread and bounds it with the configured timeout. `read_next_sample` must
/// return promptly with `Ok(None)` when nothing is ready.
pub trait DeviceTransport: Send {
    fn describe(&self) -> String;
    fn open(&mut self) -> Result<(), ConnectError>;
    fn start(&mut self) -> Result<(), AcquisitionError>;
    fn stop(&mut self) -> Result<(), AcquisitionError>;
    fn close(&mut self) -> Result<(), AcquisitionError>;
    fn read_next_sample(&mut self) -> Result<Option<Sample>, AcquisitionError>;
}

#[derive(Clone, Debug)]
enum Handshake {
    Succeed,
    Fail(String),
    Hang(Duration),
}

/// Scripted transport for tests and deterministic playback.
pub struct ManualTransport {
    queue: VecDeque<Sample>,
    feed: Option<Receiver<Sample>>,
    handshake: Handshake,
    read_error: Option<String>,
    opens: Arc<AtomicUsize>,
    streaming: bool,
}

impl ManualTransport {
    pub fn new(samples: impl IntoIterator<Item = Sample>) -> Self {
        Self {
            queue: samples.into_iter().collect(),
            feed: None,
            handshake: Handshake::Succeed,
            read_error: None,
            opens: Arc::new(AtomicUsize::new(0)),
            streaming: false,
        }
    }

    /// Once the scripted samples are used up, samples sent on `feed` are read
    /// as they arrive.
    pub fn with_feed(mut self, feed: Receiver<Sample>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// The handshake blocks for `duration` and then reports failure.
    pub fn hanging_handshake(mut self, duration: Duration) -> Self {
        self.handshake = Handshake::Hang(duration);
        self
    }

    pub fn failing_handshake(mut self, reason: &str) -> Self {
        self.handshake = Handshake::Fail(reason.to_owned());
        self
    }

    /// Reads fail with `reason` once the scripted samples are used up.
    pub fn failing_after_samples(mut self, reason: &str) -> Self {
        self.read_error = Some(reason.to_owned());
        self
    }

    /// Counts handshake attempts into `counter`, including ones that never finish.
    pub fn counting_opens(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.opens = counter;
        self
    }
}

impl DeviceTransport for ManualTransport {
    fn describe(&self) -> String {
        "manual transport".to_owned()
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match &self.handshake {
            Handshake::Succeed => Ok(()),
            Handshake::Fail(reason) => Err(ConnectError::Handshake {
                device: self.describe(),
                reason: reason.clone(),
            }),
            Handshake::Hang(duration) => {
                thread::sleep(*duration);
                Err(ConnectError::Handshake {
                    device: self.describe(),
                    reason: "peer never answered".to_owned(),
                })
            }
        }
    }

    fn start(&mut self) -> Result<(), AcquisitionError> {
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AcquisitionError> {
        self.streaming = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), AcquisitionError> {
        self.streaming = false;
        Ok(())
    }

    fn read_next_sample(&mut self) -> Result<Option<Sample>, AcquisitionError> {
        if !self.streaming {
            return Ok(None);
        }
        let next = self
            .queue
            .pop_front()
            .or_else(|| self.feed.as_ref().and_then(|feed| feed.try_recv().ok()));
        match next {
            Some(sample) => Ok(Some(sample)),
            None => match &self.read_error {
                Some(reason) => Err(AcquisitionError::Transport {
                    stage: "read_next_sample",
                    reason: reason.clone(),
                }),
                None => Ok(None),
            },
        }
    }
}
