// src/engine.rs
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SendError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use crate::device::DeviceConnectionManager;
use crate::error::AcquisitionError;
use crate::recorder::{self, Recording, RecordingHandle, RecordingMetadata, RecordingSession};
use crate::types::{ConnectionState, EngineCommand, EngineMessage};

/// Commands drained per loop turn before samples are moved again.
const COMMANDS_PER_TICK: usize = 16;
const TICK: Duration = Duration::from_millis(5);

/// Acquisition thread. Owns the device connection and the recorder; the
/// control path talks to it only through commands and messages.
pub struct Engine {
    commands: Sender<EngineCommand>,
    messages: Receiver<EngineMessage>,
    thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Starts the engine with the simulator for demo configs and BrainFlow otherwise.
    pub fn spawn() -> io::Result<Self> {
        Self::spawn_with(DeviceConnectionManager::with_default_transports())
    }

    pub fn spawn_with(manager: DeviceConnectionManager) -> io::Result<Self> {
        let (tx_cmd, rx_cmd) = mpsc::channel();
        let (tx_msg, rx_msg) = mpsc::channel();
        let thread = spawn_thread(manager, tx_msg, rx_cmd)?;
        Ok(Self {
            commands: tx_cmd,
            messages: rx_msg,
            thread: Some(thread),
        })
    }

    pub fn send(&self, command: EngineCommand) -> Result<(), SendError<EngineCommand>> {
        self.commands.send(command)
    }

    pub fn try_recv(&self) -> Option<EngineMessage> {
        self.messages.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<EngineMessage> {
        self.messages.recv_timeout(timeout).ok()
    }

    /// Stops the thread, sealing nothing: an open recording is dropped.
    /// Saves already handed off are waited for.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.commands.send(EngineCommand::Shutdown).ok();
            if thread.join().is_err() {
                error!("acquisition thread panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn spawn_thread(
    manager: DeviceConnectionManager,
    tx: Sender<EngineMessage>,
    rx_cmd: Receiver<EngineCommand>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("musepy-engine".into())
        .spawn(move || {
            tx.send(EngineMessage::Log("Acquisition engine ready.".to_owned()))
                .ok();
            let mut core = Core {
                manager,
                recorder: RecordingSession::new(),
                open: None,
                sealed: None,
                saves: Vec::new(),
                tx,
            };
            core.run(&rx_cmd);
            core.finish();
        })
}

struct Core {
    manager: DeviceConnectionManager,
    recorder: RecordingSession,
    open: Option<RecordingHandle>,
    /// Stopped recording waiting for a keep or discard decision.
    sealed: Option<Recording>,
    saves: Vec<JoinHandle<()>>,
    tx: Sender<EngineMessage>,
}

impl Core {
    fn run(&mut self, rx_cmd: &Receiver<EngineCommand>) {
        loop {
            // 1. commands
            for _ in 0..COMMANDS_PER_TICK {
                match rx_cmd.try_recv() {
                    Ok(EngineCommand::Shutdown) | Err(TryRecvError::Disconnected) => return,
                    Ok(cmd) => self.handle(cmd),
                    Err(TryRecvError::Empty) => break,
                }
            }

            // 2. samples
            if self.manager.state() == ConnectionState::Streaming {
                self.pump();
                thread::sleep(TICK);
            } else {
                match rx_cmd.recv_timeout(TICK * 10) {
                    Ok(EngineCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
                    Ok(cmd) => self.handle(cmd),
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }

    fn finish(&mut self) {
        if let Some(handle) = self.open.take() {
            self.recorder.discard(handle).ok();
            warn!("engine stopped with a recording in progress; it was dropped");
        }
        self.manager.disconnect();
        for save in self.saves.drain(..) {
            if save.join().is_err() {
                error!("recording save thread panicked");
            }
        }
        info!("acquisition engine stopped");
    }

    fn log(&self, line: impl Into<String>) {
        self.tx.send(EngineMessage::Log(line.into())).ok();
    }

    fn report_state(&self) {
        self.tx.send(EngineMessage::State(self.manager.state())).ok();
    }

    fn report_error(&self, err: AcquisitionError) {
        self.tx.send(EngineMessage::Error(err)).ok();
        self.report_state();
    }

    fn handle(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Connect(config) => match self.manager.connect(config) {
                Ok(handle) => {
                    self.log(format!("Connected to {}", handle.device));
                    self.tx.send(EngineMessage::Connected(handle)).ok();
                    self.report_state();
                }
                Err(e) => {
                    self.log(format!("Connect failed: {e}"));
                    self.report_error(e);
                }
            },
            EngineCommand::Disconnect => {
                self.seal_open();
                self.manager.disconnect();
                self.log("Disconnected");
                self.report_state();
            }
            EngineCommand::StartStream => match self.manager.start_stream() {
                Ok(()) => {
                    self.log("Stream started");
                    self.report_state();
                }
                Err(e) => self.report_error(e),
            },
            EngineCommand::StopStream => match self.manager.stop_stream() {
                Ok(()) => {
                    self.log("Stream stopped");
                    self.report_state();
                }
                Err(e) => self.report_error(e),
            },
            EngineCommand::ResizeWindow(secs) => match self.manager.resize_window(secs) {
                Ok(()) => self.log(format!("Live window set to {secs}s")),
                Err(e) => self.report_error(e),
            },
            EngineCommand::SetChannelVisible(name, visible) => {
                if let Err(e) = self.manager.set_channel_visible(&name, visible) {
                    self.report_error(e);
                }
            }
            EngineCommand::StartRecording(metadata) => self.start_recording(metadata),
            EngineCommand::StopRecording => {
                if self.open.is_none() {
                    self.fail_recording("no recording in progress".to_owned());
                } else {
                    self.seal_open();
                }
            }
            EngineCommand::KeepRecording(data_dir) => self.keep(data_dir),
            EngineCommand::DiscardRecording => {
                if self.sealed.take().is_some() {
                    self.log("Recording discarded");
                    self.tx.send(EngineMessage::RecordingDiscarded).ok();
                } else if let Some(handle) = self.open.take() {
                    match self.recorder.discard(handle) {
                        Ok(()) => {
                            self.log("Recording discarded");
                            self.tx.send(EngineMessage::RecordingDiscarded).ok();
                        }
                        Err(e) => self.fail_recording(e.to_string()),
                    }
                } else {
                    self.fail_recording("no recording to discard".to_owned());
                }
            }
            EngineCommand::Shutdown => {}
        }
    }

    fn start_recording(&mut self, mut metadata: RecordingMetadata) {
        let Some(handle) = self.manager.handle() else {
            self.report_error(AcquisitionError::InvalidState {
                operation: "start recording",
                state: self.manager.state(),
            });
            return;
        };
        if let Some(sealed) = &self.sealed {
            let reason = format!(
                "recording {} is still waiting to be kept or discarded",
                sealed.metadata.filename
            );
            self.fail_recording(reason);
            return;
        }
        // The connection, not the caller, decides what is being captured.
        metadata.layout = handle.layout.clone();
        metadata.sample_rate_hz = handle.sample_rate_hz;
        metadata.mode = handle.mode;

        let filename = metadata.filename.clone();
        match self.recorder.start(metadata) {
            Ok(handle) => {
                self.open = Some(handle);
                self.log(format!("Recording {filename}"));
                self.tx
                    .send(EngineMessage::RecordingStarted(handle.id()))
                    .ok();
            }
            Err(e) => self.fail_recording(e.to_string()),
        }
    }

    fn seal_open(&mut self) {
        let Some(handle) = self.open.take() else {
            return;
        };
        match self.recorder.stop(handle) {
            Ok(recording) => {
                let summary = recording.summary();
                self.log(format!(
                    "Recording {} stopped: {} samples in {:.1}s",
                    summary.filename, summary.eeg_samples, summary.duration_seconds
                ));
                self.tx.send(EngineMessage::RecordingStopped(summary)).ok();
                self.sealed = Some(recording);
            }
            Err(e) => self.fail_recording(e.to_string()),
        }
    }

    fn keep(&mut self, data_dir: PathBuf) {
        let Some(recording) = self.sealed.take() else {
            self.fail_recording("no stopped recording to keep".to_owned());
            return;
        };
        // Disk writes stay off the acquisition loop.
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name("musepy-save".into())
            .spawn(move || match recorder::persist(&recording, &data_dir) {
                Ok(artifacts) => {
                    tx.send(EngineMessage::Log(format!(
                        "Recording saved to {}",
                        artifacts.folder.display()
                    )))
                    .ok();
                    tx.send(EngineMessage::RecordingSaved(artifacts)).ok();
                }
                Err(e) => {
                    error!("saving recording failed: {e}");
                    tx.send(EngineMessage::RecordingFailed(e.to_string())).ok();
                }
            });
        match spawned {
            Ok(save) => {
                self.saves.retain(|s| !s.is_finished());
                self.saves.push(save);
            }
            Err(e) => self.fail_recording(format!("could not start save: {e}")),
        }
    }

    fn fail_recording(&self, reason: String) {
        warn!("recording: {reason}");
        self.tx.send(EngineMessage::RecordingFailed(reason)).ok();
    }

    fn pump(&mut self) {
        let recorder = &mut self.recorder;
        let mut capture_error = None;
        let result = self.manager.pump(|sample| {
            if capture_error.is_none() {
                if let Err(e) = recorder.capture(sample) {
                    capture_error = Some(e);
                }
            }
        });
        if let Some(e) = capture_error {
            self.fail_recording(e.to_string());
        }
        if let Err(e) = result {
            self.log(format!("Acquisition stopped: {e}"));
            self.seal_open();
            self.report_error(e);
        }
    }
}
