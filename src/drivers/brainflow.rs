use std::collections::VecDeque;
use std::ffi::CString;
use std::os::raw::{c_char, c_double, c_int};

use anyhow::{anyhow, Context, Result};
use libloading::Library;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::config::AcquisitionConfig;
use crate::drivers::source::DeviceTransport;
use crate::error::{AcquisitionError, ConnectError};
use crate::types::{AuxReading, ChannelLayout, DeviceModel, Sample, SignalKind};

const PRESET_DEFAULT: c_int = 0;
const PRESET_AUXILIARY: c_int = 1;
const PRESET_ANCILLARY: c_int = 2;
const STREAM_RINGBUF_PACKETS: c_int = 450_000;
const MAX_CHANNEL_QUERY: usize = 64;

fn board_id(model: DeviceModel) -> c_int {
    match model {
        DeviceModel::MuseSBled => 21,
        DeviceModel::Muse2Bled => 22,
        DeviceModel::Muse2 => 38,
        DeviceModel::MuseS => 39,
    }
}

#[derive(Serialize)]
struct BrainFlowInputParams {
    serial_port: String,
    mac_address: String,
    ip_address: String,
    ip_address_aux: String,
    ip_address_anc: String,
    ip_port: i32,
    ip_port_aux: i32,
    ip_port_anc: i32,
    ip_protocol: i32,
    other_info: String,
    timeout: i32,
    serial_number: String,
    file: String,
    file_aux: String,
    file_anc: String,
    master_board: i32,
}

impl BrainFlowInputParams {
    fn for_muse(serial_port: Option<&str>, mac_address: Option<&str>, timeout_secs: i32) -> Self {
        Self {
            serial_port: serial_port.unwrap_or_default().to_string(),
            mac_address: mac_address.unwrap_or_default().to_string(),
            ip_address: String::new(),
            ip_address_aux: String::new(),
            ip_address_anc: String::new(),
            ip_port: 0,
            ip_port_aux: 0,
            ip_port_anc: 0,
            ip_protocol: 0,
            other_info: String::new(),
            timeout: timeout_secs,
            serial_number: String::new(),
            file: String::new(),
            file_aux: String::new(),
            file_anc: String::new(),
            master_board: -100, // NO_BOARD
        }
    }
}

type ChannelQuery = unsafe extern "C" fn(c_int, c_int, *mut c_int, *mut c_int) -> c_int;

struct BrainFlowApi {
    #[allow(dead_code)]
    lib: Library,
    prepare_session: unsafe extern "C" fn(c_int, *const c_char) -> c_int,
    config_board:
        unsafe extern "C" fn(*const c_char, *mut c_char, *mut c_int, c_int, *const c_char) -> c_int,
    start_stream: unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char) -> c_int,
    stop_stream: unsafe extern "C" fn(c_int, *const c_char) -> c_int,
    release_session: unsafe extern "C" fn(c_int, *const c_char) -> c_int,
    get_num_rows: unsafe extern "C" fn(c_int, c_int, *mut c_int) -> c_int,
    get_timestamp_channel: unsafe extern "C" fn(c_int, c_int, *mut c_int) -> c_int,
    get_eeg_channels: ChannelQuery,
    get_accel_channels: ChannelQuery,
    get_gyro_channels: ChannelQuery,
    get_ppg_channels: ChannelQuery,
    get_board_data_count: unsafe extern "C" fn(c_int, *mut c_int, c_int, *const c_char) -> c_int,
    get_board_data:
        unsafe extern "C" fn(c_int, c_int, *mut c_double, c_int, *const c_char) -> c_int,
}

impl BrainFlowApi {
    fn load() -> Result<Self> {
        let name = libloading::library_filename("BoardController");
        let lib = unsafe { Library::new(&name) }
            .with_context(|| format!("{} not found on the library path", name.to_string_lossy()))?;
        // Safety: signatures follow the BrainFlow C API of the official package.
        unsafe {
            Ok(Self {
                prepare_session: *lib.get(b"prepare_session\0")?,
                config_board: *lib.get(b"config_board\0")?,
                start_stream: *lib.get(b"start_stream\0")?,
                stop_stream: *lib.get(b"stop_stream\0")?,
                release_session: *lib.get(b"release_session\0")?,
                get_num_rows: *lib.get(b"get_num_rows\0")?,
                get_timestamp_channel: *lib.get(b"get_timestamp_channel\0")?,
                get_eeg_channels: *lib.get(b"get_eeg_channels\0")?,
                get_accel_channels: *lib.get(b"get_accel_channels\0")?,
                get_gyro_channels: *lib.get(b"get_gyro_channels\0")?,
                get_ppg_channels: *lib.get(b"get_ppg_channels\0")?,
                get_board_data_count: *lib.get(b"get_board_data_count\0")?,
                get_board_data: *lib.get(b"get_board_data\0")?,
                lib,
            })
        }
    }

    fn instance() -> Result<&'static BrainFlowApi> {
        static API: OnceCell<BrainFlowApi> = OnceCell::new();
        API.get_or_try_init(Self::load)
    }

    fn check(code: c_int, ctx: &str) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(anyhow!("{ctx} failed (BrainFlow code {code})"))
        }
    }

    fn prepare(&self, board: c_int, input: &CString) -> Result<()> {
        Self::check(
            unsafe { (self.prepare_session)(board, input.as_ptr()) },
            "prepare_session",
        )
    }

    fn config(&self, board: c_int, input: &CString, command: &str) -> Result<String> {
        let command = CString::new(command).context("board config contains a NUL byte")?;
        let mut response = vec![0 as c_char; 4096];
        let mut len: c_int = 0;
        Self::check(
            unsafe {
                (self.config_board)(
                    command.as_ptr(),
                    response.as_mut_ptr(),
                    &mut len as *mut c_int,
                    board,
                    input.as_ptr(),
                )
            },
            "config_board",
        )?;
        let bytes: Vec<u8> = response[..len.clamp(0, 4096) as usize]
            .iter()
            .map(|&b| b as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn start_stream(&self, board: c_int, input: &CString) -> Result<()> {
        Self::check(
            unsafe {
                (self.start_stream)(STREAM_RINGBUF_PACKETS, std::ptr::null(), board, input.as_ptr())
            },
            "start_stream",
        )
    }

    fn stop_stream(&self, board: c_int, input: &CString) -> Result<()> {
        Self::check(
            unsafe { (self.stop_stream)(board, input.as_ptr()) },
            "stop_stream",
        )
    }

    fn release(&self, board: c_int, input: &CString) -> Result<()> {
        Self::check(
            unsafe { (self.release_session)(board, input.as_ptr()) },
            "release_session",
        )
    }

    fn num_rows(&self, board: c_int, preset: c_int) -> Result<usize> {
        let mut rows: c_int = 0;
        Self::check(
            unsafe { (self.get_num_rows)(board, preset, &mut rows as *mut c_int) },
            "get_num_rows",
        )?;
        Ok(rows.max(0) as usize)
    }

    fn timestamp_channel(&self, board: c_int, preset: c_int) -> Result<usize> {
        let mut row: c_int = 0;
        Self::check(
            unsafe { (self.get_timestamp_channel)(board, preset, &mut row as *mut c_int) },
            "get_timestamp_channel",
        )?;
        Ok(row.max(0) as usize)
    }

    fn channels(&self, query: ChannelQuery, ctx: &str, board: c_int, preset: c_int) -> Result<Vec<usize>> {
        let mut out_len: c_int = 0;
        let mut buf = vec![0 as c_int; MAX_CHANNEL_QUERY];
        Self::check(
            unsafe { query(board, preset, buf.as_mut_ptr(), &mut out_len as *mut c_int) },
            ctx,
        )?;
        buf.truncate(out_len.clamp(0, MAX_CHANNEL_QUERY as c_int) as usize);
        Ok(buf.into_iter().map(|c| c.max(0) as usize).collect())
    }

    /// Drains everything buffered for `preset`. Row-major: row `r` starts at `r * count`.
    fn drain(&self, board: c_int, preset: c_int, rows: usize, input: &CString) -> Result<(Vec<f64>, usize)> {
        let mut count: c_int = 0;
        Self::check(
            unsafe {
                (self.get_board_data_count)(preset, &mut count as *mut c_int, board, input.as_ptr())
            },
            "get_board_data_count",
        )?;
        let count = count.max(0) as usize;
        if count == 0 {
            return Ok((Vec::new(), 0));
        }
        let mut buf = vec![0.0f64; rows * count];
        Self::check(
            unsafe {
                (self.get_board_data)(count as c_int, preset, buf.as_mut_ptr(), board, input.as_ptr())
            },
            "get_board_data",
        )?;
        Ok((buf, count))
    }
}

/// Row indices for one BrainFlow preset.
#[derive(Clone, Debug, Default)]
struct PresetRows {
    total: usize,
    timestamp: usize,
    values: Vec<usize>,
}

impl PresetRows {
    fn decode(&self, buf: &[f64], count: usize, col: usize) -> (f64, Vec<f32>) {
        let at = |row: usize| buf.get(row * count + col).copied().unwrap_or(0.0);
        let values = self.values.iter().map(|&row| at(row) as f32).collect();
        (at(self.timestamp), values)
    }
}

/// Muse headband behind BrainFlow's `BoardController` library.
pub struct BrainFlowTransport {
    model: DeviceModel,
    layout: ChannelLayout,
    serial_port: Option<String>,
    mac_address: Option<String>,
    timeout_secs: i32,
    board_config: Option<String>,
    session: Option<BoardSession>,
}

struct BoardSession {
    api: &'static BrainFlowApi,
    input_json: CString,
    eeg: PresetRows,
    imu: Option<PresetRows>,
    ppg: Option<PresetRows>,
    pending: VecDeque<Sample>,
    pending_aux: Vec<AuxReading>,
    streaming: bool,
}

impl BrainFlowTransport {
    pub fn new(config: &AcquisitionConfig) -> Self {
        Self {
            model: config.device,
            layout: config.channels.clone(),
            serial_port: config.serial_port.clone(),
            mac_address: config.mac_address.clone(),
            timeout_secs: (config.handshake_timeout_ms / 1000).clamp(1, i32::MAX as u64) as i32,
            board_config: config.board_config.clone(),
            session: None,
        }
    }

    fn board(&self) -> c_int {
        board_id(self.model)
    }

    /// BLED dongles enumerate as serial ports; take the configured one or the first found.
    fn resolve_port(&self) -> Result<Option<String>> {
        if !self.model.is_bled() {
            return Ok(self.serial_port.clone());
        }
        if let Some(port) = &self.serial_port {
            return Ok(Some(port.clone()));
        }
        let ports = serialport::available_ports().context("failed to enumerate serial ports")?;
        let port = ports
            .into_iter()
            .next()
            .map(|p| p.port_name)
            .ok_or_else(|| anyhow!("no serial port found for the BLED112 dongle"))?;
        info!("using serial port {port} for {}", self.model.name());
        Ok(Some(port))
    }

    fn prepare(&self) -> Result<BoardSession> {
        let api = BrainFlowApi::instance()?;
        let port = self.resolve_port()?;
        let params = BrainFlowInputParams::for_muse(
            port.as_deref(),
            self.mac_address.as_deref(),
            self.timeout_secs,
        );
        let input_json = CString::new(serde_json::to_string(&params)?)
            .context("failed to encode BrainFlow input params to C string")?;
        let board = self.board();
        api.prepare(board, &input_json)?;

        if let Some(command) = &self.board_config {
            match api.config(board, &input_json, command) {
                Ok(response) => debug!("config_board({command}) -> {response:?}"),
                Err(e) => warn!("board config {command} rejected: {e}"),
            }
        }

        let eeg = PresetRows {
            total: api.num_rows(board, PRESET_DEFAULT)?,
            timestamp: api.timestamp_channel(board, PRESET_DEFAULT)?,
            values: api.channels(api.get_eeg_channels, "get_eeg_channels", board, PRESET_DEFAULT)?,
        };
        let imu = self.aux_rows(api, SignalKind::Imu).ok();
        let ppg = self.aux_rows(api, SignalKind::Ppg).ok();
        Ok(BoardSession {
            api,
            input_json,
            eeg: truncate_rows(eeg, self.layout.eeg.len()),
            imu: imu.map(|r| truncate_rows(r, self.layout.imu.len())),
            ppg: ppg.map(|r| truncate_rows(r, self.layout.ppg.len())),
            pending: VecDeque::new(),
            pending_aux: Vec::new(),
            streaming: false,
        })
    }

    fn aux_rows(&self, api: &BrainFlowApi, kind: SignalKind) -> Result<PresetRows> {
        let board = self.board();
        let (preset, values) = match kind {
            SignalKind::Imu => {
                let mut rows =
                    api.channels(api.get_accel_channels, "get_accel_channels", board, PRESET_AUXILIARY)?;
                rows.extend(api.channels(api.get_gyro_channels, "get_gyro_channels", board, PRESET_AUXILIARY)?);
                (PRESET_AUXILIARY, rows)
            }
            SignalKind::Ppg => (
                PRESET_ANCILLARY,
                api.channels(api.get_ppg_channels, "get_ppg_channels", board, PRESET_ANCILLARY)?,
            ),
            SignalKind::Eeg => return Err(anyhow!("EEG rows come from the default preset")),
        };
        Ok(PresetRows {
            total: api.num_rows(board, preset)?,
            timestamp: api.timestamp_channel(board, preset)?,
            values,
        })
    }
}

fn truncate_rows(mut rows: PresetRows, width: usize) -> PresetRows {
    rows.values.truncate(width);
    rows
}

impl BoardSession {
    fn fill(&mut self, board: c_int) -> Result<()> {
        for (kind, preset) in [
            (SignalKind::Imu, PRESET_AUXILIARY),
            (SignalKind::Ppg, PRESET_ANCILLARY),
        ] {
            let rows = match kind {
                SignalKind::Imu => self.imu.as_ref(),
                _ => self.ppg.as_ref(),
            };
            let Some(rows) = rows else { continue };
            if rows.values.is_empty() {
                continue;
            }
            let (buf, count) = self.api.drain(board, preset, rows.total, &self.input_json)?;
            for col in 0..count {
                let (timestamp, values) = rows.decode(&buf, count, col);
                self.pending_aux.push(AuxReading {
                    kind,
                    timestamp,
                    values,
                });
            }
        }

        let (buf, count) = self
            .api
            .drain(board, PRESET_DEFAULT, self.eeg.total, &self.input_json)?;
        for col in 0..count {
            let (timestamp, eeg) = self.eeg.decode(&buf, count, col);
            self.pending.push_back(Sample::eeg(timestamp, eeg));
        }
        // Auxiliary readings ride on the newest EEG sample of the batch that carried them.
        if let Some(last) = self.pending.back_mut() {
            last.auxiliary.append(&mut self.pending_aux);
        }
        Ok(())
    }
}

fn transport_error(stage: &'static str, err: anyhow::Error) -> AcquisitionError {
    AcquisitionError::Transport {
        stage,
        reason: format!("{err:#}"),
    }
}

impl DeviceTransport for BrainFlowTransport {
    fn describe(&self) -> String {
        self.model.name().to_owned()
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        if self.session.is_some() {
            return Ok(());
        }
        match self.prepare() {
            Ok(session) => {
                info!(
                    "{} ready: {} EEG rows, imu={}, ppg={}",
                    self.model.name(),
                    session.eeg.values.len(),
                    session.imu.is_some(),
                    session.ppg.is_some()
                );
                self.session = Some(session);
                Ok(())
            }
            Err(e) if BrainFlowApi::instance().is_err() => Err(ConnectError::Unavailable {
                device: self.describe(),
                reason: format!("{e:#}"),
            }),
            Err(e) => Err(ConnectError::Handshake {
                device: self.describe(),
                reason: format!("{e:#}"),
            }),
        }
    }

    fn start(&mut self) -> Result<(), AcquisitionError> {
        let board = self.board();
        let session = self.session.as_mut().ok_or(AcquisitionError::Transport {
            stage: "start_stream",
            reason: "board session not prepared".to_owned(),
        })?;
        if !session.streaming {
            session
                .api
                .start_stream(board, &session.input_json)
                .map_err(|e| transport_error("start_stream", e))?;
            session.streaming = true;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AcquisitionError> {
        let board = self.board();
        if let Some(session) = self.session.as_mut() {
            if session.streaming {
                session
                    .api
                    .stop_stream(board, &session.input_json)
                    .map_err(|e| transport_error("stop_stream", e))?;
                session.streaming = false;
                session.pending.clear();
                session.pending_aux.clear();
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), AcquisitionError> {
        let stopped = self.stop();
        if let Some(session) = self.session.take() {
            session
                .api
                .release(self.board(), &session.input_json)
                .map_err(|e| transport_error("release_session", e))?;
        }
        stopped
    }

    fn read_next_sample(&mut self) -> Result<Option<Sample>, AcquisitionError> {
        let board = self.board();
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };
        if !session.streaming {
            return Ok(None);
        }
        if session.pending.is_empty() {
            session
                .fill(board)
                .map_err(|e| transport_error("get_board_data", e))?;
        }
        Ok(session.pending.pop_front())
    }
}

impl Drop for BrainFlowTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_ids_match_brainflow_enum() {
        assert_eq!(board_id(DeviceModel::Muse2), 38);
        assert_eq!(board_id(DeviceModel::MuseS), 39);
        assert_eq!(board_id(DeviceModel::Muse2Bled), 22);
        assert_eq!(board_id(DeviceModel::MuseSBled), 21);
    }

    #[test]
    fn rows_decode_one_column() {
        let rows = PresetRows {
            total: 3,
            timestamp: 2,
            values: vec![0, 1],
        };
        // 3 rows x 2 samples
        let buf = [1.0, 2.0, 10.0, 20.0, 100.0, 200.0];
        assert_eq!(rows.decode(&buf, 2, 1), (200.0, vec![2.0, 20.0]));
    }

    #[test]
    fn input_params_serialize_serial_port() {
        let params = BrainFlowInputParams::for_muse(Some("/dev/ttyACM0"), None, 15);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["serial_port"], "/dev/ttyACM0");
        assert_eq!(json["mac_address"], "");
        assert_eq!(json["timeout"], 15);
        assert_eq!(json["master_board"], -100);
    }
}
