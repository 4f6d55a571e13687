use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::types::{ChannelLayout, DeviceMode, Sample, SignalKind};

/// Describes a recording. Captured at start, sealed unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub filename: String,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub description: String,
    pub started_at: DateTime<Local>,
    pub sample_rate_hz: f64,
    pub layout: ChannelLayout,
    pub mode: DeviceMode,
}

impl RecordingMetadata {
    /// Starts now, named after the current local time (`%Y%m%d_%H%M%S`).
    pub fn new(layout: ChannelLayout, sample_rate_hz: f64, mode: DeviceMode) -> Self {
        let started_at = Local::now();
        Self {
            filename: started_at.format("%Y%m%d_%H%M%S").to_string(),
            subject_id: None,
            description: String::new(),
            started_at,
            sample_rate_hz,
            layout,
            mode,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        let subject_id = subject_id.into();
        self.subject_id = (!subject_id.trim().is_empty()).then_some(subject_id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordingHandle(u64);

impl RecordingHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// A sealed capture: every accepted sample between start and stop, in push order.
#[derive(Clone, Debug, PartialEq)]
pub struct Recording {
    pub handle: RecordingHandle,
    pub metadata: RecordingMetadata,
    pub stopped_at: DateTime<Local>,
    pub samples: Vec<Sample>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordingSummary {
    pub handle: u64,
    pub filename: String,
    pub eeg_samples: usize,
    pub imu_readings: usize,
    pub ppg_readings: usize,
    pub duration_seconds: f64,
}

impl Recording {
    /// Wall-clock time between start and stop.
    pub fn duration_seconds(&self) -> f64 {
        (self.stopped_at - self.metadata.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    fn readings(&self, kind: SignalKind) -> usize {
        match kind {
            SignalKind::Eeg => self.samples.len(),
            _ => self
                .samples
                .iter()
                .flat_map(|s| &s.auxiliary)
                .filter(|a| a.kind == kind)
                .count(),
        }
    }

    pub fn summary(&self) -> RecordingSummary {
        RecordingSummary {
            handle: self.handle.id(),
            filename: self.metadata.filename.clone(),
            eeg_samples: self.readings(SignalKind::Eeg),
            imu_readings: self.readings(SignalKind::Imu),
            ppg_readings: self.readings(SignalKind::Ppg),
            duration_seconds: self.duration_seconds(),
        }
    }

    /// One row per reading: `timestamp, time_rel, <channels>`.
    pub fn table(&self, kind: SignalKind) -> SignalTable {
        let mut columns = vec!["timestamp".to_owned(), "time_rel".to_owned()];
        columns.extend(self.metadata.layout.channels(kind).iter().cloned());
        let origin = self.samples.first().map(|s| s.timestamp).unwrap_or(0.0);
        let row = |timestamp: f64, values: &[f32]| {
            let mut row = Vec::with_capacity(values.len() + 2);
            row.push(timestamp);
            row.push(timestamp - origin);
            row.extend(values.iter().map(|&v| v as f64));
            row
        };
        let rows = match kind {
            SignalKind::Eeg => self
                .samples
                .iter()
                .map(|s| row(s.timestamp, &s.eeg))
                .collect(),
            _ => self
                .samples
                .iter()
                .flat_map(|s| &s.auxiliary)
                .filter(|a| a.kind == kind)
                .map(|a| row(a.timestamp, &a.values))
                .collect(),
        };
        SignalTable {
            columns,
            rows,
            text: BTreeMap::new(),
        }
    }
}

/// Numeric table as stored in recording exports.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    /// Columns of a loaded CSV that are not numeric, one cell per row.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub text: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableStats {
    pub samples: usize,
    pub sampling_rate_hz: Option<f64>,
    pub duration_seconds: Option<f64>,
}

impl SignalTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().filter_map(|r| r.get(idx).copied()).collect())
    }

    pub fn text_column(&self, name: &str) -> Option<&[String]> {
        self.text.get(name).map(Vec::as_slice)
    }

    /// Sample count, mean rate and span, derived from `time_rel` when present.
    pub fn stats(&self) -> TableStats {
        let times = self.column("time_rel").filter(|t| t.len() > 1);
        let (rate, duration) = match times {
            Some(t) => {
                let span = t[t.len() - 1] - t[0];
                let mean_dt = span / (t.len() - 1) as f64;
                let rate = (mean_dt > 0.0).then(|| 1.0 / mean_dt);
                let (lo, hi) = t
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
                (rate, Some(hi - lo))
            }
            None => (None, None),
        };
        TableStats {
            samples: self.rows.len(),
            sampling_rate_hz: rate,
            duration_seconds: duration,
        }
    }
}

/// `metadata` entry of the structured export.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub filename: String,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub description: String,
    pub recording_duration: f64,
    /// Local stop time, `%H:%M:%S - %d/%m/%Y`.
    pub timestamp: String,
    pub started_at: DateTime<Local>,
    pub sample_rate_hz: f64,
    pub mode: DeviceMode,
}

/// Structured export: one table per signal family plus metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordingFile {
    pub eeg: SignalTable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imu: Option<SignalTable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppg: Option<SignalTable>,
    pub metadata: ExportMetadata,
}

impl RecordingFile {
    pub fn from_recording(recording: &Recording) -> Self {
        let present = |kind| Some(recording.table(kind)).filter(|t| !t.is_empty());
        let meta = &recording.metadata;
        Self {
            eeg: recording.table(SignalKind::Eeg),
            imu: present(SignalKind::Imu),
            ppg: present(SignalKind::Ppg),
            metadata: ExportMetadata {
                filename: meta.filename.clone(),
                subject_id: meta.subject_id.clone(),
                description: meta.description.clone(),
                recording_duration: recording.duration_seconds(),
                timestamp: recording.stopped_at.format("%H:%M:%S - %d/%m/%Y").to_string(),
                started_at: meta.started_at,
                sample_rate_hz: meta.sample_rate_hz,
                mode: meta.mode,
            },
        }
    }

    pub fn tables(&self) -> BTreeMap<SignalKind, &SignalTable> {
        let mut tables = BTreeMap::new();
        tables.insert(SignalKind::Eeg, &self.eeg);
        if let Some(imu) = &self.imu {
            tables.insert(SignalKind::Imu, imu);
        }
        if let Some(ppg) = &self.ppg {
            tables.insert(SignalKind::Ppg, ppg);
        }
        tables
    }
}

/// Files written for one kept recording.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingArtifacts {
    pub folder: PathBuf,
    pub data_file: PathBuf,
    pub csv_files: Vec<PathBuf>,
    pub description_file: Option<PathBuf>,
}

impl RecordingArtifacts {
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.data_file)
            .chain(self.csv_files.iter())
            .chain(self.description_file.iter())
    }
}

struct OpenRecording {
    handle: RecordingHandle,
    metadata: RecordingMetadata,
    samples: Vec<Sample>,
}

/// Raw capture of the acquisition stream, independent of the live window.
#[derive(Default)]
pub struct RecordingSession {
    open: Option<OpenRecording>,
    next_id: u64,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, metadata: RecordingMetadata) -> Result<RecordingHandle, RecordError> {
        if let Some(open) = &self.open {
            return Err(RecordError::AlreadyRecording(open.handle.id()));
        }
        self.next_id += 1;
        let handle = RecordingHandle(self.next_id);
        info!("recording {} started ({})", metadata.filename, metadata.mode);
        self.open = Some(OpenRecording {
            handle,
            metadata,
            samples: Vec::new(),
        });
        Ok(handle)
    }

    /// Appends `sample` to the open recording, if any.
    pub fn capture(&mut self, sample: &Sample) -> Result<(), RecordError> {
        if let Some(open) = self.open.as_mut() {
            sample.check_layout(&open.metadata.layout)?;
            open.samples.push(sample.clone());
        }
        Ok(())
    }

    pub fn stop(&mut self, handle: RecordingHandle) -> Result<Recording, RecordError> {
        let open = self.take(handle)?;
        let recording = Recording {
            handle: open.handle,
            metadata: open.metadata,
            stopped_at: Local::now(),
            samples: open.samples,
        };
        info!(
            "recording {} sealed with {} samples",
            recording.metadata.filename,
            recording.samples.len()
        );
        Ok(recording)
    }

    /// Drops an open recording without sealing it.
    pub fn discard(&mut self, handle: RecordingHandle) -> Result<(), RecordError> {
        let open = self.take(handle)?;
        info!("recording {} discarded", open.metadata.filename);
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.open.is_some()
    }

    pub fn current(&self) -> Option<RecordingHandle> {
        self.open.as_ref().map(|o| o.handle)
    }

    fn take(&mut self, handle: RecordingHandle) -> Result<OpenRecording, RecordError> {
        match &self.open {
            Some(open) if open.handle == handle => self
                .open
                .take()
                .ok_or(RecordError::UnknownHandle(handle.id())),
            _ => Err(RecordError::UnknownHandle(handle.id())),
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RecordError + '_ {
    move |source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_error(path: &Path) -> impl FnOnce(csv::Error) -> RecordError + '_ {
    move |source| RecordError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// Header row, then one record per row. Text columns follow the numeric ones.
fn write_csv(path: &Path, table: &SignalTable) -> Result<(), RecordError> {
    let file = File::create(path).map_err(io_error(path))?;
    let mut w = csv::Writer::from_writer(BufWriter::new(file));
    w.write_record(table.columns.iter().chain(table.text.keys()))
        .map_err(csv_error(path))?;
    for (idx, row) in table.rows.iter().enumerate() {
        let numbers = row.iter().map(|v| v.to_string());
        let text = table
            .text
            .values()
            .map(|cells| cells.get(idx).cloned().unwrap_or_default());
        w.write_record(numbers.chain(text)).map_err(csv_error(path))?;
    }
    w.flush().map_err(io_error(path))
}

/// Sub-folder for a subject. Only a single plain path component is accepted.
fn subject_folder(data_dir: &Path, subject: &str) -> Result<PathBuf, RecordError> {
    let plain = !subject.is_empty()
        && subject != "."
        && subject != ".."
        && !subject.contains(['/', '\\'])
        && Path::new(subject).is_relative();
    if !plain {
        return Err(RecordError::InvalidSubject(subject.to_owned()));
    }
    Ok(data_dir.join(subject))
}

/// Keeps a sealed recording on disk below `data_dir` (or its subject sub-folder).
///
/// On failure, files already written for this recording are removed again.
pub fn persist(recording: &Recording, data_dir: &Path) -> Result<RecordingArtifacts, RecordError> {
    let meta = &recording.metadata;
    let folder = match &meta.subject_id {
        Some(subject) => subject_folder(data_dir, subject)?,
        None => data_dir.to_path_buf(),
    };
    fs::create_dir_all(&folder).map_err(io_error(&folder))?;

    let mut artifacts = RecordingArtifacts {
        data_file: folder.join(format!("{}.data", meta.filename)),
        folder,
        csv_files: Vec::new(),
        description_file: None,
    };
    match write_artifacts(recording, &mut artifacts) {
        Ok(()) => {
            info!(
                "recording {} saved to {}",
                meta.filename,
                artifacts.folder.display()
            );
            Ok(artifacts)
        }
        Err(e) => {
            if let Err(cleanup) = discard_artifacts(&artifacts) {
                warn!("cleanup after failed save: {cleanup}");
            }
            Err(e)
        }
    }
}

fn write_artifacts(recording: &Recording, artifacts: &mut RecordingArtifacts) -> Result<(), RecordError> {
    let meta = &recording.metadata;
    let file = RecordingFile::from_recording(recording);
    for (kind, table) in file.tables() {
        let path = artifacts
            .folder
            .join(format!("{}_{}.csv", meta.filename, kind.key()));
        artifacts.csv_files.push(path.clone());
        write_csv(&path, table)?;
    }

    let path = &artifacts.data_file;
    let out = File::create(path).map_err(io_error(path))?;
    let mut w = BufWriter::new(out);
    serde_json::to_writer(&mut w, &file).map_err(|source| RecordError::Encode {
        path: path.clone(),
        source,
    })?;
    w.flush().map_err(io_error(path))?;

    if !meta.description.trim().is_empty() {
        let path = artifacts
            .folder
            .join(format!("{}_description.txt", meta.filename));
        artifacts.description_file = Some(path.clone());
        fs::write(&path, &meta.description).map_err(io_error(&path))?;
    }
    Ok(())
}

/// Removes every artifact that exists. Missing files are not an error.
pub fn discard_artifacts(artifacts: &RecordingArtifacts) -> Result<(), RecordError> {
    for path in artifacts.paths() {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(RecordError::Io {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
    Ok(())
}

/// Reads a structured `.data` export back.
pub fn load_recording(path: &Path) -> Result<RecordingFile, RecordError> {
    let file = File::open(path).map_err(io_error(path))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| RecordError::InvalidArtifact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Reads a CSV table with a header row, as written by `persist`.
///
/// Columns whose cells all parse as numbers (empty cells read as NaN) land in
/// `columns`/`rows`; every other column is kept as text.
pub fn load_csv_table(path: &Path) -> Result<SignalTable, RecordError> {
    let file = File::open(path).map_err(io_error(path))?;
    let invalid = |reason: String| RecordError::InvalidArtifact {
        path: path.to_path_buf(),
        reason,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let header: Vec<String> = reader
        .headers()
        .map_err(|e| invalid(e.to_string()))?
        .iter()
        .map(str::to_owned)
        .collect();
    if header.is_empty() {
        return Err(invalid("empty file".into()));
    }
    let mut cells: Vec<Vec<String>> = vec![Vec::new(); header.len()];
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| invalid(format!("row {}: {e}", idx + 1)))?;
        for (column, cell) in cells.iter_mut().zip(record.iter()) {
            column.push(cell.to_owned());
        }
    }

    let mut numeric: Vec<(String, Vec<f64>)> = Vec::new();
    let mut text = BTreeMap::new();
    for (name, column) in header.into_iter().zip(cells) {
        let parsed = column
            .iter()
            .map(|cell| match cell.as_str() {
                "" => Ok(f64::NAN),
                cell => cell.parse::<f64>(),
            })
            .collect::<Result<Vec<_>, _>>();
        match parsed {
            Ok(values) => numeric.push((name, values)),
            Err(_) => {
                text.insert(name, column);
            }
        }
    }

    let rows_len = numeric
        .first()
        .map(|(_, v)| v.len())
        .or_else(|| text.values().next().map(Vec::len))
        .unwrap_or(0);
    let rows = (0..rows_len)
        .map(|row| numeric.iter().map(|(_, values)| values[row]).collect())
        .collect();
    Ok(SignalTable {
        columns: numeric.into_iter().map(|(name, _)| name).collect(),
        rows,
        text,
    })
}
