use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{validate_window, window_capacity};
use crate::error::ConfigError;
use crate::types::{LayoutMismatch, Sample, SignalKind};

/// Point-in-time copy of the live window, restricted to visible channels.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamingWindow {
    pub sample_rate_hz: f64,
    pub window_seconds: u32,
    pub channel_labels: Vec<String>,
    pub timestamps: Vec<f64>,
    pub samples: Vec<Vec<f32>>, // channels x samples
}

impl StreamingWindow {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.len() as f64 / self.sample_rate_hz
    }

    pub fn channel(&self, name: &str) -> Option<&[f32]> {
        self.channel_labels
            .iter()
            .position(|c| c == name)
            .map(|idx| self.samples[idx].as_slice())
    }

    /// Seconds since the oldest sample in the window.
    pub fn relative_times(&self) -> Vec<f64> {
        let origin = self.timestamps.first().copied().unwrap_or(0.0);
        self.timestamps.iter().map(|t| t - origin).collect()
    }
}

// Slot sequence while the writer is mid-update.
const WRITING: u64 = u64::MAX;

struct Slot {
    // `index + 1` of the committed sample, or WRITING.
    seq: AtomicU64,
    timestamp: AtomicU64,
    values: Box<[AtomicU32]>,
}

struct Ring {
    slots: Box<[Slot]>,
    // Number of samples committed into this ring.
    head: AtomicU64,
    window_seconds: u32,
}

impl Ring {
    fn new(capacity: usize, channels: usize, window_seconds: u32) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                seq: AtomicU64::new(0),
                timestamp: AtomicU64::new(0),
                values: (0..channels).map(|_| AtomicU32::new(0)).collect(),
            })
            .collect();
        Self {
            slots,
            head: AtomicU64::new(0),
            window_seconds,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: u64) -> &Slot {
        &self.slots[(index % self.slots.len() as u64) as usize]
    }

    fn write(&self, index: u64, timestamp: f64, values: &[f32]) {
        let slot = self.slot(index);
        slot.seq.store(WRITING, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.timestamp.store(timestamp.to_bits(), Ordering::Relaxed);
        for (cell, value) in slot.values.iter().zip(values) {
            cell.store(value.to_bits(), Ordering::Relaxed);
        }
        slot.seq.store(index + 1, Ordering::Release);
        self.head.store(index + 1, Ordering::Release);
    }

    /// Appends the values of sample `index` to `out` and returns its timestamp,
    /// or `None` if the slot no longer (or not yet) holds that sample.
    fn read(&self, index: u64, out: &mut Vec<f32>) -> Option<f64> {
        let slot = self.slot(index);
        let before = slot.seq.load(Ordering::Acquire);
        if before != index + 1 {
            return None;
        }
        let start = out.len();
        let timestamp = f64::from_bits(slot.timestamp.load(Ordering::Relaxed));
        out.extend(
            slot.values
                .iter()
                .map(|cell| f32::from_bits(cell.load(Ordering::Relaxed))),
        );
        fence(Ordering::Acquire);
        if slot.seq.load(Ordering::Relaxed) != before {
            out.truncate(start);
            return None;
        }
        Some(timestamp)
    }
}

struct Shared {
    ring: RwLock<Arc<Ring>>,
    visible: Box<[AtomicBool]>,
    evicted: AtomicU64,
    channel_labels: Vec<String>,
    sample_rate_hz: f64,
}

impl Shared {
    fn set_channel_visible(&self, name: &str, visible: bool) -> Result<(), ConfigError> {
        let idx = self
            .channel_labels
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| ConfigError::UnknownChannel(name.to_owned()))?;
        self.visible[idx].store(visible, Ordering::Relaxed);
        Ok(())
    }

    fn snapshot(&self) -> StreamingWindow {
        // The lock is only held to clone the ring pointer; the writer takes it
        // exclusively on resize alone.
        let ring = self.ring.read().clone();
        let visible: Vec<usize> = self
            .visible
            .iter()
            .enumerate()
            .filter(|(_, v)| v.load(Ordering::Relaxed))
            .map(|(idx, _)| idx)
            .collect();

        let head = ring.head.load(Ordering::Acquire);
        let first = head.saturating_sub(ring.capacity() as u64);
        let expected = (head - first) as usize;

        let mut timestamps = Vec::with_capacity(expected);
        let mut samples = vec![Vec::with_capacity(expected); visible.len()];
        let mut row = Vec::with_capacity(self.channel_labels.len());
        for index in first..head {
            row.clear();
            // A miss means the writer lapped this slot during the copy; only the
            // oldest entries can be lapped, so ordering is preserved.
            if let Some(timestamp) = ring.read(index, &mut row) {
                timestamps.push(timestamp);
                for (column, &ch) in samples.iter_mut().zip(&visible) {
                    column.push(row[ch]);
                }
            }
        }

        StreamingWindow {
            sample_rate_hz: self.sample_rate_hz,
            window_seconds: ring.window_seconds,
            channel_labels: visible
                .iter()
                .map(|&idx| self.channel_labels[idx].clone())
                .collect(),
            timestamps,
            samples,
        }
    }
}

/// Fixed-latency EEG ring owned by the acquisition path.
///
/// `push` never blocks and overwrites the oldest sample once the window is full.
/// Readers obtained from [`StreamingBuffer::reader`] take snapshots concurrently
/// without pausing the writer; a sample becomes visible only after all of its
/// channel values are committed.
pub struct StreamingBuffer {
    shared: Arc<Shared>,
    ring: Arc<Ring>,
    written: u64,
}

impl StreamingBuffer {
    pub fn new(
        channel_labels: Vec<String>,
        sample_rate_hz: f64,
        window_seconds: u32,
    ) -> Result<Self, ConfigError> {
        validate_window(window_seconds)?;
        if !(sample_rate_hz > 0.0) {
            return Err(ConfigError::InvalidSampleRate(sample_rate_hz));
        }
        if channel_labels.is_empty() {
            return Err(ConfigError::NoEegChannels);
        }
        let capacity = window_capacity(window_seconds, sample_rate_hz);
        let ring = Arc::new(Ring::new(capacity, channel_labels.len(), window_seconds));
        let shared = Arc::new(Shared {
            ring: RwLock::new(ring.clone()),
            visible: channel_labels.iter().map(|_| AtomicBool::new(true)).collect(),
            evicted: AtomicU64::new(0),
            channel_labels,
            sample_rate_hz,
        });
        Ok(Self {
            shared,
            ring,
            written: 0,
        })
    }

    pub fn reader(&self) -> BufferReader {
        BufferReader {
            shared: self.shared.clone(),
        }
    }

    pub fn push(&mut self, sample: &Sample) -> Result<(), LayoutMismatch> {
        let channels = self.shared.channel_labels.len();
        if sample.eeg.len() != channels {
            return Err(LayoutMismatch {
                kind: SignalKind::Eeg,
                expected: channels,
                actual: sample.eeg.len(),
            });
        }
        if self.written >= self.ring.capacity() as u64 {
            self.shared.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.ring.write(self.written, sample.timestamp, &sample.eeg);
        self.written += 1;
        Ok(())
    }

    /// Reallocates for a new window length, keeping the most recent samples that fit.
    pub fn resize(&mut self, window_seconds: u32) -> Result<(), ConfigError> {
        validate_window(window_seconds)?;
        let capacity = window_capacity(window_seconds, self.shared.sample_rate_hz);
        let held = self.len() as u64;
        let keep = held.min(capacity as u64);

        let ring = Arc::new(Ring::new(
            capacity,
            self.shared.channel_labels.len(),
            window_seconds,
        ));
        let mut row = Vec::with_capacity(self.shared.channel_labels.len());
        let mut copied = 0u64;
        for index in self.written - keep..self.written {
            row.clear();
            if let Some(timestamp) = self.ring.read(index, &mut row) {
                ring.write(copied, timestamp, &row);
                copied += 1;
            }
        }

        self.shared
            .evicted
            .fetch_add(held - copied, Ordering::Relaxed);
        *self.shared.ring.write() = ring.clone();
        self.ring = ring;
        self.written = copied;
        log::debug!(
            "stream window resized to {window_seconds}s ({capacity} samples, kept {copied})"
        );
        Ok(())
    }

    pub fn snapshot(&self) -> StreamingWindow {
        self.shared.snapshot()
    }

    pub fn set_channel_visible(&self, name: &str, visible: bool) -> Result<(), ConfigError> {
        self.shared.set_channel_visible(name, visible)
    }

    pub fn len(&self) -> usize {
        (self.written as usize).min(self.ring.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn window_seconds(&self) -> u32 {
        self.ring.window_seconds
    }

    /// Samples dropped by eviction or by shrinking the window.
    pub fn evicted(&self) -> u64 {
        self.shared.evicted.load(Ordering::Relaxed)
    }
}

/// Read-only, cloneable view of a [`StreamingBuffer`].
#[derive(Clone)]
pub struct BufferReader {
    shared: Arc<Shared>,
}

impl BufferReader {
    pub fn snapshot(&self) -> StreamingWindow {
        self.shared.snapshot()
    }

    /// Hides or shows a channel in snapshots. Buffering is unaffected.
    pub fn set_channel_visible(&self, name: &str, visible: bool) -> Result<(), ConfigError> {
        self.shared.set_channel_visible(name, visible)
    }

    pub fn channel_labels(&self) -> &[String] {
        &self.shared.channel_labels
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.shared.sample_rate_hz
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.read().capacity()
    }

    pub fn evicted(&self) -> u64 {
        self.shared.evicted.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BufferReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferReader")
            .field("channels", &self.shared.channel_labels)
            .field("sample_rate_hz", &self.shared.sample_rate_hz)
            .finish()
    }
}
