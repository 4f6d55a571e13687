use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::drivers::source::DeviceTransport;
use crate::error::{AcquisitionError, ConnectError};
use crate::types::{ChannelLayout, Sample, SignalKind};

// Auxiliary sensors run slower than EEG: IMU ~52 Hz, PPG 64 Hz at 256 Hz EEG.
const IMU_DECIMATION: u64 = 5;
const PPG_DECIMATION: u64 = 4;

/// Synthetic headband for demo mode.
///
/// Paced mode releases samples as wall-clock time passes, so consumers see the
/// configured sampling rate. Unpaced mode hands out one sample per read.
pub struct SimulatedTransport {
    layout: ChannelLayout,
    sample_rate_hz: f64,
    rng: StdRng,
    paced: bool,
    started_at: Option<Instant>,
    timeline_open: bool,
    start_unix: f64,
    emitted: u64,
}

impl SimulatedTransport {
    pub fn new(layout: ChannelLayout, sample_rate_hz: f64) -> Self {
        Self {
            layout,
            sample_rate_hz,
            rng: StdRng::from_entropy(),
            paced: true,
            started_at: None,
            timeline_open: false,
            start_unix: 0.0,
            emitted: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn due(&self) -> u64 {
        match self.started_at {
            Some(_) if !self.paced => self.emitted + 1,
            Some(at) => (at.elapsed().as_secs_f64() * self.sample_rate_hz) as u64,
            None => 0,
        }
    }

    fn randn(&mut self) -> f32 {
        let u1: f32 = self.rng.gen_range(f32::EPSILON..1.0);
        let u2: f32 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
    }

    fn synthesize(&mut self) -> Sample {
        let index = self.emitted;
        let timestamp = self.start_unix + index as f64 / self.sample_rate_hz;
        let eeg = (0..self.layout.eeg.len())
            .map(|ch| self.randn() * 50.0 + 100.0 + 50.0 * ch as f32)
            .collect();
        let mut sample = Sample::eeg(timestamp, eeg);

        if !self.layout.imu.is_empty() && index % IMU_DECIMATION == 0 {
            let values = (0..self.layout.imu.len())
                .map(|ch| {
                    // Gravity on the Z accelerometer axis, small noise elsewhere.
                    let bias = if ch == 2 { 1.0 } else { 0.0 };
                    bias + self.randn() * 0.02
                })
                .collect();
            sample = sample.with_aux(SignalKind::Imu, timestamp, values);
        }
        if !self.layout.ppg.is_empty() && index % PPG_DECIMATION == 0 {
            let phase = (timestamp * std::f64::consts::TAU * 1.2).sin() as f32;
            let values = (0..self.layout.ppg.len())
                .map(|_| 1000.0 + 200.0 * phase + self.randn() * 5.0)
                .collect();
            sample = sample.with_aux(SignalKind::Ppg, timestamp, values);
        }
        self.emitted += 1;
        sample
    }
}

impl DeviceTransport for SimulatedTransport {
    fn describe(&self) -> String {
        "simulated headband".to_owned()
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), AcquisitionError> {
        if !self.timeline_open {
            self.start_unix = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            self.emitted = 0;
            self.timeline_open = true;
        }
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AcquisitionError> {
        // Fold emitted samples into the origin so a restart continues the timeline.
        if self.started_at.take().is_some() {
            self.start_unix += self.emitted as f64 / self.sample_rate_hz;
            self.emitted = 0;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), AcquisitionError> {
        self.started_at = None;
        self.timeline_open = false;
        Ok(())
    }

    fn read_next_sample(&mut self) -> Result<Option<Sample>, AcquisitionError> {
        if self.emitted < self.due() {
            Ok(Some(self.synthesize()))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unpaced_samples_follow_layout_and_rate() {
        let layout = ChannelLayout::muse();
        let mut sim = SimulatedTransport::new(layout.clone(), 256.0)
            .with_seed(7)
            .unpaced();
        assert!(sim.read_next_sample().unwrap().is_none());
        sim.start().unwrap();

        let samples: Vec<Sample> = (0..20)
            .map(|_| sim.read_next_sample().unwrap().unwrap())
            .collect();
        for pair in samples.windows(2) {
            let dt = pair[1].timestamp - pair[0].timestamp;
            assert!((dt - 1.0 / 256.0).abs() < 1e-6);
        }
        for s in &samples {
            assert!(s.check_layout(&layout).is_ok());
        }
        let imu = samples
            .iter()
            .flat_map(|s| &s.auxiliary)
            .filter(|a| a.kind == SignalKind::Imu)
            .count();
        let ppg = samples
            .iter()
            .flat_map(|s| &s.auxiliary)
            .filter(|a| a.kind == SignalKind::Ppg)
            .count();
        assert_eq!(imu, 4);
        assert_eq!(ppg, 5);
    }

    #[test]
    fn paced_output_tracks_wall_clock() {
        let mut sim = SimulatedTransport::new(ChannelLayout::eeg_only(&["A", "B"]), 200.0);
        sim.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        let mut count = 0;
        while sim.read_next_sample().unwrap().is_some() {
            count += 1;
        }
        // ~20 samples are due after 100 ms; allow scheduler slack.
        assert!(count >= 15, "only {count} samples after 100ms");
        assert!(count <= 60, "{count} samples after 100ms");
    }

    #[test]
    fn timeline_continues_across_stop_and_start() {
        let mut sim = SimulatedTransport::new(ChannelLayout::eeg_only(&["A"]), 100.0).unpaced();
        sim.start().unwrap();
        let first = sim.read_next_sample().unwrap().unwrap();
        let second = sim.read_next_sample().unwrap().unwrap();
        sim.stop().unwrap();
        assert!(sim.read_next_sample().unwrap().is_none());
        sim.start().unwrap();
        let third = sim.read_next_sample().unwrap().unwrap();
        assert!(second.timestamp > first.timestamp);
        // f64 steps are ~2.4e-7 at unix-second magnitude.
        assert!((third.timestamp - second.timestamp - 0.01).abs() < 1e-6);
    }
}
