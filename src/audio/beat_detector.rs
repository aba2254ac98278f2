use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// About one second of history at ~43 updates per second.
pub const HISTORY_SIZE: usize = 43;
/// Frames needed before any beat can be reported.
pub const WARMUP_FRAMES: usize = 10;
/// Spectrum bins averaged for the instantaneous energy (sub-bass/bass proxy).
pub const ENERGY_BINS: usize = 10;
pub const THRESHOLD_RATIO: f32 = 1.5;
pub const MIN_BEAT_INTERVAL: Duration = Duration::from_millis(200);

/// Adaptive-threshold beat detector over the low end of a byte spectrum.
///
/// A frame is a beat when its energy exceeds 1.5x the rolling average and the
/// refractory interval since the previous beat has passed.
pub struct BeatDetector {
    energy_history: VecDeque<f32>,
    last_beat_time: Option<Instant>,
    min_beat_interval: Duration,
}

impl Default for BeatDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl BeatDetector {
    pub fn new() -> Self {
        Self {
            energy_history: VecDeque::with_capacity(HISTORY_SIZE + 1),
            last_beat_time: None,
            min_beat_interval: MIN_BEAT_INTERVAL,
        }
    }

    pub fn detect(&mut self, spectrum: &[u8]) -> bool {
        self.detect_at(spectrum, Instant::now())
    }

    /// Same as [`detect`](Self::detect) with an explicit wall-clock reading.
    pub fn detect_at(&mut self, spectrum: &[u8], now: Instant) -> bool {
        let energy = Self::low_band_energy(spectrum);

        self.energy_history.push_back(energy);
        if self.energy_history.len() > HISTORY_SIZE {
            self.energy_history.pop_front();
        }

        if self.energy_history.len() < WARMUP_FRAMES {
            return false;
        }

        let average =
            self.energy_history.iter().sum::<f32>() / self.energy_history.len() as f32;

        let can_beat = self
            .last_beat_time
            .map_or(true, |last| now.saturating_duration_since(last) > self.min_beat_interval);

        if energy > average * THRESHOLD_RATIO && can_beat {
            self.last_beat_time = Some(now);
            return true;
        }

        false
    }

    /// Forget all history; call whenever a new track is loaded.
    pub fn reset(&mut self) {
        self.energy_history.clear();
        self.last_beat_time = None;
    }

    pub fn history_len(&self) -> usize {
        self.energy_history.len()
    }

    fn low_band_energy(spectrum: &[u8]) -> f32 {
        let len = spectrum.len().min(ENERGY_BINS);
        if len == 0 {
            return 0.0;
        }
        let sum: f32 = spectrum[..len]
            .iter()
            .map(|&v| {
                let v = v as f32;
                v * v
            })
            .sum();
        sum / len as f32
    }
}
