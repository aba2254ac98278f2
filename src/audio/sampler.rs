use log::{debug, trace};
use std::time::{Duration, Instant};

use super::analyser::Analyser;
use super::bands::extract_frequency_bands;
use super::beat_detector::BeatDetector;
use super::{FrameBuffer, PlaybackState};
use crate::config::SensitivitySettings;

/// How long the beat flag stays raised after a detected beat.
pub const BEAT_HOLD: Duration = Duration::from_millis(100);

/// Published playback time only moves when it is off by more than this.
pub const TIME_PUBLISH_THRESHOLD: f64 = 0.2;

/// Transient beat indicator that lowers itself after [`BEAT_HOLD`].
#[derive(Debug, Default, Clone, Copy)]
pub struct BeatFlag {
    raised_until: Option<Instant>,
}

impl BeatFlag {
    pub fn raise(&mut self, now: Instant) {
        self.raised_until = Some(now + BEAT_HOLD);
    }

    pub fn is_raised_at(&self, now: Instant) -> bool {
        self.raised_until.map_or(false, |until| now < until)
    }

    pub fn lower(&mut self) {
        self.raised_until = None;
    }
}

/// Per-frame driver: analyser bytes into the frame buffer, bands, beats and
/// throttled playback time.
pub struct FrameSampler {
    frame: FrameBuffer,
    beat_detector: BeatDetector,
    beat: BeatFlag,
    active: bool,
    publish_interval: Duration,
    last_publish: Option<Instant>,
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new(4)
    }
}

impl FrameSampler {
    pub fn new(time_publish_hz: u32) -> Self {
        Self {
            frame: FrameBuffer::new(),
            beat_detector: BeatDetector::new(),
            beat: BeatFlag::default(),
            active: false,
            publish_interval: Duration::from_secs_f64(1.0 / time_publish_hz.max(1) as f64),
            last_publish: None,
        }
    }

    pub fn start(&mut self) {
        self.active = true;
        self.last_publish = None;
    }

    /// Stops sampling; already published frame data stays readable.
    pub fn cancel(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn frame(&self) -> &FrameBuffer {
        &self.frame
    }

    pub fn clear_frame(&mut self) {
        self.frame.clear();
        self.beat.lower();
    }

    /// Forgets beat history, e.g. when a different track is loaded.
    pub fn reset_beats(&mut self) {
        self.beat_detector.reset();
        self.beat.lower();
    }

    pub fn beat_at(&self, now: Instant) -> bool {
        self.beat.is_raised_at(now)
    }

    #[cfg(test)]
    pub(crate) fn beat_history_len(&self) -> usize {
        self.beat_detector.history_len()
    }

    /// Samples one frame from `analyser` into the frame buffer.
    ///
    /// Bands are computed before beat detection, and both land in the buffer
    /// together. Returns false when no data was available this frame.
    pub fn sample(
        &mut self,
        analyser: &mut Analyser,
        sensitivity: &SensitivitySettings,
        now: Instant,
    ) -> bool {
        let bins = analyser.frequency_bin_count();
        if self.frame.ensure_bins(bins) {
            debug!("Frame buffers allocated for {} bins", bins);
        }

        if !analyser.capture() {
            trace!("Analyser busy, skipping frame");
            return false;
        }

        let Some((frequency, time_domain)) = self.frame.buffers_mut() else {
            return false;
        };
        analyser.byte_frequency_data(frequency);
        analyser.byte_time_domain_data(time_domain);

        let bands = extract_frequency_bands(frequency, analyser.fft_size(), sensitivity);
        let is_beat = self.beat_detector.detect_at(frequency, now);

        self.frame.set_frequency_bands(bands);
        if is_beat {
            self.beat.raise(now);
        }
        true
    }

    /// Publishes `elapsed` into `playback` at most once per publish interval,
    /// and only when it moved past [`TIME_PUBLISH_THRESHOLD`].
    pub fn publish_time(&mut self, elapsed: f64, playback: &mut PlaybackState, now: Instant) -> bool {
        if let Some(last) = self.last_publish {
            if now.saturating_duration_since(last) < self.publish_interval {
                return false;
            }
        }
        self.last_publish = Some(now);

        if (elapsed - playback.current_time).abs() > TIME_PUBLISH_THRESHOLD {
            playback.current_time = elapsed;
            return true;
        }
        false
    }
}
