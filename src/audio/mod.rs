pub mod analyser;
pub mod bands;
pub mod beat_detector;
pub mod decode;
pub mod engine;
pub mod sampler;
pub mod source;
pub mod system_capture;
pub mod transport;

pub use analyser::{Analyser, SampleTap};
pub use bands::extract_frequency_bands;
pub use beat_detector::BeatDetector;
pub use decode::{AudioFile, DecodedTrack};
pub use engine::{AudioEngine, RodioEngine, VoiceEvent, VoiceId};
pub use sampler::FrameSampler;
pub use source::FrameSource;
pub use system_capture::SystemCapture;
pub use transport::Transport;

use serde::{Deserialize, Serialize};

/// Six perceptual band energies, each in 0.0-1.0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyBands {
    pub sub_bass: f32,
    pub bass: f32,
    pub low_mid: f32,
    pub mid: f32,
    pub high_mid: f32,
    pub treble: f32,
}

impl FrequencyBands {
    pub fn as_array(&self) -> [f32; 6] {
        [
            self.sub_bass,
            self.bass,
            self.low_mid,
            self.mid,
            self.high_mid,
            self.treble,
        ]
    }
}

/// The per-frame data renderers read.
///
/// Written in place by the frame sampler and read by renderers once per
/// rendered frame. The byte buffers are reused across frames: copy them before
/// holding on to their contents past the current frame.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    frequency_data: Option<Vec<u8>>,
    time_domain_data: Option<Vec<u8>>,
    frequency_bands: FrequencyBands,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spectrum magnitudes (0-255 per bin), absent until the first sampled frame.
    pub fn frequency_data(&self) -> Option<&[u8]> {
        self.frequency_data.as_deref()
    }

    /// Waveform samples (128 = silence), same length as the spectrum.
    pub fn time_domain_data(&self) -> Option<&[u8]> {
        self.time_domain_data.as_deref()
    }

    pub fn frequency_bands(&self) -> &FrequencyBands {
        &self.frequency_bands
    }

    pub fn bin_count(&self) -> usize {
        self.frequency_data.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.frequency_data.is_none()
    }

    /// Drops both byte buffers and zeroes the bands.
    pub fn clear(&mut self) {
        self.frequency_data = None;
        self.time_domain_data = None;
        self.frequency_bands = FrequencyBands::default();
    }

    /// Makes sure both byte buffers exist with exactly `bins` entries.
    ///
    /// Returns true when the buffers had to be (re)allocated.
    pub(crate) fn ensure_bins(&mut self, bins: usize) -> bool {
        if self.bin_count() == bins && self.time_domain_data.is_some() {
            return false;
        }
        self.frequency_data = Some(vec![0; bins]);
        self.time_domain_data = Some(vec![128; bins]);
        true
    }

    pub(crate) fn buffers_mut(&mut self) -> Option<(&mut [u8], &mut [u8])> {
        match (&mut self.frequency_data, &mut self.time_domain_data) {
            (Some(freq), Some(time)) => Some((freq.as_mut_slice(), time.as_mut_slice())),
            _ => None,
        }
    }

    pub(crate) fn set_frequency_bands(&mut self, bands: FrequencyBands) {
        self.frequency_bands = bands;
    }
}

/// Low-rate, UI-facing playback state.
///
/// `current_time` is only refreshed a few times per second while playing;
/// per-frame data goes through `FrameBuffer` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub is_playing: bool,
    pub current_time: f64,
    pub duration: f64,
    pub volume: f32,
    pub file_name: Option<String>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_playing: false,
            current_time: 0.0,
            duration: 0.0,
            volume: 0.8,
            file_name: None,
        }
    }
}
