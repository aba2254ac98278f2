//! Runtime configuration.
//!
//! Sensitivity settings are owned by the settings layer and read (never
//! written) by the analysis pipeline. `AppConfig` wraps them together with the
//! session options the binary needs and is stored as JSON.

use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, VisualizerError};

pub const DEFAULT_FFT_SIZE: usize = 2048;
pub const MIN_FFT_SIZE: usize = 32;
pub const MAX_FFT_SIZE: usize = 32768;
pub const MAX_SMOOTHING: f32 = 0.95;

/// Returns true for a power of two in the range the analyser accepts.
pub fn is_valid_fft_size(size: usize) -> bool {
    size.is_power_of_two() && (MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyRange {
    #[default]
    Full,
    Bass,
    Treble,
}

/// Gain, smoothing and FFT parameters consumed by the band extractor and the
/// analyser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SensitivitySettings {
    pub bass_boost: f32,
    pub treble_boost: f32,
    pub overall: f32,
    /// Analyser smoothing time constant, 0.0 - 0.95
    pub smoothing: f32,
    pub fft_size: usize,
    pub frequency_range: FrequencyRange,
}

impl Default for SensitivitySettings {
    fn default() -> Self {
        Self {
            bass_boost: 1.0,
            treble_boost: 1.0,
            overall: 1.0,
            smoothing: 0.8,
            fft_size: DEFAULT_FFT_SIZE,
            frequency_range: FrequencyRange::Full,
        }
    }
}

fn clamp_or(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

impl SensitivitySettings {
    /// Brings user-supplied values back into their supported ranges.
    pub fn sanitize(mut self) -> Self {
        let defaults = Self::default();
        self.overall = clamp_or(self.overall, 0.1, 3.0, defaults.overall);
        self.smoothing = clamp_or(self.smoothing, 0.0, MAX_SMOOTHING, defaults.smoothing);
        self.bass_boost = clamp_or(self.bass_boost, 0.0, 3.0, defaults.bass_boost);
        self.treble_boost = clamp_or(self.treble_boost, 0.0, 3.0, defaults.treble_boost);
        if !is_valid_fft_size(self.fft_size) {
            warn!(
                "Ignoring invalid FFT size {}, using {}",
                self.fft_size, DEFAULT_FFT_SIZE
            );
            self.fft_size = DEFAULT_FFT_SIZE;
        }
        self
    }

    /// Like [`sanitize`](Self::sanitize), but an invalid FFT size falls back
    /// to `current` (the size already in use) instead of the default.
    pub fn sanitize_with_fft_fallback(mut self, current: usize) -> Self {
        if !is_valid_fft_size(self.fft_size) && is_valid_fft_size(current) {
            warn!(
                "Ignoring invalid FFT size {}, keeping {}",
                self.fft_size, current
            );
            self.fft_size = current;
        }
        self.sanitize()
    }

    /// Number of analyser bins for the configured FFT size.
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }
}

/// Which producer feeds the frame buffer for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    File,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub source: SourceKind,
    pub sensitivity: SensitivitySettings,
    /// Output gain, 0.0 - 1.0
    pub volume: f32,
    /// Animation frames per second driving the sampler
    pub frame_rate: u32,
    /// Upper bound on playback-time publications per second
    pub time_publish_hz: u32,
    /// Capture device name for system mode (default input device if unset)
    pub device: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::File,
            sensitivity: SensitivitySettings::default(),
            volume: 0.8,
            frame_rate: 60,
            time_publish_hz: 4,
            device: None,
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| VisualizerError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        let config: AppConfig = serde_json::from_str(text)?;
        Ok(config.sanitize())
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn sanitize(mut self) -> Self {
        self.sensitivity = self.sensitivity.sanitize();
        self.volume = clamp_or(self.volume, 0.0, 1.0, 0.8);
        self.frame_rate = self.frame_rate.clamp(1, 240);
        self.time_publish_hz = self.time_publish_hz.clamp(1, 60);
        self
    }
}
