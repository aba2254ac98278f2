//! Live capture from an input (or loopback) device.
//!
//! A parallel producer to file playback: same analyser, same frame sampler
//! steps, but no transport clock and no playback state.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use log::{info, trace, warn};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::analyser::{Analyser, SampleTap};
use super::sampler::FrameSampler;
use super::source::FrameSource;
use super::{FrameBuffer, FrequencyBands};
use crate::config::SensitivitySettings;
use crate::error::{Result, VisualizerError};

/// Band data in the shape desktop capture bridges hand out: the six named
/// bands plus the normalized spectrum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandsSnapshot {
    pub bands: Vec<f32>,
    pub sub_bass: f32,
    pub bass: f32,
    pub low_mid: f32,
    pub mid: f32,
    pub high_mid: f32,
    pub treble: f32,
    /// Milliseconds since capture started.
    pub timestamp: f64,
}

impl BandsSnapshot {
    pub fn frequency_bands(&self) -> FrequencyBands {
        FrequencyBands {
            sub_bass: self.sub_bass,
            bass: self.bass,
            low_mid: self.low_mid,
            mid: self.mid,
            high_mid: self.high_mid,
            treble: self.treble,
        }
    }
}

/// Converts normalized band floats to spectrum bytes.
pub fn bytes_from_bands(bands: &[f32]) -> Vec<u8> {
    bands
        .iter()
        .map(|&v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
        .collect()
}

pub struct SystemCapture {
    #[allow(dead_code)]
    stream: Stream,
    device_name: String,
    started: Instant,
    analyser: Analyser,
    sampler: FrameSampler,
    sensitivity: SensitivitySettings,
}

impl SystemCapture {
    /// Opens `device` (or the default input) and starts capturing.
    pub fn open(device: Option<&str>, sensitivity: SensitivitySettings) -> Result<Self> {
        let sensitivity = sensitivity.sanitize();
        let host = cpal::default_host();
        let device = Self::find_device(&host, device)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .default_input_config()
            .map_err(|e| VisualizerError::EngineUnavailable(format!("input config: {}", e)))?;

        info!("Using capture device: {}", device_name);
        info!("Capture config: {:?}", supported);

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let analyser = Analyser::new(sensitivity.fft_size, sensitivity.smoothing)?;

        let tap = analyser.tap();
        let stream = match sample_format {
            SampleFormat::F32 => Self::create_input_stream::<f32>(&device, &config, tap),
            SampleFormat::I16 => Self::create_input_stream::<i16>(&device, &config, tap),
            SampleFormat::U16 => Self::create_input_stream::<u16>(&device, &config, tap),
            other => Err(VisualizerError::EngineUnavailable(format!(
                "unsupported sample format {:?}",
                other
            ))),
        }?;
        stream
            .play()
            .map_err(|e| VisualizerError::EngineUnavailable(e.to_string()))?;

        let mut sampler = FrameSampler::default();
        sampler.start();

        Ok(Self {
            stream,
            device_name,
            started: Instant::now(),
            analyser,
            sampler,
            sensitivity,
        })
    }

    fn find_device(host: &cpal::Host, name: Option<&str>) -> Result<Device> {
        let Some(name) = name else {
            return host.default_input_device().ok_or_else(|| {
                VisualizerError::EngineUnavailable("no input device available".into())
            });
        };

        let mut devices = host
            .input_devices()
            .map_err(|e| VisualizerError::EngineUnavailable(e.to_string()))?;
        devices
            .find(|d| d.name().map_or(false, |n| n == name))
            .ok_or_else(|| VisualizerError::EngineUnavailable(format!("no input device named {}", name)))
    }

    fn create_input_stream<T>(device: &Device, config: &StreamConfig, tap: SampleTap) -> Result<Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = config.channels.max(1) as usize;
        info!(
            "Creating input stream with {} channels at {} Hz",
            channels, config.sample_rate.0
        );

        let mut mono: Vec<f32> = Vec::new();
        let stream = device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    mono.clear();
                    mono.extend(data.chunks(channels).map(|frame| {
                        frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / channels as f32
                    }));
                    if !tap.try_push(&mono) {
                        trace!("Analyser busy, dropped {} captured frames", mono.len());
                    }
                },
                |err| {
                    warn!("Capture stream error: {}", err);
                },
                None,
            )
            .map_err(|e| VisualizerError::EngineUnavailable(e.to_string()))?;

        Ok(stream)
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn set_sensitivity(&mut self, settings: SensitivitySettings) {
        let settings = settings.sanitize_with_fft_fallback(self.analyser.fft_size());
        self.analyser.set_smoothing(settings.smoothing);
        if let Err(e) = self.analyser.set_fft_size(settings.fft_size) {
            warn!("Keeping fft size {}: {}", self.analyser.fft_size(), e);
            return;
        }
        self.sensitivity = settings;
    }

    /// Current frame in bridge shape.
    pub fn bands_snapshot(&self) -> BandsSnapshot {
        snapshot_from_frame(self.sampler.frame(), self.started.elapsed().as_secs_f64() * 1000.0)
    }
}

fn snapshot_from_frame(frame: &FrameBuffer, timestamp: f64) -> BandsSnapshot {
    let bands = frame.frequency_bands();
    BandsSnapshot {
        bands: frame
            .frequency_data()
            .map(|data| data.iter().map(|&v| v as f32 / 255.0).collect())
            .unwrap_or_default(),
        sub_bass: bands.sub_bass,
        bass: bands.bass,
        low_mid: bands.low_mid,
        mid: bands.mid,
        high_mid: bands.high_mid,
        treble: bands.treble,
        timestamp,
    }
}

impl FrameSource for SystemCapture {
    fn tick_at(&mut self, now: Instant) {
        self.sampler
            .sample(&mut self.analyser, &self.sensitivity, now);
    }

    fn frame(&self) -> &FrameBuffer {
        self.sampler.frame()
    }

    fn beat_at(&self, now: Instant) -> bool {
        self.sampler.beat_at(now)
    }

    fn source_type(&self) -> &'static str {
        "system"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_from_bands_rounds_and_clamps() {
        assert_eq!(
            bytes_from_bands(&[0.0, 0.5, 1.0, 1.4, -0.2, 0.002]),
            vec![0, 128, 255, 255, 0, 1]
        );
        assert!(bytes_from_bands(&[]).is_empty());
    }

    #[test]
    fn test_snapshot_of_empty_frame_is_zeroed() {
        let snapshot = snapshot_from_frame(&FrameBuffer::new(), 12.0);
        assert!(snapshot.bands.is_empty());
        assert_eq!(snapshot.frequency_bands(), FrequencyBands::default());
        assert_eq!(snapshot.timestamp, 12.0);
    }

    #[test]
    fn test_snapshot_round_trips_through_bytes() {
        let mut sampler = FrameSampler::default();
        let mut analyser = Analyser::new(256, 0.0).unwrap();
        let tone: Vec<f32> = (0..256).map(|i| 0.5 * (i as f32 * 0.2).sin()).collect();
        analyser.tap().push(&tone);
        sampler.sample(&mut analyser, &SensitivitySettings::default(), Instant::now());

        let snapshot = snapshot_from_frame(sampler.frame(), 0.0);
        assert_eq!(snapshot.bands.len(), 128);
        assert_eq!(
            bytes_from_bands(&snapshot.bands),
            sampler.frame().frequency_data().unwrap()
        );
        assert_eq!(snapshot.frequency_bands(), *sampler.frame().frequency_bands());
    }

    #[test]
    fn test_snapshot_uses_bridge_field_names() {
        let json = serde_json::to_value(BandsSnapshot::default()).unwrap();
        for key in ["bands", "sub_bass", "low_mid", "high_mid", "timestamp"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }
}
