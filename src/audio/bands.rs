use super::FrequencyBands;
use crate::config::SensitivitySettings;

/// Bin mapping always assumes this rate, whatever the track was decoded at.
pub const ANALYSIS_SAMPLE_RATE: f32 = 44100.0;

/// Band edges in Hz: sub-bass, bass, low-mid, mid, high-mid, treble.
pub const BAND_EDGES: [f32; 7] = [20.0, 60.0, 250.0, 500.0, 2000.0, 4000.0, 20000.0];

pub fn freq_to_bin(freq: f32, fft_size: usize) -> usize {
    (freq * fft_size as f32 / ANALYSIS_SAMPLE_RATE).round() as usize
}

/// Mean of `data[start..end]` scaled to 0.0-1.0; empty or out-of-range spans give 0.
fn average_range(data: &[u8], start: usize, end: usize) -> f32 {
    if start >= end || start >= data.len() {
        return 0.0;
    }

    let end = end.min(data.len());
    let sum: u32 = data[start..end].iter().map(|&v| v as u32).sum();
    sum as f32 / (end - start) as f32 / 255.0
}

/// Aggregates a byte spectrum into the six perceptual bands and applies the
/// sensitivity gains. Every band saturates at 1.0.
pub fn extract_frequency_bands(
    spectrum: &[u8],
    fft_size: usize,
    sensitivity: &SensitivitySettings,
) -> FrequencyBands {
    let mut edges = [0usize; 7];
    for (bin, &freq) in edges.iter_mut().zip(BAND_EDGES.iter()) {
        *bin = freq_to_bin(freq, fft_size);
    }
    let band = |i: usize| average_range(spectrum, edges[i], edges[i + 1]);

    let overall = sensitivity.overall;
    let bass_gain = sensitivity.bass_boost * overall;
    let treble_gain = sensitivity.treble_boost * overall;

    FrequencyBands {
        sub_bass: (band(0) * bass_gain).min(1.0),
        bass: (band(1) * bass_gain).min(1.0),
        low_mid: (band(2) * overall).min(1.0),
        mid: (band(3) * overall).min(1.0),
        high_mid: (band(4) * treble_gain).min(1.0),
        treble: (band(5) * treble_gain).min(1.0),
    }
}
