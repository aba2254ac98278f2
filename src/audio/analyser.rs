//! Spectrum/waveform analysis node.
//!
//! Playback (or capture) pushes mono samples into a [`SampleTap`]; the frame
//! loop asks the [`Analyser`] to turn the most recent FFT window into byte
//! spectra. Byte scaling follows the usual analyser-node conventions: spectrum
//! values map -100 dB..-30 dB onto 0..255, waveform values map -1..1 onto 0..255.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::config::{is_valid_fft_size, MAX_FFT_SIZE};
use crate::error::{Result, VisualizerError};

pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;

/// Shared ring of the most recent mono samples, written by the audio thread.
#[derive(Clone)]
pub struct SampleTap {
    ring: Arc<Mutex<VecDeque<f32>>>,
    capacity: usize,
}

impl Default for SampleTap {
    fn default() -> Self {
        Self::new(MAX_FFT_SIZE)
    }
}

impl SampleTap {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Appends samples without blocking. Returns false if the reader holds the
    /// lock, in which case the caller should retry with the same batch.
    pub fn try_push(&self, samples: &[f32]) -> bool {
        match self.ring.try_lock() {
            Ok(mut ring) => {
                Self::append(&mut ring, samples, self.capacity);
                true
            }
            Err(_) => false,
        }
    }

    pub fn push(&self, samples: &[f32]) {
        let mut ring = match self.ring.lock() {
            Ok(ring) => ring,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::append(&mut ring, samples, self.capacity);
    }

    pub fn clear(&self) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.ring.lock().map_or(0, |ring| ring.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(ring: &mut VecDeque<f32>, samples: &[f32], capacity: usize) {
        let samples = &samples[samples.len().saturating_sub(capacity)..];
        let overflow = (ring.len() + samples.len()).saturating_sub(capacity);
        ring.drain(..overflow.min(ring.len()));
        ring.extend(samples.iter().copied());
    }

    /// Copies the newest `out.len()` samples into `out`, zero-filling the front
    /// when fewer are available. Returns false if the ring was busy.
    fn copy_latest(&self, out: &mut [f32]) -> bool {
        let ring = match self.ring.try_lock() {
            Ok(ring) => ring,
            Err(_) => return false,
        };
        let available = ring.len().min(out.len());
        let pad = out.len() - available;
        out[..pad].fill(0.0);
        for (dst, src) in out[pad..].iter_mut().zip(ring.range(ring.len() - available..)) {
            *dst = *src;
        }
        true
    }
}

pub struct Analyser {
    fft_size: usize,
    smoothing: f32,
    tap: SampleTap,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    samples: Vec<f32>,
    fft_buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
}

impl Analyser {
    pub fn new(fft_size: usize, smoothing: f32) -> Result<Self> {
        if !is_valid_fft_size(fft_size) {
            return Err(VisualizerError::InvalidFftSize(fft_size));
        }
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch_len = fft.get_inplace_scratch_len();

        Ok(Self {
            fft_size,
            smoothing: smoothing.clamp(0.0, 1.0),
            tap: SampleTap::default(),
            fft,
            window: Self::blackman_window(fft_size),
            samples: vec![0.0; fft_size],
            fft_buffer: vec![Complex::new(0.0, 0.0); fft_size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            smoothed: vec![0.0; fft_size / 2],
        })
    }

    fn blackman_window(size: usize) -> Vec<f32> {
        const ALPHA: f32 = 0.16;
        let a0 = 0.5 * (1.0 - ALPHA);
        let a1 = 0.5;
        let a2 = 0.5 * ALPHA;
        (0..size)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / size as f32;
                a0 - a1 * phase.cos() + a2 * (2.0 * phase).cos()
            })
            .collect()
    }

    /// Handle the audio side writes into.
    pub fn tap(&self) -> SampleTap {
        self.tap.clone()
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn smoothing(&self) -> f32 {
        self.smoothing
    }

    pub fn set_smoothing(&mut self, smoothing: f32) {
        self.smoothing = smoothing.clamp(0.0, 1.0);
    }

    /// Re-plans the transform. Smoothing history does not carry over.
    pub fn set_fft_size(&mut self, fft_size: usize) -> Result<()> {
        if !is_valid_fft_size(fft_size) {
            return Err(VisualizerError::InvalidFftSize(fft_size));
        }
        if fft_size == self.fft_size {
            return Ok(());
        }

        let mut planner = FftPlanner::new();
        self.fft = planner.plan_fft_forward(fft_size);
        self.fft_size = fft_size;
        self.window = Self::blackman_window(fft_size);
        self.samples = vec![0.0; fft_size];
        self.fft_buffer = vec![Complex::new(0.0, 0.0); fft_size];
        self.scratch = vec![Complex::new(0.0, 0.0); self.fft.get_inplace_scratch_len()];
        self.smoothed = vec![0.0; fft_size / 2];
        Ok(())
    }

    /// Forgets buffered samples and smoothing state.
    pub fn reset(&mut self) {
        self.tap.clear();
        self.samples.fill(0.0);
        self.smoothed.fill(0.0);
    }

    /// Snapshots the latest window from the tap. Returns false when the tap was
    /// busy; the previous snapshot is kept in that case.
    pub fn capture(&mut self) -> bool {
        self.tap.copy_latest(&mut self.samples)
    }

    /// Writes smoothed spectrum bytes for the current snapshot into `out`, up
    /// to the bin count.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        for ((slot, &sample), &w) in self
            .fft_buffer
            .iter_mut()
            .zip(self.samples.iter())
            .zip(self.window.iter())
        {
            *slot = Complex::new(sample * w, 0.0);
        }

        self.fft
            .process_with_scratch(&mut self.fft_buffer, &mut self.scratch);

        let scale = 1.0 / self.fft_size as f32;
        let tau = self.smoothing;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(self.fft_buffer.iter()) {
            let magnitude = bin.norm() * scale;
            *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;
        }

        let range_scale = 255.0 / (MAX_DECIBELS - MIN_DECIBELS);
        for (byte, &magnitude) in out.iter_mut().zip(self.smoothed.iter()) {
            *byte = if magnitude > 0.0 {
                let db = 20.0 * magnitude.log10();
                ((db - MIN_DECIBELS) * range_scale).floor().clamp(0.0, 255.0) as u8
            } else {
                0
            };
        }
    }

    /// Writes waveform bytes for the current snapshot into `out`, up to
    /// `fft_size` of them.
    pub fn byte_time_domain_data(&self, out: &mut [u8]) {
        for (byte, &sample) in out.iter_mut().zip(self.samples.iter()) {
            *byte = (128.0 * (1.0 + sample)).clamp(0.0, 255.0) as u8;
        }
    }
}
