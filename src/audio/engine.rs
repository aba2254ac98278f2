//! Boundary to the platform audio subsystem.
//!
//! Transport only talks to an [`AudioEngine`]: a monotonic clock, a decoder,
//! voices bound to a decoded track, a gain stage and an analyser fed with the
//! post-gain signal. [`RodioEngine`] is the real implementation.

use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::analyser::{Analyser, SampleTap};
use super::decode::{self, AudioFile, DecodedTrack};
use crate::config::SensitivitySettings;
use crate::error::{Result, VisualizerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEvent {
    /// Sent once per voice, both when it runs out of samples and when it is stopped.
    Ended(VoiceId),
}

#[async_trait(?Send)]
pub trait AudioEngine {
    /// Engine clock in seconds. Monotonic, advances whether or not anything plays.
    fn current_time(&self) -> f64;

    async fn decode_audio_data(&self, file: &AudioFile) -> Result<DecodedTrack> {
        decode::decode_audio_data(file).await
    }

    /// Starts a new voice for `track` at `offset` seconds through the gain stage.
    fn start_voice(&mut self, track: Arc<DecodedTrack>, offset: f64) -> Result<VoiceId>;

    fn stop_voice(&mut self, voice: VoiceId);

    fn set_gain(&mut self, gain: f32);

    /// Next pending voice notification, if any. Never blocks.
    fn poll_event(&mut self) -> Option<VoiceEvent>;

    fn analyser(&self) -> &Analyser;

    fn analyser_mut(&mut self) -> &mut Analyser;

    fn engine_type(&self) -> &'static str;
}

/// Mono frames collected before each push into the analyser tap.
const TAP_BATCH: usize = 256;

/// Output through the default device via rodio, one `Sink` per voice.
pub struct RodioEngine {
    #[allow(dead_code)]
    stream: OutputStream,
    stream_handle: OutputStreamHandle,
    epoch: Instant,
    gain: Arc<AtomicU32>,
    analyser: Analyser,
    voices: Vec<(VoiceId, Sink)>,
    next_voice: u64,
    event_sender: Sender<VoiceEvent>,
    event_receiver: Receiver<VoiceEvent>,
}

impl RodioEngine {
    pub fn open(sensitivity: &SensitivitySettings) -> Result<Self> {
        let (stream, stream_handle) = OutputStream::try_default()
            .map_err(|e| VisualizerError::EngineUnavailable(e.to_string()))?;
        let analyser = Analyser::new(sensitivity.fft_size, sensitivity.smoothing)?;
        let (event_sender, event_receiver) = crossbeam_channel::unbounded();

        info!(
            "Opened audio output (fft size {}, smoothing {:.2})",
            sensitivity.fft_size, sensitivity.smoothing
        );

        Ok(Self {
            stream,
            stream_handle,
            epoch: Instant::now(),
            gain: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            analyser,
            voices: Vec::new(),
            next_voice: 1,
            event_sender,
            event_receiver,
        })
    }

    fn forget_voice(&mut self, voice: VoiceId) -> Option<Sink> {
        let index = self.voices.iter().position(|(id, _)| *id == voice)?;
        Some(self.voices.swap_remove(index).1)
    }
}

#[async_trait(?Send)]
impl AudioEngine for RodioEngine {
    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn start_voice(&mut self, track: Arc<DecodedTrack>, offset: f64) -> Result<VoiceId> {
        let sink = Sink::try_new(&self.stream_handle)
            .map_err(|e| VisualizerError::EngineUnavailable(e.to_string()))?;

        let id = VoiceId(self.next_voice);
        self.next_voice += 1;

        let voice = TrackVoice::new(
            id,
            track,
            offset,
            Arc::clone(&self.gain),
            self.analyser.tap(),
            self.event_sender.clone(),
        );
        sink.append(voice);
        sink.play();

        debug!("Voice {} started at {:.2}s", id.0, offset);
        self.voices.push((id, sink));
        Ok(id)
    }

    fn stop_voice(&mut self, voice: VoiceId) {
        if let Some(sink) = self.forget_voice(voice) {
            sink.stop();
            debug!("Voice {} stopped", voice.0);
            // a stopped voice reports completion just like an exhausted one
            let _ = self.event_sender.send(VoiceEvent::Ended(voice));
        }
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn poll_event(&mut self) -> Option<VoiceEvent> {
        let event = self.event_receiver.try_recv().ok()?;
        let VoiceEvent::Ended(voice) = event;
        self.forget_voice(voice);
        Some(event)
    }

    fn analyser(&self) -> &Analyser {
        &self.analyser
    }

    fn analyser_mut(&mut self) -> &mut Analyser {
        &mut self.analyser
    }

    fn engine_type(&self) -> &'static str {
        "rodio"
    }
}

/// Rodio source over a shared decoded track.
///
/// Applies the gain stage, feeds a mono down-mix of what it plays into the
/// analyser tap and reports `Ended` once it runs dry.
struct TrackVoice {
    id: VoiceId,
    track: Arc<DecodedTrack>,
    position: usize,
    gain: Arc<AtomicU32>,
    current_gain: f32,
    tap: SampleTap,
    pending: Vec<f32>,
    frame_sum: f32,
    frame_fill: u16,
    events: Sender<VoiceEvent>,
    ended: bool,
}

impl TrackVoice {
    fn new(
        id: VoiceId,
        track: Arc<DecodedTrack>,
        offset: f64,
        gain: Arc<AtomicU32>,
        tap: SampleTap,
        events: Sender<VoiceEvent>,
    ) -> Self {
        let position = track.sample_index_at(offset);
        Self {
            id,
            track,
            position,
            gain,
            current_gain: 1.0,
            tap,
            pending: Vec::with_capacity(TAP_BATCH * 2),
            frame_sum: 0.0,
            frame_fill: 0,
            events,
            ended: false,
        }
    }

    fn tap_sample(&mut self, sample: f32) {
        let channels = self.track.channels.max(1);
        self.frame_sum += sample;
        self.frame_fill += 1;
        if self.frame_fill < channels {
            return;
        }

        self.pending.push(self.frame_sum / channels as f32);
        self.frame_sum = 0.0;
        self.frame_fill = 0;

        if self.pending.len() >= TAP_BATCH {
            if self.tap.try_push(&self.pending) {
                self.pending.clear();
            } else if self.pending.len() >= TAP_BATCH * 8 {
                // reader has been holding the ring for a long time; drop the oldest
                self.pending.drain(..TAP_BATCH);
            }
        }
    }

    fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if !self.pending.is_empty() {
            self.tap.push(&self.pending);
            self.pending.clear();
        }
        let _ = self.events.send(VoiceEvent::Ended(self.id));
    }
}

impl Iterator for TrackVoice {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let Some(&raw) = self.track.samples.get(self.position) else {
            self.finish();
            return None;
        };

        // gain changes land on frame boundaries
        if self.frame_fill == 0 {
            self.current_gain = f32::from_bits(self.gain.load(Ordering::Relaxed));
        }

        let sample = raw * self.current_gain;
        self.position += 1;
        self.tap_sample(sample);
        Some(sample)
    }
}

impl Source for TrackVoice {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.track.channels.max(1)
    }

    fn sample_rate(&self) -> u32 {
        self.track.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        Some(Duration::from_secs_f64(self.track.duration()))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory engine with a hand-driven clock.

    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    pub struct ManualClock(Rc<Cell<f64>>);

    impl ManualClock {
        pub fn now(&self) -> f64 {
            self.0.get()
        }

        pub fn advance(&self, seconds: f64) {
            self.0.set(self.0.get() + seconds);
        }
    }

    pub struct FakeEngine {
        pub clock: ManualClock,
        pub gain: f32,
        pub active: Vec<(VoiceId, f64)>,
        pub started: Vec<(VoiceId, f64)>,
        events: VecDeque<VoiceEvent>,
        analyser: Analyser,
        next_voice: u64,
    }

    impl FakeEngine {
        pub fn new(clock: ManualClock, sensitivity: &SensitivitySettings) -> Self {
            Self {
                clock,
                gain: 1.0,
                active: Vec::new(),
                started: Vec::new(),
                events: VecDeque::new(),
                analyser: Analyser::new(sensitivity.fft_size, sensitivity.smoothing)
                    .unwrap(),
                next_voice: 1,
            }
        }

        /// Runs every active voice out of samples.
        pub fn exhaust_voices(&mut self) {
            for (id, _) in self.active.drain(..) {
                self.events.push_back(VoiceEvent::Ended(id));
            }
        }
    }

    #[async_trait(?Send)]
    impl AudioEngine for FakeEngine {
        fn current_time(&self) -> f64 {
            self.clock.now()
        }

        fn start_voice(&mut self, track: Arc<DecodedTrack>, offset: f64) -> Result<VoiceId> {
            let id = VoiceId(self.next_voice);
            self.next_voice += 1;

            // prime the analyser with the audio right at the offset
            let start = track.sample_index_at(offset);
            let channels = track.channels.max(1) as usize;
            let mono: Vec<f32> = track.samples[start..]
                .chunks(channels)
                .take(self.analyser.fft_size())
                .map(|frame| frame.iter().sum::<f32>() / channels as f32 * self.gain)
                .collect();
            self.analyser.tap().push(&mono);

            self.active.push((id, offset));
            self.started.push((id, offset));
            Ok(id)
        }

        fn stop_voice(&mut self, voice: VoiceId) {
            if let Some(index) = self.active.iter().position(|(id, _)| *id == voice) {
                self.active.remove(index);
                self.events.push_back(VoiceEvent::Ended(voice));
            }
        }

        fn set_gain(&mut self, gain: f32) {
            self.gain = gain;
        }

        fn poll_event(&mut self) -> Option<VoiceEvent> {
            self.events.pop_front()
        }

        fn analyser(&self) -> &Analyser {
            &self.analyser
        }

        fn analyser_mut(&mut self) -> &mut Analyser {
            &mut self.analyser
        }

        fn engine_type(&self) -> &'static str {
            "fake"
        }
    }

    /// Mono 16-bit WAV of a 220 Hz tone.
    pub fn tone_wav(seconds: f64, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let frames = (seconds * sample_rate as f64) as usize;
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames {
                let t = i as f32 / sample_rate as f32;
                let v = (2.0 * std::f32::consts::PI * 220.0 * t).sin() * 12000.0;
                writer.write_sample(v as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }
}
