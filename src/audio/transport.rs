use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;

use super::decode::{AudioFile, DecodedTrack};
use super::engine::{AudioEngine, RodioEngine, VoiceEvent, VoiceId};
use super::sampler::FrameSampler;
use super::{FrameBuffer, PlaybackState};
use crate::config::{AppConfig, SensitivitySettings};
use crate::error::{Result, VisualizerError};

/// A completion this close to the end of the track counts as the track finishing.
pub const END_OF_TRACK_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
enum TransportState {
    Empty,
    Paused { offset: f64 },
    /// `start_ref` is the engine time at which position 0 would have played.
    /// `exhausted` is set once the voice has run dry ahead of the clock.
    Playing {
        start_ref: f64,
        voice: VoiceId,
        exhausted: bool,
    },
}

type EngineFactory<E> = Box<dyn FnMut(&SensitivitySettings) -> Result<E>>;

/// File playback: owns the engine, the decoded track and the frame sampler.
///
/// Position is never accumulated; while playing it is derived from the
/// engine clock and the start reference recorded by [`play`](Self::play).
pub struct Transport<E: AudioEngine> {
    factory: EngineFactory<E>,
    engine: Option<E>,
    track: Option<Arc<DecodedTrack>>,
    state: TransportState,
    playback: PlaybackState,
    sampler: FrameSampler,
    sensitivity: SensitivitySettings,
}

impl Transport<RodioEngine> {
    /// Transport on the default output device. The device is opened on first load.
    pub fn with_default_output(config: &AppConfig) -> Self {
        Self::new(RodioEngine::open, config)
    }
}

impl<E: AudioEngine> Transport<E> {
    pub fn new(
        factory: impl FnMut(&SensitivitySettings) -> Result<E> + 'static,
        config: &AppConfig,
    ) -> Self {
        let sensitivity = config.sensitivity.clone().sanitize();

        Self {
            factory: Box::new(factory),
            engine: None,
            track: None,
            state: TransportState::Empty,
            playback: PlaybackState {
                volume: config.volume.clamp(0.0, 1.0),
                ..Default::default()
            },
            sampler: FrameSampler::new(config.time_publish_hz),
            sensitivity,
        }
    }

    fn ensure_engine(&mut self) -> Result<&mut E> {
        if self.engine.is_none() {
            let mut engine = (self.factory)(&self.sensitivity)?;
            engine.set_gain(self.playback.volume);
            info!("Audio engine ready ({})", engine.engine_type());
            self.engine = Some(engine);
        }
        self.engine
            .as_mut()
            .ok_or_else(|| VisualizerError::EngineUnavailable("no audio engine".into()))
    }

    /// Decodes `file` and makes it the current track, paused at 0.
    ///
    /// Nothing changes if decoding fails.
    pub async fn load_file(&mut self, file: &AudioFile) -> Result<()> {
        let decoded = self.ensure_engine()?.decode_audio_data(file).await?;

        self.stop_current_voice();
        self.sampler.cancel();
        self.sampler.reset_beats();
        self.sampler.clear_frame();
        if let Some(engine) = self.engine.as_mut() {
            engine.analyser_mut().reset();
        }

        self.playback.duration = decoded.duration();
        self.playback.current_time = 0.0;
        self.playback.is_playing = false;
        self.playback.file_name = Some(file.name.clone());
        self.track = Some(Arc::new(decoded));
        self.state = TransportState::Paused { offset: 0.0 };

        info!("Loaded {} ({:.1}s)", file.name, self.playback.duration);
        Ok(())
    }

    /// Starts (or restarts) playback at the paused offset. No-op without a track.
    pub fn play(&mut self) -> Result<()> {
        let offset = match self.state {
            TransportState::Empty => return Ok(()),
            TransportState::Paused { offset } => offset,
            TransportState::Playing { .. } => self.position(),
        };
        let Some(track) = self.track.clone() else {
            return Ok(());
        };

        self.stop_current_voice();
        self.state = TransportState::Paused { offset };

        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| VisualizerError::EngineUnavailable("no audio engine".into()))?;

        let voice = match engine.start_voice(track, offset) {
            Ok(voice) => voice,
            Err(e) => {
                self.sampler.cancel();
                self.playback.is_playing = false;
                return Err(e);
            }
        };

        self.state = TransportState::Playing {
            start_ref: engine.current_time() - offset,
            voice,
            exhausted: false,
        };
        self.playback.is_playing = true;
        self.playback.current_time = offset;
        self.sampler.start();

        info!("Playing from {:.2}s", offset);
        Ok(())
    }

    /// Stops at the current position. Pausing while paused does nothing.
    pub fn pause(&mut self) {
        let TransportState::Playing { voice, .. } = self.state else {
            return;
        };

        let offset = self.position();
        if let Some(engine) = self.engine.as_mut() {
            engine.stop_voice(voice);
        }
        self.state = TransportState::Paused { offset };
        self.sampler.cancel();
        self.playback.is_playing = false;
        self.playback.current_time = offset;

        info!("Paused at {:.2}s", offset);
    }

    pub fn toggle_play(&mut self) -> Result<()> {
        if self.playback.is_playing {
            self.pause();
            Ok(())
        } else {
            self.play()
        }
    }

    /// Moves to `time` seconds, clamped to the track. Keeps playing if it was.
    pub fn seek(&mut self, time: f64) -> Result<()> {
        if self.state == TransportState::Empty {
            return Ok(());
        }

        let target = if time.is_finite() {
            time.clamp(0.0, self.playback.duration)
        } else {
            0.0
        };
        let was_playing = matches!(self.state, TransportState::Playing { .. });

        self.stop_current_voice();
        self.sampler.cancel();
        self.state = TransportState::Paused { offset: target };
        self.playback.current_time = target;
        debug!("Seek to {:.2}s", target);

        if was_playing {
            self.play()
        } else {
            Ok(())
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        let volume = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            self.playback.volume
        };
        self.playback.volume = volume;
        if let Some(engine) = self.engine.as_mut() {
            engine.set_gain(volume);
        }
    }

    /// Applies new sensitivity settings; FFT size and smoothing go to the analyser.
    pub fn set_sensitivity(&mut self, settings: SensitivitySettings) {
        let current = self
            .engine
            .as_ref()
            .map_or(self.sensitivity.fft_size, |e| e.analyser().fft_size());
        let mut settings = settings.sanitize_with_fft_fallback(current);

        if let Some(engine) = self.engine.as_mut() {
            let analyser = engine.analyser_mut();
            analyser.set_smoothing(settings.smoothing);
            if let Err(e) = analyser.set_fft_size(settings.fft_size) {
                warn!("Keeping fft size {}: {}", analyser.fft_size(), e);
                settings.fft_size = analyser.fft_size();
            }
        }
        self.sensitivity = settings;
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// One animation frame: handles voice notifications, then samples if playing.
    pub fn tick_at(&mut self, now: Instant) {
        self.drain_events();

        if !self.sampler.is_active() {
            return;
        }
        let TransportState::Playing {
            start_ref,
            exhausted,
            ..
        } = self.state
        else {
            return;
        };
        if exhausted && self.reached_end() {
            self.finish_track();
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        self.sampler
            .sample(engine.analyser_mut(), &self.sensitivity, now);

        let elapsed = (engine.current_time() - start_ref).clamp(0.0, self.playback.duration);
        self.sampler
            .publish_time(elapsed, &mut self.playback, now);
    }

    fn drain_events(&mut self) {
        loop {
            let event = match self.engine.as_mut() {
                Some(engine) => engine.poll_event(),
                None => return,
            };
            match event {
                Some(VoiceEvent::Ended(voice)) => self.on_voice_ended(voice),
                None => return,
            }
        }
    }

    fn on_voice_ended(&mut self, ended: VoiceId) {
        let TransportState::Playing {
            voice,
            ref mut exhausted,
            ..
        } = self.state
        else {
            debug!("Ignoring end of voice {} while not playing", ended.0);
            return;
        };
        if voice != ended {
            debug!("Ignoring end of replaced voice {}", ended.0);
            return;
        }
        *exhausted = true;

        if !self.reached_end() {
            debug!(
                "Voice {} ran dry at {:.2}s, finishing when the clock catches up",
                ended.0,
                self.position()
            );
            return;
        }
        self.finish_track();
    }

    fn reached_end(&self) -> bool {
        self.position() >= self.playback.duration - END_OF_TRACK_EPSILON
    }

    fn finish_track(&mut self) {
        self.sampler.cancel();
        self.sampler.clear_frame();
        self.state = TransportState::Paused { offset: 0.0 };
        self.playback.is_playing = false;
        self.playback.current_time = 0.0;
        info!("Track finished");
    }

    fn stop_current_voice(&mut self) {
        if let TransportState::Playing { voice, .. } = self.state {
            if let Some(engine) = self.engine.as_mut() {
                engine.stop_voice(voice);
            }
        }
    }

    /// Exact position in seconds, read from the engine clock while playing.
    pub fn position(&self) -> f64 {
        match self.state {
            TransportState::Empty => 0.0,
            TransportState::Paused { offset } => offset,
            TransportState::Playing { start_ref, .. } => self.engine.as_ref().map_or(0.0, |e| {
                (e.current_time() - start_ref).clamp(0.0, self.playback.duration)
            }),
        }
    }

    pub fn frame(&self) -> &FrameBuffer {
        self.sampler.frame()
    }

    pub fn playback(&self) -> &PlaybackState {
        &self.playback
    }

    pub fn beat(&self) -> bool {
        self.beat_at(Instant::now())
    }

    pub fn beat_at(&self, now: Instant) -> bool {
        self.sampler.beat_at(now)
    }

    pub fn sensitivity(&self) -> &SensitivitySettings {
        &self.sensitivity
    }

    pub fn is_loaded(&self) -> bool {
        self.track.is_some()
    }

    pub fn engine(&self) -> Option<&E> {
        self.engine.as_ref()
    }

    #[cfg(test)]
    fn beat_history_len(&self) -> usize {
        self.sampler.beat_history_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::engine::fake::{tone_wav, FakeEngine, ManualClock};
    use std::time::Duration;

    fn transport(clock: &ManualClock) -> Transport<FakeEngine> {
        let clock = clock.clone();
        Transport::new(
            move |sensitivity: &SensitivitySettings| Ok(FakeEngine::new(clock.clone(), sensitivity)),
            &AppConfig::default(),
        )
    }

    async fn loaded(clock: &ManualClock, seconds: f64) -> Transport<FakeEngine> {
        let mut transport = transport(clock);
        let file = AudioFile::new("tone.wav", tone_wav(seconds, 8000));
        transport.load_file(&file).await.unwrap();
        transport
    }

    fn last_start_offset(transport: &Transport<FakeEngine>) -> f64 {
        transport.engine().unwrap().started.last().unwrap().1
    }

    #[tokio::test]
    async fn test_load_publishes_track_and_stays_paused() {
        let clock = ManualClock::default();
        let transport = loaded(&clock, 2.0).await;

        let playback = transport.playback();
        assert!(!playback.is_playing);
        assert_eq!(playback.current_time, 0.0);
        assert!((playback.duration - 2.0).abs() < 1e-6);
        assert_eq!(playback.file_name.as_deref(), Some("tone.wav"));
        assert!(transport.frame().is_empty());
    }

    #[tokio::test]
    async fn test_play_without_track_is_noop() {
        let clock = ManualClock::default();
        let mut transport = transport(&clock);
        transport.play().unwrap();
        assert!(!transport.playback().is_playing);
        assert!(transport.engine().is_none());
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_previous_state() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 2.0).await;
        transport.play().unwrap();
        clock.advance(0.5);

        let broken = AudioFile::new("broken.mp3", vec![0x13; 2048]);
        assert!(transport.load_file(&broken).await.is_err());

        assert!(transport.playback().is_playing);
        assert_eq!(transport.playback().file_name.as_deref(), Some("tone.wav"));
        assert!((transport.position() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_play_advances_from_zero() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 3.0).await;
        clock.advance(10.0);

        transport.play().unwrap();
        assert!(transport.playback().is_playing);
        assert_eq!(last_start_offset(&transport), 0.0);

        let t0 = Instant::now();
        clock.advance(1.0);
        transport.tick_at(t0);
        assert!((transport.playback().current_time - 1.0).abs() < 1e-9);
        assert!(!transport.frame().is_empty());
    }

    #[tokio::test]
    async fn test_seek_then_play_starts_at_offset() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 5.0).await;

        transport.seek(2.5).unwrap();
        assert_eq!(transport.playback().current_time, 2.5);
        assert!(!transport.playback().is_playing);

        transport.play().unwrap();
        assert_eq!(last_start_offset(&transport), 2.5);

        clock.advance(0.5);
        assert!((transport.position() - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_pause_then_play_resumes() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 5.0).await;

        transport.play().unwrap();
        clock.advance(1.25);
        transport.pause();
        assert_eq!(transport.playback().current_time, 1.25);

        clock.advance(3.0);
        transport.play().unwrap();
        assert_eq!(last_start_offset(&transport), 1.25);
        assert!((transport.position() - 1.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_pause_twice_is_same_as_once() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 5.0).await;
        transport.play().unwrap();
        clock.advance(1.0);

        transport.pause();
        let once = transport.playback().clone();
        let position = transport.position();

        clock.advance(1.0);
        transport.pause();
        transport.tick();

        assert_eq!(*transport.playback(), once);
        assert_eq!(transport.position(), position);
    }

    #[tokio::test]
    async fn test_seek_while_playing_restarts_and_ignores_old_voice() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 5.0).await;
        transport.play().unwrap();
        clock.advance(0.5);

        transport.seek(4.95).unwrap();
        assert!(transport.playback().is_playing);
        assert_eq!(last_start_offset(&transport), 4.95);

        // the replaced voice's completion arrives on the next tick
        transport.tick();
        assert!(transport.playback().is_playing);
        assert_eq!(transport.engine().unwrap().active.len(), 1);
    }

    #[tokio::test]
    async fn test_natural_end_resets_state() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 1.0).await;
        transport.play().unwrap();

        let t0 = Instant::now();
        clock.advance(0.5);
        transport.tick_at(t0);
        assert!(!transport.frame().is_empty());

        clock.advance(0.5);
        transport.engine.as_mut().unwrap().exhaust_voices();
        transport.tick_at(t0 + Duration::from_millis(500));

        let playback = transport.playback();
        assert!(!playback.is_playing);
        assert_eq!(playback.current_time, 0.0);
        assert!(transport.frame().is_empty());
        assert!(transport.frame().frequency_data().is_none());
        assert_eq!(transport.position(), 0.0);
    }

    #[tokio::test]
    async fn test_voice_running_dry_before_clock_finishes_on_later_tick() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 1.0).await;
        transport.play().unwrap();

        // voice exhausts 150 ms before the clock reaches the end
        clock.advance(0.75);
        transport.engine.as_mut().unwrap().exhaust_voices();
        transport.tick();
        assert!(transport.playback().is_playing);

        clock.advance(0.1);
        transport.tick();
        assert!(transport.playback().is_playing);

        clock.advance(0.1);
        transport.tick();
        let playback = transport.playback();
        assert!(!playback.is_playing);
        assert_eq!(playback.current_time, 0.0);
        assert!(transport.frame().is_empty());
        assert_eq!(transport.position(), 0.0);
    }

    #[tokio::test]
    async fn test_restart_clears_exhausted_voice() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 2.0).await;
        transport.play().unwrap();
        clock.advance(0.5);
        transport.engine.as_mut().unwrap().exhaust_voices();
        transport.tick();

        // the new voice starts fresh, so passing the end window alone does not finish
        transport.seek(0.2).unwrap();
        clock.advance(1.72);
        transport.tick();
        assert!(transport.playback().is_playing);
    }

    #[tokio::test]
    async fn test_early_voice_end_leaves_state() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 3.0).await;
        transport.play().unwrap();
        clock.advance(1.0);

        transport.engine.as_mut().unwrap().exhaust_voices();
        transport.tick();

        assert!(transport.playback().is_playing);
    }

    #[tokio::test]
    async fn test_seek_is_clamped() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 2.0).await;

        transport.seek(-3.0).unwrap();
        assert_eq!(transport.position(), 0.0);
        transport.seek(99.0).unwrap();
        assert!((transport.position() - 2.0).abs() < 1e-6);
        transport.seek(f64::NAN).unwrap();
        assert_eq!(transport.position(), 0.0);
    }

    #[tokio::test]
    async fn test_toggle_play_switches_state() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 2.0).await;

        transport.toggle_play().unwrap();
        assert!(transport.playback().is_playing);
        transport.toggle_play().unwrap();
        assert!(!transport.playback().is_playing);
    }

    #[tokio::test]
    async fn test_volume_reaches_engine_gain() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 1.0).await;
        assert!((transport.engine().unwrap().gain - 0.8).abs() < 1e-6);

        transport.set_volume(1.7);
        assert_eq!(transport.playback().volume, 1.0);
        assert_eq!(transport.engine().unwrap().gain, 1.0);

        transport.set_volume(0.3);
        assert_eq!(transport.engine().unwrap().gain, 0.3);
    }

    #[tokio::test]
    async fn test_fft_size_change_resizes_frame() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 3.0).await;
        transport.play().unwrap();
        transport.tick();
        assert_eq!(transport.frame().bin_count(), 1024);

        transport.set_sensitivity(SensitivitySettings {
            fft_size: 512,
            ..Default::default()
        });
        transport.tick();
        assert_eq!(transport.frame().bin_count(), 256);
        assert_eq!(transport.sensitivity().fft_size, 512);
    }

    #[tokio::test]
    async fn test_invalid_fft_size_keeps_current_size() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 3.0).await;
        transport.set_sensitivity(SensitivitySettings {
            fft_size: 512,
            ..Default::default()
        });

        transport.set_sensitivity(SensitivitySettings {
            fft_size: 1000,
            bass_boost: 2.0,
            ..Default::default()
        });

        assert_eq!(transport.engine().unwrap().analyser().fft_size(), 512);
        assert_eq!(transport.sensitivity().fft_size, 512);
        assert_eq!(transport.sensitivity().bass_boost, 2.0);

        transport.play().unwrap();
        transport.tick();
        assert_eq!(transport.frame().bin_count(), 256);
    }

    #[tokio::test]
    async fn test_engine_failure_is_surfaced() {
        let mut transport: Transport<FakeEngine> = Transport::new(
            |_: &SensitivitySettings| Err(VisualizerError::EngineUnavailable("denied".into())),
            &AppConfig::default(),
        );
        let file = AudioFile::new("tone.wav", tone_wav(0.5, 8000));

        let err = transport.load_file(&file).await.unwrap_err();
        assert!(matches!(err, VisualizerError::EngineUnavailable(_)));
        assert!(!transport.is_loaded());
        assert!(transport.seek(1.0).is_ok());
        transport.tick();
    }

    #[tokio::test]
    async fn test_loading_new_track_stops_playback() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 2.0).await;
        transport.play().unwrap();
        transport.tick();
        assert!(!transport.frame().is_empty());

        let next = AudioFile::new("next.wav", tone_wav(1.0, 8000));
        transport.load_file(&next).await.unwrap();

        assert!(!transport.playback().is_playing);
        assert!(transport.frame().is_empty());
        assert!(transport.engine().unwrap().active.is_empty());
        assert_eq!(transport.playback().file_name.as_deref(), Some("next.wav"));
    }

    #[tokio::test]
    async fn test_loading_new_track_resets_beat_history() {
        let clock = ManualClock::default();
        let mut transport = loaded(&clock, 3.0).await;
        transport.play().unwrap();
        for _ in 0..5 {
            clock.advance(0.02);
            transport.tick();
        }
        assert_eq!(transport.beat_history_len(), 5);

        let next = AudioFile::new("next.wav", tone_wav(1.0, 8000));
        transport.load_file(&next).await.unwrap();
        assert_eq!(transport.beat_history_len(), 0);

        transport.play().unwrap();
        transport.tick();
        assert_eq!(transport.beat_history_len(), 1);
    }
}
