use std::time::Instant;

use super::engine::AudioEngine;
use super::transport::Transport;
use super::FrameBuffer;

/// Anything that fills a [`FrameBuffer`] once per rendered frame.
///
/// Renderers only see this interface, so file playback and live capture are
/// interchangeable. One producer is chosen per session.
pub trait FrameSource {
    /// Advances the producer by one frame.
    fn tick_at(&mut self, now: Instant);

    fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Latest frame. Buffers are reused in place; copy before keeping them.
    fn frame(&self) -> &FrameBuffer;

    fn beat_at(&self, now: Instant) -> bool;

    fn beat(&self) -> bool {
        self.beat_at(Instant::now())
    }

    /// Short identifier for logging.
    fn source_type(&self) -> &'static str;
}

impl<E: AudioEngine> FrameSource for Transport<E> {
    fn tick_at(&mut self, now: Instant) {
        Transport::tick_at(self, now);
    }

    fn frame(&self) -> &FrameBuffer {
        Transport::frame(self)
    }

    fn beat_at(&self, now: Instant) -> bool {
        Transport::beat_at(self, now)
    }

    fn source_type(&self) -> &'static str {
        "file"
    }
}
