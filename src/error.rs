use thiserror::Error;

/// Failures surfaced by the analysis pipeline to its caller.
///
/// Per-frame read problems never show up here: the sampler swallows them and
/// treats the frame as empty.
#[derive(Debug, Error)]
pub enum VisualizerError {
    /// The file could not be decoded (corrupt, unsupported codec, no audio track).
    #[error("failed to decode audio: {0}")]
    DecodeFailed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The platform refused to give us an output device or stream.
    #[error("audio engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("invalid FFT size {0}: must be a power of two between 32 and 32768")]
    InvalidFftSize(usize),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, VisualizerError>;
