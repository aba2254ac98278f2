pub mod audio;
pub mod config;
pub mod error;

pub use audio::{
    AudioFile, FrameBuffer, FrameSource, FrequencyBands, PlaybackState, SystemCapture, Transport,
};
pub use config::{AppConfig, SensitivitySettings, SourceKind};
pub use error::{Result, VisualizerError};
