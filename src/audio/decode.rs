use log::info;
use std::io::Cursor;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{Result, VisualizerError};

/// Extensions advertised to file pickers. Decoding itself goes by content.
pub const SUPPORTED_EXTENSIONS: [&str; 6] = ["mp3", "wav", "ogg", "flac", "m4a", "aac"];

/// A user-selected audio file: display name plus raw encoded bytes.
#[derive(Debug, Clone)]
pub struct AudioFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl AudioFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, bytes })
    }

    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.name).extension().and_then(|e| e.to_str())
    }

    pub fn has_supported_extension(&self) -> bool {
        self.extension().map_or(false, |ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
    }
}

/// Fully decoded PCM ready for playback.
#[derive(Debug, Clone)]
pub struct DecodedTrack {
    /// Interleaved samples, `channels` per frame
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl DecodedTrack {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate.max(1) as f64
    }

    /// Interleaved sample index of the frame at `seconds`, clamped to the track.
    pub fn sample_index_at(&self, seconds: f64) -> usize {
        let frame = (seconds.max(0.0) * self.sample_rate as f64) as usize;
        frame.min(self.frames()) * self.channels.max(1) as usize
    }
}

/// Decodes on a blocking worker so the frame loop keeps running.
pub async fn decode_audio_data(file: &AudioFile) -> Result<DecodedTrack> {
    let bytes = file.bytes.clone();
    let extension = file.extension().map(str::to_owned);
    let name = file.name.clone();

    let track = tokio::task::spawn_blocking(move || decode_bytes(bytes, extension.as_deref()))
        .await
        .map_err(|e| VisualizerError::DecodeFailed(format!("decoder task failed: {}", e)))??;

    info!(
        "Decoded {}: {} frames, {} ch, {}Hz, {:.1}s",
        name,
        track.frames(),
        track.channels,
        track.sample_rate,
        track.duration()
    );
    Ok(track)
}

pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>) -> Result<DecodedTrack> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| VisualizerError::DecodeFailed(format!("unrecognised format: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| VisualizerError::DecodeFailed("no audio tracks found".into()))?;

    let track_id = track.id;
    let mut channels = track.codec_params.channels.map(|c| c.count() as u16);
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| VisualizerError::DecodeFailed("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| VisualizerError::DecodeFailed(format!("unsupported codec: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(VisualizerError::DecodeFailed(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // corrupt packet: skip it and keep going
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(VisualizerError::DecodeFailed(e.to_string())),
        };

        let spec = *decoded.spec();
        channels.get_or_insert(spec.channels.count() as u16);

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    let channels = channels.unwrap_or(1).max(1);
    if samples.len() < channels as usize {
        return Err(VisualizerError::DecodeFailed("no audio samples decoded".into()));
    }

    Ok(DecodedTrack {
        samples,
        channels,
        sample_rate,
    })
}
