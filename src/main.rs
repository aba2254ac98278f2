use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

use music_visualizer::audio::{AudioFile, FrameSource, SystemCapture, Transport};
use music_visualizer::config::{AppConfig, SourceKind};

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    File,
    System,
}

#[derive(Parser)]
#[command(name = "music-visualizer")]
#[command(about = "Real-time audio analysis feeding music visualizations")]
struct Args {
    /// Audio file to play (MP3, WAV, OGG, FLAC, M4A, AAC)
    #[arg()]
    file: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where frame data comes from
    #[arg(long, value_enum)]
    source: Option<SourceArg>,

    /// Analysis window, a power of two between 32 and 32768
    #[arg(long)]
    fft_size: Option<usize>,

    /// Output volume, 0.0 - 1.0
    #[arg(long)]
    volume: Option<f32>,

    /// Start position in seconds
    #[arg(long)]
    seek: Option<f64>,

    #[arg(long)]
    bass_boost: Option<f32>,

    #[arg(long)]
    treble_boost: Option<f32>,

    /// Overall sensitivity multiplier
    #[arg(long)]
    overall: Option<f32>,

    /// Capture device name for system mode
    #[arg(long)]
    device: Option<String>,
}

impl Args {
    fn config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => AppConfig::default(),
        };

        if let Some(source) = self.source {
            config.source = match source {
                SourceArg::File => SourceKind::File,
                SourceArg::System => SourceKind::System,
            };
        }
        if let Some(fft_size) = self.fft_size {
            config.sensitivity.fft_size = fft_size;
        }
        if let Some(volume) = self.volume {
            config.volume = volume;
        }
        if let Some(boost) = self.bass_boost {
            config.sensitivity.bass_boost = boost;
        }
        if let Some(boost) = self.treble_boost {
            config.sensitivity.treble_boost = boost;
        }
        if let Some(overall) = self.overall {
            config.sensitivity.overall = overall;
        }
        if let Some(device) = &self.device {
            config.device = Some(device.clone());
        }

        Ok(config.sanitize())
    }
}

/// Once-per-second log line so headless runs show what renderers would get.
struct Summary {
    last_report: Instant,
    frames: u32,
    beats: u32,
    was_beat: bool,
}

impl Summary {
    fn new() -> Self {
        Self {
            last_report: Instant::now(),
            frames: 0,
            beats: 0,
            was_beat: false,
        }
    }

    fn record(&mut self, source: &dyn FrameSource, position: Option<f64>) {
        self.frames += 1;
        let beat = source.beat();
        if beat && !self.was_beat {
            self.beats += 1;
        }
        self.was_beat = beat;

        if self.last_report.elapsed() < Duration::from_secs(1) {
            return;
        }

        let b = source.frame().frequency_bands();
        let position = position.map_or(String::new(), |t| format!("{:6.1}s ", t));
        info!(
            "[{}] {}sub {:.2} bass {:.2} lmid {:.2} mid {:.2} hmid {:.2} treb {:.2} | {} beats, {} frames",
            source.source_type(),
            position,
            b.sub_bass,
            b.bass,
            b.low_mid,
            b.mid,
            b.high_mid,
            b.treble,
            self.beats,
            self.frames
        );

        self.last_report = Instant::now();
        self.frames = 0;
        self.beats = 0;
    }
}

fn frame_interval(config: &AppConfig) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / config.frame_rate as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn run_file(args: &Args, config: AppConfig) -> Result<()> {
    let path = args
        .file
        .as_ref()
        .context("An audio FILE is required for file playback")?;

    let file = AudioFile::open(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if !file.has_supported_extension() {
        warn!("{} does not have a known audio extension, trying anyway", file.name);
    }

    let mut transport = Transport::with_default_output(&config);
    transport
        .load_file(&file)
        .await
        .with_context(|| format!("Failed to load {}", file.name))?;

    if let Some(seconds) = args.seek {
        transport.seek(seconds)?;
    }
    transport.play().context("Failed to start playback")?;

    let mut ticker = frame_interval(&config);
    let mut summary = Summary::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                transport.tick();
                summary.record(&transport, Some(transport.playback().current_time));
                if !transport.playback().is_playing {
                    info!("Playback finished");
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                transport.pause();
                break;
            }
        }
    }

    Ok(())
}

async fn run_system(config: AppConfig) -> Result<()> {
    let mut capture = SystemCapture::open(config.device.as_deref(), config.sensitivity.clone())
        .context("Failed to start system audio capture")?;
    info!("Capturing from {}", capture.device_name());

    let mut ticker = frame_interval(&config);
    let mut summary = Summary::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                capture.tick();
                summary.record(&capture, None);
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = args.config()?;

    info!(
        "Starting music visualizer ({:?} source, fft {}, {} fps)",
        config.source, config.sensitivity.fft_size, config.frame_rate
    );

    match config.source {
        SourceKind::File => run_file(&args, config).await,
        SourceKind::System => run_system(config).await,
    }
}
