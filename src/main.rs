//! camera-engine - capture a camera session to a file
//!
//! Subcommands:
//! - `camera-engine record` - Record from the test pattern or a webcam
//! - `camera-engine photo` - Save one PNG snapshot
//! - `camera-engine devices` - List cameras
//! - `camera-engine init-config <path>` - Write the default configuration

use anyhow::{Context, Result};
use camera_engine::capture::{FrameSource, TestPatternSource, ToneSource};
use camera_engine::encoder::{FfmpegWriterFactory, ManifestWriterFactory, WriterFactory};
use camera_engine::{storage, CameraEngine, EngineConfig};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Parser)]
#[command(name = "camera-engine")]
#[command(about = "Camera capture and encode engine")]
#[command(version)]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Source {
    /// Synthetic pattern and tone
    TestPattern,
    /// Default webcam and microphone (needs the `hardware` feature)
    Webcam,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a capture session
    Record {
        /// Output file (defaults to a timestamped name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Seconds to record before stopping
        #[arg(short, long, default_value = "5")]
        seconds: f64,

        #[arg(long, value_enum, default_value = "test-pattern")]
        source: Source,

        /// Stop automatically after this many seconds of capture
        #[arg(long)]
        max_duration: Option<f64>,

        /// Pause for this many seconds halfway through
        #[arg(long)]
        pause: Option<f64>,

        /// Write a JSON timeline manifest instead of encoding media
        #[arg(long)]
        dry_run: bool,
    },

    /// Save a PNG snapshot of the next frame
    Photo {
        #[arg(short, long, default_value = "photo.png")]
        output: PathBuf,

        #[arg(long, value_enum, default_value = "test-pattern")]
        source: Source,
    },

    /// List available cameras
    Devices,

    /// Write the default configuration to a file
    InitConfig { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    camera_engine::init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Record {
            output,
            seconds,
            source,
            max_duration,
            pause,
            dry_run,
        } => record(config, output, seconds, source, max_duration, pause, dry_run).await,
        Commands::Photo { output, source } => photo(config, output, source).await,
        Commands::Devices => {
            let cameras = camera_engine::capture::list_cameras();
            if cameras.is_empty() {
                println!("No cameras found");
            }
            for camera in cameras {
                println!("{}\t{}", camera.id, camera.name);
            }
            Ok(())
        }
        Commands::InitConfig { path } => {
            EngineConfig::default().save(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
    }
}

fn sources(config: &mut EngineConfig, source: Source) -> Result<Vec<Box<dyn FrameSource>>> {
    match source {
        Source::TestPattern => {
            let (width, height) = config.encoder_preset.dimensions();
            Ok(vec![
                Box::new(TestPatternSource::new(width, height, config.frame_rate)),
                Box::new(ToneSource::new(
                    440.0,
                    config.audio_channels,
                    config.audio_sample_rate,
                )),
            ])
        }
        #[cfg(feature = "hardware")]
        Source::Webcam => {
            use camera_engine::capture::microphone::{default_input_format, MicrophoneSource};
            use camera_engine::capture::webcam::WebcamSource;

            let mut sources: Vec<Box<dyn FrameSource>> = vec![Box::new(WebcamSource::new(None))];
            match default_input_format() {
                Ok((name, channels, sample_rate)) => {
                    tracing::info!("Recording audio from {}", name);
                    config.audio_channels = channels;
                    config.audio_sample_rate = sample_rate;
                    sources.push(Box::new(MicrophoneSource::new()));
                }
                Err(e) => tracing::warn!("No microphone, recording video only: {}", e),
            }
            Ok(sources)
        }
        #[cfg(not(feature = "hardware"))]
        Source::Webcam => {
            let _ = config;
            anyhow::bail!("webcam capture needs the `hardware` feature")
        }
    }
}

async fn record(
    mut config: EngineConfig,
    output: Option<PathBuf>,
    seconds: f64,
    source: Source,
    max_duration: Option<f64>,
    pause: Option<f64>,
    dry_run: bool,
) -> Result<()> {
    if max_duration.is_some() {
        config.maximum_capture_duration = max_duration;
    }
    let mut sources = sources(&mut config, source)?;

    let writers: Arc<dyn WriterFactory> = if dry_run {
        Arc::new(ManifestWriterFactory)
    } else {
        let ffmpeg = FfmpegWriterFactory::new();
        ffmpeg.check_available()?;
        Arc::new(ffmpeg)
    };

    let output = match output {
        Some(path) => path,
        None => {
            let path = storage::default_output_path(&std::env::current_dir()?);
            if dry_run {
                path.with_extension("json")
            } else {
                path
            }
        }
    };

    let engine = CameraEngine::new(config, writers)?;
    engine.on_state_changed(|change| {
        tracing::info!("State: {} -> {}", change.from, change.to);
    })?;

    let (done_tx, done_rx) = oneshot::channel();
    engine
        .start_capture(output, move |result| {
            let _ = done_tx.send(result);
        })
        .await?;

    for source in sources.iter_mut() {
        source.start(engine.frame_sink()).await?;
    }

    let total = Duration::from_secs_f64(seconds.max(0.0));
    match pause {
        Some(paused) => {
            tokio::time::sleep(total / 2).await;
            engine.pause_capture().await?;
            tokio::time::sleep(Duration::from_secs_f64(paused.max(0.0))).await;
            engine.resume_capture().await?;
            tokio::time::sleep(total / 2).await;
        }
        None => tokio::time::sleep(total).await,
    }

    engine.stop_capture().await?;
    let result = done_rx.await.context("engine stopped before finishing")?;

    for source in sources.iter_mut() {
        source.stop().await?;
    }
    let stats = engine.stats().await?;
    engine.shutdown().await?;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    tracing::info!(
        "Routed {} frames, {} dropped at the frame queue",
        stats.controller.router.routed,
        stats.frame_queue_dropped
    );
    Ok(())
}

async fn photo(mut config: EngineConfig, output: PathBuf, source: Source) -> Result<()> {
    let mut sources = sources(&mut config, source)?;
    let engine = CameraEngine::new(config, Arc::new(ManifestWriterFactory))?;

    for source in sources.iter_mut() {
        source.start(engine.frame_sink()).await?;
    }
    let photo = engine.take_photo().await;
    for source in sources.iter_mut() {
        source.stop().await?;
    }
    engine.shutdown().await?;

    let photo = photo?;
    photo.save(&output)?;
    println!("Saved {}x{} photo to {}", photo.width, photo.height, output.display());
    Ok(())
}
