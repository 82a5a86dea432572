//! Blur or replace the webcam background and publish the result on a
//! v4l2loopback device.
//!
//! ```text
//! cargo run --example loopback --features camera,rvm -- --models ./models --blur 30
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use backdrop::capture::WebcamDevices;
use backdrop::output::{pump_track, LoopbackSink};
use backdrop::segmentation::rvm_engine_factory;
use backdrop::{
    BackgroundImage, BlurBackground, BlurBackgroundOptions, Platform, ProcessedStream, ProcessorConfig,
    StreamOptions, VideoConstraints, VirtualBackground, VirtualBackgroundOptions,
};
use clap::Parser;

const MODEL_FILE: &str = "rvm_mobilenetv3_fp32.onnx";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Requested capture width
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Requested capture height
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Requested capture rate
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Directory holding the RVM ONNX export
    #[arg(long)]
    models: PathBuf,

    /// Blur radius, 1-100
    #[arg(long, conflicts_with = "background")]
    blur: Option<f32>,

    /// Replace the background with this image instead of blurring it
    #[arg(long)]
    background: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let mut config = ProcessorConfig::default();
    config.segmentation.model_base = format!("{}/", args.models.display());
    let devices = Arc::new(WebcamDevices::new(config.frame_queue_depth));
    let platform = Platform::new(devices, rvm_engine_factory(MODEL_FILE)).with_config(config);

    let options = StreamOptions::default().constraints(VideoConstraints {
        width: Some(args.width),
        height: Some(args.height),
        frame_rate: Some(args.fps),
        device: Some(args.input_device),
    });

    match &args.background {
        Some(path) => {
            let image = BackgroundImage::Path(path.clone());
            let mut processor = VirtualBackground::new(platform, VirtualBackgroundOptions { image })?;
            processor.initialize().await?;
            let stream = processor.create_processed_stream(options).await?;
            publish(stream, &args).await?;
            processor.dispose().await?;
        }
        None => {
            let mut processor = BlurBackground::new(platform, BlurBackgroundOptions { blur: args.blur })?;
            processor.initialize().await?;
            let stream = processor.create_processed_stream(options).await?;
            publish(stream, &args).await?;
            processor.dispose().await?;
        }
    }

    Ok(())
}

/// Pump the processed track into the loopback device until the track ends or
/// Ctrl+C is pressed.
async fn publish(mut stream: ProcessedStream, args: &Args) -> Result<()> {
    let track = stream.track().cloned().context("processed stream has no track")?;
    let settings = track.settings();
    let (width, height) = (
        settings.width.unwrap_or(args.width),
        settings.height.unwrap_or(args.height),
    );
    let mut sink = LoopbackSink::open(&args.output_device, width, height)
        .context("Failed to initialize v4l2loopback output")?;

    tracing::info!(device = %args.output_device, width, height, "publishing processed track, Ctrl+C to stop");
    tokio::select! {
        written = pump_track(&track, &mut sink) => {
            tracing::info!(frames = written?, "processed track ended");
        }
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    stream.dispose().await?;
    Ok(())
}
