//! Real-time background blur and background replacement for live camera tracks.
//!
//! A [`BlurBackground`] or [`VirtualBackground`] processor acquires a camera
//! track, runs every frame through a segmentation engine and a compositor, and
//! hands back a [`ProcessedStream`] whose output track can stand in for the raw
//! camera. Depending on what the [`Platform`] offers, frames are either pushed
//! through a backpressured stream pipeline or pulled by a per-frame render loop
//! whose output surface is sampled at a fixed rate.
//!
//! ```no_run
//! # async fn run() -> backdrop::Result<()> {
//! use std::sync::Arc;
//! use backdrop::{BlurBackground, BlurBackgroundOptions, Platform, StreamOptions, SyntheticCamera};
//!
//! # let engines: Arc<dyn backdrop::segmentation::EngineFactory> = unimplemented!();
//! let platform = Platform::new(Arc::new(SyntheticCamera::new(640, 480)), engines);
//! let mut blur = BlurBackground::new(platform, BlurBackgroundOptions { blur: Some(20.0) })?;
//! blur.initialize().await?;
//! let mut stream = blur.create_processed_stream(StreamOptions::default()).await?;
//! stream.set_enabled(false).await?;
//! stream.dispose().await?;
//! blur.dispose().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod output;
pub mod processed_stream;
pub mod processor;
pub mod render;
pub mod segmentation;
pub mod strategy;
pub mod track;

pub use capture::{DeviceAcquisition, FramePattern, SyntheticCamera};
pub use config::{ModelSelection, ProcessorConfig, SegmentationConfig};
pub use error::{Error, Result};
pub use frame::{FrameBudget, VideoFrame};
pub use processed_stream::{ProcessedStream, StreamKind, StreamOptions};
pub use processor::{
    BackgroundImage, BlurBackground, BlurBackgroundOptions, Platform, VirtualBackground,
    VirtualBackgroundOptions,
};
pub use strategy::{Capabilities, FrameDelivery};
pub use track::{MediaTrack, ReadyState, TrackSettings, VideoConstraints};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
