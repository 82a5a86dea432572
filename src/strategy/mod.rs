//! Frame-delivery strategies.
//!
//! Both strategies turn a camera track into a processed output track; they
//! differ in how frames reach the compositor. [`StreamStrategy`] pushes every
//! frame through a backpressured transform. [`FrameCallbackStrategy`] renders
//! whenever a new frame has been decoded and samples its output surface at a
//! fixed rate.

mod frame_callback;
mod playback;
mod stream;

pub use frame_callback::FrameCallbackStrategy;
pub use stream::StreamStrategy;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::capture::DeviceAcquisition;
use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::processed_stream::{ProcessedStream, StreamKind, StreamOptions};
use crate::render::Backdrop;
use crate::segmentation::EngineFactory;

/// Frame-delivery primitives available on the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Tracks can be consumed and produced as backpressured frame streams.
    pub frame_stream: bool,
    /// A callback can be scheduled for each newly decoded frame.
    pub frame_callback: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            frame_stream: true,
            frame_callback: true,
        }
    }

    pub fn none() -> Self {
        Self {
            frame_stream: false,
            frame_callback: false,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDelivery {
    Stream,
    FrameCallback,
}

impl FrameDelivery {
    /// Prefer frame streams, fall back to frame callbacks.
    pub fn detect(capabilities: &Capabilities) -> Option<Self> {
        if capabilities.frame_stream {
            Some(Self::Stream)
        } else if capabilities.frame_callback {
            Some(Self::FrameCallback)
        } else {
            None
        }
    }
}

/// Everything a strategy needs to build pipelines.
#[derive(Clone)]
pub struct StrategyContext {
    pub devices: Arc<dyn DeviceAcquisition>,
    pub engines: Arc<dyn EngineFactory>,
    pub config: ProcessorConfig,
    pub backdrop: Backdrop,
    pub kind: StreamKind,
}

/// Turns camera tracks into processed streams.
///
/// Lifecycle: `initialize` once, any number of `create_processed_stream`
/// calls, then `dispose`. A disposed strategy rejects every call.
#[async_trait]
pub trait BackgroundStrategy: Send + Sync {
    fn delivery(&self) -> FrameDelivery;

    async fn initialize(&mut self) -> Result<()>;

    /// Acquire a camera with `options.constraints` and wrap the processed
    /// output in a [`ProcessedStream`].
    async fn create_processed_stream(&self, options: StreamOptions) -> Result<ProcessedStream>;

    async fn dispose(&mut self) -> Result<()>;
}

/// Pick the strategy for `capabilities`, or `None` when neither delivery
/// model is available.
pub fn create_strategy(capabilities: &Capabilities, context: StrategyContext) -> Option<Box<dyn BackgroundStrategy>> {
    let delivery = FrameDelivery::detect(capabilities)?;
    tracing::info!(?delivery, kind = ?context.kind, "frame delivery selected");

    Some(match delivery {
        FrameDelivery::Stream => Box::new(StreamStrategy::new(context)),
        FrameDelivery::FrameCallback => Box::new(FrameCallbackStrategy::new(context)),
    })
}

/// Where a strategy stands between `new` and `dispose`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initialized,
    Disposed,
}

impl Lifecycle {
    fn require_initialized(self, name: &'static str) -> Result<()> {
        match self {
            Lifecycle::Initialized => Ok(()),
            Lifecycle::Uninitialized => Err(crate::Error::NotInitialized(name)),
            Lifecycle::Disposed => Err(crate::Error::Disposed(name)),
        }
    }
}

/// Resolves once `signal` is raised or its sender is gone.
async fn cancelled(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}

fn track_label(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Blur => "blur",
        StreamKind::VirtualBackground => "virtual-background",
    }
}
