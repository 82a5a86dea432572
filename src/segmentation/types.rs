use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use image::{GrayImage, RgbImage, RgbaImage};

use crate::config::SegmentationConfig;

/// Row-major foreground coverage in `0.0..=1.0`, either at frame size or at
/// the producing model's output size.
pub type Matte = Vec<f32>;

/// Mask plus the image it was computed from.
#[derive(Debug, Clone)]
pub struct SegmentationResult {
    mask: GrayImage,
    image: Arc<RgbaImage>,
}

impl SegmentationResult {
    pub fn new(mask: GrayImage, image: Arc<RgbaImage>) -> Self {
        Self { mask, image }
    }

    /// Per-pixel foreground coverage. May be smaller than the image; it is
    /// scaled when drawn.
    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Geometry of the source image this result belongs to.
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Receives every result an engine produces.
pub type ResultCallback = Arc<dyn Fn(SegmentationResult) + Send + Sync>;

/// Callback-driven segmentation engine.
///
/// `send` hands an image over; the result arrives later through the callback
/// registered with `on_result`. Engines are not required to accept a second
/// `send` while one is pending.
#[async_trait]
pub trait SegmentationEngine: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn send(&self, image: &RgbaImage) -> Result<()>;

    /// Replace the result callback.
    fn on_result(&self, callback: ResultCallback);

    async fn close(&self) -> Result<()>;
}

/// Builds engines for the segmentation adapter.
pub trait EngineFactory: Send + Sync {
    fn create(&self, config: &SegmentationConfig) -> Result<Arc<dyn SegmentationEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&SegmentationConfig) -> Result<Arc<dyn SegmentationEngine>> + Send + Sync,
{
    fn create(&self, config: &SegmentationConfig) -> Result<Arc<dyn SegmentationEngine>> {
        self(config)
    }
}

/// A synchronous matting model, driven frame by frame by [`super::ModelEngine`]
/// on the blocking pool.
pub trait SegmentationModel: Send {
    /// Compute the matte for one frame.
    ///
    /// A matte that is not frame sized must be `output_size` sized; the engine
    /// scales it to the frame before turning it into a mask.
    fn segment(&mut self, frame: &RgbImage) -> Result<Matte>;

    /// Forget any state carried between frames. The engine calls this when it
    /// is initialized and when it is closed, so every processing session
    /// starts clean.
    fn reset_state(&mut self) {}

    /// Width and height the model resizes frames to.
    fn input_size(&self) -> (u32, u32);

    /// Width and height of the mattes it returns.
    fn output_size(&self) -> (u32, u32) {
        self.input_size()
    }
}
