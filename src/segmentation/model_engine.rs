use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use image::buffer::ConvertBuffer;
use image::{GrayImage, RgbImage, RgbaImage};

use super::preprocess::Preprocessor;
use super::types::{ResultCallback, SegmentationEngine, SegmentationModel, SegmentationResult};
use crate::lock;

/// Runs a synchronous [`SegmentationModel`] behind the callback engine
/// contract.
///
/// Inference runs on the blocking pool; the result callback fires before
/// `send` resolves.
pub struct ModelEngine<M> {
    model: Arc<Mutex<M>>,
    callback: Mutex<Option<ResultCallback>>,
    ready: AtomicBool,
}

impl<M: SegmentationModel + 'static> ModelEngine<M> {
    pub fn new(model: M) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            callback: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<M: SegmentationModel + 'static> SegmentationEngine for ModelEngine<M> {
    async fn initialize(&self) -> Result<()> {
        lock(&self.model).reset_state();
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, image: &RgbaImage) -> Result<()> {
        ensure!(self.ready.load(Ordering::Acquire), "model engine is not initialized");

        let image = Arc::new(image.clone());
        let frame = Arc::clone(&image);
        let model = Arc::clone(&self.model);

        let mask = tokio::task::spawn_blocking(move || segment_to_mask(&model, &frame))
            .await
            .context("segmentation task failed")??;

        if let Some(callback) = lock(&self.callback).clone() {
            callback(SegmentationResult::new(mask, image));
        }
        Ok(())
    }

    fn on_result(&self, callback: ResultCallback) {
        *lock(&self.callback) = Some(callback);
    }

    async fn close(&self) -> Result<()> {
        self.ready.store(false, Ordering::Release);
        lock(&self.callback).take();
        lock(&self.model).reset_state();
        Ok(())
    }
}

fn segment_to_mask<M: SegmentationModel>(model: &Mutex<M>, frame: &RgbaImage) -> Result<GrayImage> {
    let _span = tracing::debug_span!("segment").entered();

    let rgb: RgbImage = frame.convert();
    let (width, height) = frame.dimensions();
    let mut model = lock(model);
    let matte = model.segment(&rgb)?;

    if matte.len() == (width * height) as usize {
        return Preprocessor::matte_to_mask(&matte, width, height);
    }

    let (matte_width, matte_height) = model.output_size();
    let resized = Preprocessor::postprocess_matte(&matte, matte_width, matte_height, width, height)?;
    Preprocessor::matte_to_mask(&resized, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::sync::atomic::AtomicUsize;

    /// Marks the left half of every frame as foreground, at a fixed model
    /// resolution.
    struct LeftHalf {
        resets: Arc<AtomicUsize>,
    }

    impl SegmentationModel for LeftHalf {
        fn segment(&mut self, _frame: &RgbImage) -> Result<Vec<f32>> {
            Ok(vec![1.0, 1.0, 0.0, 0.0])
        }

        fn reset_state(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }

        fn input_size(&self) -> (u32, u32) {
            (4, 1)
        }
    }

    #[tokio::test]
    async fn result_arrives_before_send_resolves() {
        let resets = Arc::new(AtomicUsize::new(0));
        let engine = ModelEngine::new(LeftHalf {
            resets: Arc::clone(&resets),
        });
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        engine.on_result(Arc::new(move |result| {
            *lock(&sink) = Some(result);
        }));

        engine.initialize().await.unwrap();
        assert_eq!(resets.load(Ordering::SeqCst), 1);

        let frame = RgbaImage::from_pixel(8, 2, Rgba([9, 9, 9, 255]));
        engine.send(&frame).await.unwrap();

        let result = lock(&received).take().expect("callback fired");
        assert_eq!(result.dimensions(), (8, 2));
        assert_eq!(result.mask().dimensions(), (8, 2));
        assert_eq!(result.mask().get_pixel(0, 0)[0], 255);
        assert_eq!(result.mask().get_pixel(7, 1)[0], 0);
        assert_eq!(*result.image().get_pixel(3, 1), Rgba([9, 9, 9, 255]));
    }

    #[tokio::test]
    async fn send_requires_initialize() {
        let engine = ModelEngine::new(LeftHalf {
            resets: Arc::new(AtomicUsize::new(0)),
        });
        assert!(engine.send(&RgbaImage::new(4, 1)).await.is_err());

        engine.initialize().await.unwrap();
        engine.send(&RgbaImage::new(4, 1)).await.unwrap();
        engine.close().await.unwrap();
        assert!(engine.send(&RgbaImage::new(4, 1)).await.is_err());
    }
}
