//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backdrop::segmentation::{
    EngineFactory, ModelEngine, ResultCallback, SegmentationEngine, SegmentationModel, SegmentationResult,
};
use backdrop::{MediaTrack, SegmentationConfig, VideoFrame};
use image::{GrayImage, Luma, Rgba, RgbImage, RgbaImage};

pub const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);

/// How long a test waits for a pipeline to make progress.
pub const PIPELINE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Left half of the frame is the subject.
fn half_mask(width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, _| if x < width / 2 { Luma([255]) } else { Luma([0]) })
}

/// Matte model that marks the left half of every frame as foreground.
pub struct HalfModel;

impl SegmentationModel for HalfModel {
    fn segment(&mut self, frame: &RgbImage) -> anyhow::Result<Vec<f32>> {
        let (width, height) = frame.dimensions();
        Ok(half_mask(width, height)
            .pixels()
            .map(|p| p[0] as f32 / 255.0)
            .collect())
    }

    fn input_size(&self) -> (u32, u32) {
        (256, 144)
    }
}

/// Engines running [`HalfModel`]. Counts how many engines were created.
pub fn half_model_engines(created: Arc<AtomicUsize>) -> Arc<dyn EngineFactory> {
    let factory = move |_: &SegmentationConfig| -> anyhow::Result<Arc<dyn SegmentationEngine>> {
        created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ModelEngine::new(HalfModel)))
    };
    Arc::new(factory)
}

/// Engine that answers with a half mask, except for the listed sends (counted
/// from zero), which fail.
#[derive(Default)]
pub struct FlakyEngine {
    failing: HashSet<usize>,
    sends: AtomicUsize,
    callback: Mutex<Option<ResultCallback>>,
}

impl FlakyEngine {
    pub fn failing_on(sends: impl IntoIterator<Item = usize>) -> Self {
        Self {
            failing: sends.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentationEngine for FlakyEngine {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, image: &RgbaImage) -> anyhow::Result<()> {
        let index = self.sends.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&index) {
            anyhow::bail!("simulated segmentation failure on send {index}");
        }

        let (width, height) = image.dimensions();
        let result = SegmentationResult::new(half_mask(width, height), Arc::new(image.clone()));
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(result);
        }
        Ok(())
    }

    fn on_result(&self, callback: ResultCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Factory handing out one shared engine.
pub fn shared_engine(engine: Arc<FlakyEngine>) -> Arc<dyn EngineFactory> {
    let factory = move |_: &SegmentationConfig| -> anyhow::Result<Arc<dyn SegmentationEngine>> {
        Ok(engine.clone())
    };
    Arc::new(factory)
}

/// Read every frame of `track` until it ends.
pub async fn collect_frames(track: &MediaTrack) -> Vec<VideoFrame> {
    let mut reader = track.take_reader().expect("output reader already taken");
    let mut frames = Vec::new();
    tokio::time::timeout(PIPELINE_TIMEOUT, async {
        while let Some(frame) = reader.next_frame().await {
            frames.push(frame);
        }
    })
    .await
    .expect("output track did not end");
    frames
}

/// Read frames from `track` until one satisfies `accept`.
pub async fn frame_where<F>(track: &MediaTrack, mut accept: F) -> VideoFrame
where
    F: FnMut(&VideoFrame) -> bool,
{
    let mut reader = track.take_reader().expect("output reader already taken");
    tokio::time::timeout(PIPELINE_TIMEOUT, async {
        loop {
            let frame = reader.next_frame().await.expect("output track ended early");
            if accept(&frame) {
                return frame;
            }
        }
    })
    .await
    .expect("no matching output frame")
}

/// Poll `condition` until it holds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(PIPELINE_TIMEOUT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}
