use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use image::RgbaImage;

use super::types::{EngineFactory, ResultCallback, SegmentationEngine, SegmentationResult};
use crate::config::SegmentationConfig;
use crate::error::{Error, Result};
use crate::lock;

const NAME: &str = "SegmentationAdapter";

/// Lifecycle wrapper around one segmentation engine.
///
/// Owns the engine between `initialize` and `dispose`, keeps the result
/// callback across re-initialization, and refuses a `send` while another is
/// still in flight.
pub struct SegmentationAdapter {
    factory: Arc<dyn EngineFactory>,
    config: SegmentationConfig,
    engine: Mutex<Option<Arc<dyn SegmentationEngine>>>,
    callback: Mutex<Option<ResultCallback>>,
    in_flight: AtomicBool,
}

impl SegmentationAdapter {
    pub fn new(factory: Arc<dyn EngineFactory>, config: SegmentationConfig) -> Self {
        Self {
            factory,
            config,
            engine: Mutex::new(None),
            callback: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.engine).is_some()
    }

    /// Create and initialize the engine, attaching any callback registered
    /// beforehand.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Err(Error::AlreadyInitialized(NAME));
        }

        let engine = self.factory.create(&self.config).map_err(Error::Segmentation)?;
        if let Some(callback) = lock(&self.callback).clone() {
            engine.on_result(callback);
        }
        engine.initialize().await.map_err(Error::Segmentation)?;

        *lock(&self.engine) = Some(engine);
        tracing::info!(model = ?self.config.model_selection, "segmentation engine initialized");
        Ok(())
    }

    /// Register the result callback, replacing the previous one.
    pub fn set_result_callback<F>(&self, callback: F)
    where
        F: Fn(SegmentationResult) + Send + Sync + 'static,
    {
        let callback: ResultCallback = Arc::new(callback);
        *lock(&self.callback) = Some(Arc::clone(&callback));
        if let Some(engine) = lock(&self.engine).as_ref() {
            engine.on_result(callback);
        }
    }

    /// Hand `image` to the engine.
    ///
    /// Fails with [`Error::SegmentationBusy`] if a previous `send` has not
    /// resolved yet.
    pub async fn send(&self, image: &RgbaImage) -> Result<()> {
        let engine = lock(&self.engine)
            .clone()
            .ok_or(Error::NotInitialized(NAME))?;
        let _in_flight = InFlight::acquire(&self.in_flight).ok_or(Error::SegmentationBusy)?;

        engine.send(image).await.map_err(Error::Segmentation)
    }

    /// Close the engine and forget the callback.
    pub async fn dispose(&self) -> Result<()> {
        let engine = lock(&self.engine)
            .take()
            .ok_or(Error::NotInitialized(NAME))?;
        lock(&self.callback).take();

        engine.close().await.map_err(Error::Segmentation)?;
        tracing::info!("segmentation engine disposed");
        Ok(())
    }
}

/// Marks a `send` in progress; cleared on drop, including when the sending
/// future is cancelled.
struct InFlight<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::GrayImage;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Echoes every image back as an all-foreground result. Sends can be held
    /// open until `release` is notified.
    #[derive(Default)]
    struct EchoEngine {
        callback: Mutex<Option<ResultCallback>>,
        gate: Option<Arc<Notify>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl SegmentationEngine for EchoEngine {
        async fn initialize(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(&self, image: &RgbaImage) -> anyhow::Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let result = SegmentationResult::new(
                GrayImage::from_pixel(image.width(), image.height(), image::Luma([255])),
                Arc::new(image.clone()),
            );
            if let Some(callback) = lock(&self.callback).clone() {
                callback(result);
            }
            Ok(())
        }

        fn on_result(&self, callback: ResultCallback) {
            *lock(&self.callback) = Some(callback);
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn adapter_with(engine: Arc<EchoEngine>) -> SegmentationAdapter {
        let factory = move |_: &SegmentationConfig| -> anyhow::Result<Arc<dyn SegmentationEngine>> {
            Ok(engine.clone())
        };
        SegmentationAdapter::new(Arc::new(factory), SegmentationConfig::default())
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let adapter = adapter_with(Arc::new(EchoEngine::default()));
        let image = RgbaImage::new(2, 2);

        assert!(matches!(adapter.send(&image).await, Err(Error::NotInitialized(_))));
        assert!(matches!(adapter.dispose().await, Err(Error::NotInitialized(_))));

        adapter.initialize().await.unwrap();
        assert!(matches!(adapter.initialize().await, Err(Error::AlreadyInitialized(_))));

        adapter.dispose().await.unwrap();
        assert!(!adapter.is_initialized());
        assert!(matches!(adapter.dispose().await, Err(Error::NotInitialized(_))));
    }

    #[tokio::test]
    async fn callback_registered_before_initialize_is_attached() {
        let adapter = adapter_with(Arc::new(EchoEngine::default()));
        let results = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&results);
        adapter.set_result_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        adapter.initialize().await.unwrap();
        adapter.send(&RgbaImage::new(2, 2)).await.unwrap();
        assert_eq!(results.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replacing_the_callback_redirects_results() {
        let adapter = adapter_with(Arc::new(EchoEngine::default()));
        adapter.initialize().await.unwrap();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&first);
        adapter.set_result_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        adapter.send(&RgbaImage::new(1, 1)).await.unwrap();

        let counter = Arc::clone(&second);
        adapter.set_result_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        adapter.send(&RgbaImage::new(1, 1)).await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_send_is_rejected() {
        let gate = Arc::new(Notify::new());
        let engine = Arc::new(EchoEngine {
            gate: Some(Arc::clone(&gate)),
            ..EchoEngine::default()
        });
        let adapter = Arc::new(adapter_with(engine));
        adapter.initialize().await.unwrap();

        let pending = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.send(&RgbaImage::new(1, 1)).await })
        };
        // Let the first send reach the gate.
        while !adapter.in_flight.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let second = adapter.send(&RgbaImage::new(1, 1)).await;
        assert!(matches!(second, Err(Error::SegmentationBusy)));

        gate.notify_one();
        pending.await.unwrap().unwrap();

        // The slot frees once the first send resolves.
        gate.notify_one();
        adapter.send(&RgbaImage::new(1, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn dispose_closes_engine() {
        let engine = Arc::new(EchoEngine::default());
        let adapter = adapter_with(Arc::clone(&engine));
        adapter.initialize().await.unwrap();
        adapter.dispose().await.unwrap();
        assert!(engine.closed.load(Ordering::SeqCst));
    }
}
