//! Caller-facing processors.
//!
//! [`BlurBackground`] and [`VirtualBackground`] validate their options at
//! construction, pick a frame-delivery strategy for the [`Platform`] at
//! `initialize`, and hand out [`ProcessedStream`]s until `dispose`.

use std::path::PathBuf;
use std::sync::Arc;

use image::RgbaImage;

use crate::capture::DeviceAcquisition;
use crate::config::ProcessorConfig;
use crate::error::{Error, Result};
use crate::processed_stream::{ProcessedStream, StreamKind, StreamOptions};
use crate::render::Backdrop;
use crate::segmentation::EngineFactory;
use crate::strategy::{create_strategy, BackgroundStrategy, Capabilities, FrameDelivery, StrategyContext};

/// The environment a processor runs in: what it can do, where cameras and
/// segmentation engines come from, and its configuration.
#[derive(Clone)]
pub struct Platform {
    pub capabilities: Capabilities,
    pub devices: Arc<dyn DeviceAcquisition>,
    pub engines: Arc<dyn EngineFactory>,
    pub config: ProcessorConfig,
}

impl Platform {
    /// A fully capable platform with the default configuration.
    pub fn new(devices: Arc<dyn DeviceAcquisition>, engines: Arc<dyn EngineFactory>) -> Self {
        Self {
            capabilities: Capabilities::all(),
            devices,
            engines,
            config: ProcessorConfig::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlurBackgroundOptions {
    /// Blur radius in pixels; the configured default when unset.
    pub blur: Option<f32>,
}

/// Where a virtual background image comes from.
#[derive(Debug, Clone)]
pub enum BackgroundImage {
    Path(PathBuf),
    /// A `file://` URL.
    Url(String),
    /// An already decoded image.
    Image(Arc<RgbaImage>),
}

impl BackgroundImage {
    fn validate(&self) -> Result<()> {
        match self {
            BackgroundImage::Url(url) if file_url_path(url).is_none() => Err(Error::Configuration(format!(
                "background image URL must use the file scheme: {url}"
            ))),
            BackgroundImage::Image(image) if image.width() == 0 || image.height() == 0 => Err(
                Error::Configuration("background image is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    fn load(&self) -> Result<Arc<RgbaImage>> {
        let path = match self {
            BackgroundImage::Image(image) => return Ok(Arc::clone(image)),
            BackgroundImage::Path(path) => path.clone(),
            BackgroundImage::Url(url) => file_url_path(url)
                .map(PathBuf::from)
                .ok_or_else(|| Error::Configuration(format!("unsupported background image URL: {url}")))?,
        };

        let image = image::open(&path)?.to_rgba8();
        tracing::debug!(path = %path.display(), width = image.width(), height = image.height(), "background image decoded");
        Ok(Arc::new(image))
    }
}

fn file_url_path(url: &str) -> Option<&str> {
    url.strip_prefix("file://").filter(|path| !path.is_empty())
}

#[derive(Debug, Clone)]
pub struct VirtualBackgroundOptions {
    pub image: BackgroundImage,
}

/// State shared by both processor kinds.
struct Processor {
    name: &'static str,
    kind: StreamKind,
    platform: Platform,
    strategy: Option<Box<dyn BackgroundStrategy>>,
    disposed: bool,
}

impl Processor {
    fn new(name: &'static str, kind: StreamKind, platform: Platform) -> Self {
        Self {
            name,
            kind,
            platform,
            strategy: None,
            disposed: false,
        }
    }

    fn ensure_uninitialized(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed(self.name));
        }
        if self.strategy.is_some() {
            return Err(Error::AlreadyInitialized(self.name));
        }
        Ok(())
    }

    fn active(&self) -> Result<&dyn BackgroundStrategy> {
        if self.disposed {
            return Err(Error::Disposed(self.name));
        }
        self.strategy.as_deref().ok_or(Error::NotInitialized(self.name))
    }

    async fn initialize(&mut self, backdrop: Backdrop) -> Result<()> {
        self.ensure_uninitialized()?;

        let context = StrategyContext {
            devices: Arc::clone(&self.platform.devices),
            engines: Arc::clone(&self.platform.engines),
            config: self.platform.config.clone(),
            backdrop,
            kind: self.kind,
        };
        let mut strategy =
            create_strategy(&self.platform.capabilities, context).ok_or(Error::Unsupported(self.name))?;
        strategy.initialize().await?;

        tracing::info!(processor = self.name, delivery = ?strategy.delivery(), "processor initialized");
        self.strategy = Some(strategy);
        Ok(())
    }

    fn delivery(&self) -> Option<FrameDelivery> {
        self.strategy.as_ref().map(|strategy| strategy.delivery())
    }

    async fn create_processed_stream(&self, options: StreamOptions) -> Result<ProcessedStream> {
        self.active()?.create_processed_stream(options).await
    }

    async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed(self.name));
        }
        let mut strategy = self.strategy.take().ok_or(Error::NotInitialized(self.name))?;
        self.disposed = true;

        strategy.dispose().await?;
        tracing::info!(processor = self.name, "processor disposed");
        Ok(())
    }
}

/// Blurs everything behind the subject.
pub struct BlurBackground {
    processor: Processor,
    radius: f32,
}

impl BlurBackground {
    /// Fails with [`Error::Configuration`] when the blur radius lies outside
    /// the configured range.
    pub fn new(platform: Platform, options: BlurBackgroundOptions) -> Result<Self> {
        let config = &platform.config;
        let radius = options.blur.unwrap_or(config.default_blur);
        if !config.blur_range.contains(&radius) {
            return Err(Error::Configuration(format!(
                "blur is out of range: {}-{}",
                config.blur_range.start(),
                config.blur_range.end()
            )));
        }

        Ok(Self {
            processor: Processor::new("BlurBackground", StreamKind::Blur, platform),
            radius,
        })
    }

    pub fn blur_radius(&self) -> f32 {
        self.radius
    }

    /// The delivery model chosen at `initialize`.
    pub fn delivery(&self) -> Option<FrameDelivery> {
        self.processor.delivery()
    }

    pub async fn initialize(&mut self) -> Result<()> {
        self.processor.initialize(Backdrop::Blur(self.radius)).await
    }

    pub async fn create_processed_stream(&self, options: StreamOptions) -> Result<ProcessedStream> {
        self.processor.create_processed_stream(options).await
    }

    pub async fn dispose(&mut self) -> Result<()> {
        self.processor.dispose().await
    }
}

/// Replaces everything behind the subject with an image.
pub struct VirtualBackground {
    processor: Processor,
    image: BackgroundImage,
}

impl VirtualBackground {
    /// Fails with [`Error::Configuration`] for URLs that do not point at a
    /// local file and for empty images. The image itself is decoded at
    /// `initialize`.
    pub fn new(platform: Platform, options: VirtualBackgroundOptions) -> Result<Self> {
        options.image.validate()?;
        Ok(Self {
            processor: Processor::new("VirtualBackground", StreamKind::VirtualBackground, platform),
            image: options.image,
        })
    }

    pub fn image(&self) -> &BackgroundImage {
        &self.image
    }

    pub fn delivery(&self) -> Option<FrameDelivery> {
        self.processor.delivery()
    }

    pub async fn initialize(&mut self) -> Result<()> {
        self.processor.ensure_uninitialized()?;
        let image = self.image.load()?;
        self.processor.initialize(Backdrop::Image(image)).await
    }

    pub async fn create_processed_stream(&self, options: StreamOptions) -> Result<ProcessedStream> {
        self.processor.create_processed_stream(options).await
    }

    pub async fn dispose(&mut self) -> Result<()> {
        self.processor.dispose().await
    }
}
