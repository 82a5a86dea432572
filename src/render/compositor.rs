use std::sync::Arc;

use image::RgbaImage;

use super::surface::{CompositeOp, Filter, Surface};
use crate::error::{Error, Result};
use crate::segmentation::SegmentationResult;

/// What replaces the area behind the subject.
#[derive(Debug, Clone)]
pub enum Backdrop {
    /// The camera image itself, blurred by this radius in pixels.
    Blur(f32),
    /// A static image, scaled to the frame.
    Image(Arc<RgbaImage>),
}

/// How a blurred background gets produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurBackend {
    /// The surface blur filter, applied while drawing.
    Filter,
    /// A software blur into an auxiliary surface before compositing.
    Software,
}

/// Draws the background layer of a composite.
trait BackgroundPainter: Send {
    /// Work done before the composite starts.
    fn prepare(&mut self, _source: &RgbaImage) {}

    /// Draw the background with destination-over compositing already set.
    fn paint(&self, ctx: &mut Surface, source: &RgbaImage);
}

struct FilterBlur {
    radius: f32,
}

impl BackgroundPainter for FilterBlur {
    fn paint(&self, ctx: &mut Surface, source: &RgbaImage) {
        ctx.set_filter(Filter::Blur(self.radius));
        ctx.draw_image(source);
        ctx.set_filter(Filter::None);
    }
}

struct SoftwareBlur {
    radius: u32,
    scratch: Surface,
}

impl BackgroundPainter for SoftwareBlur {
    fn prepare(&mut self, source: &RgbaImage) {
        self.scratch.draw_image(source);
        self.scratch.stack_blur(self.radius);
    }

    fn paint(&self, ctx: &mut Surface, _source: &RgbaImage) {
        ctx.draw_image(self.scratch.pixels());
    }
}

struct StaticImage {
    image: Arc<RgbaImage>,
}

impl BackgroundPainter for StaticImage {
    fn paint(&self, ctx: &mut Surface, _source: &RgbaImage) {
        ctx.draw_image(&self.image);
    }
}

/// Composes a segmentation result over a background into an output surface.
pub struct Compositor {
    painter: Box<dyn BackgroundPainter>,
    width: u32,
    height: u32,
}

impl Compositor {
    /// Build a compositor for `width` x `height` output. The software blur
    /// back-end allocates its auxiliary surface at the same size.
    pub fn new(backdrop: &Backdrop, blur: BlurBackend, width: u32, height: u32) -> Result<Self> {
        let painter: Box<dyn BackgroundPainter> = match (backdrop, blur) {
            (Backdrop::Blur(radius), BlurBackend::Filter) => Box::new(FilterBlur { radius: *radius }),
            (Backdrop::Blur(radius), BlurBackend::Software) => Box::new(SoftwareBlur {
                radius: radius.round().max(1.0) as u32,
                scratch: Surface::new(width, height)?,
            }),
            (Backdrop::Image(image), _) => Box::new(StaticImage {
                image: Arc::clone(image),
            }),
        };

        tracing::debug!(width, height, ?blur, "compositor created");

        Ok(Self {
            painter,
            width,
            height,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Compose `result` into `ctx`.
    ///
    /// Fails with a geometry error when the result or the surface was sized
    /// for a different frame geometry than this compositor.
    pub fn render(&mut self, result: &SegmentationResult, ctx: &mut Surface) -> Result<()> {
        let size = self.dimensions();
        if ctx.dimensions() != size || result.dimensions() != size {
            return Err(Error::Geometry(format!(
                "compositor is {}x{} but surface is {:?} and result is {:?}",
                size.0,
                size.1,
                ctx.dimensions(),
                result.dimensions()
            )));
        }

        self.painter.prepare(result.image());

        ctx.save();
        ctx.clear();
        render_foreground(ctx, result);
        ctx.set_composite(CompositeOp::DestinationOver);
        self.painter.paint(ctx, result.image());
        ctx.restore();

        Ok(())
    }
}

/// Subject silhouette: the mask, then the source image kept only under it.
fn render_foreground(ctx: &mut Surface, result: &SegmentationResult) {
    ctx.draw_mask(result.mask());
    ctx.set_composite(CompositeOp::SourceIn);
    ctx.draw_image(result.image());
}
