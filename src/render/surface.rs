use std::borrow::Cow;

use image::{imageops, GrayImage, Rgba, RgbaImage};

use super::blur;
use crate::error::{Error, Result};

/// Porter-Duff rule applied when drawing onto a [`Surface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompositeOp {
    #[default]
    SourceOver,
    /// Keep the source only where the destination is opaque.
    SourceIn,
    /// Draw the source only where nothing has been drawn yet.
    DestinationOver,
}

/// Filter applied to images as they are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Filter {
    #[default]
    None,
    /// Blur with the given standard deviation in pixels.
    Blur(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct DrawState {
    composite: CompositeOp,
    filter: Filter,
}

/// Off-screen RGBA working surface with 2D-canvas drawing semantics: every
/// draw covers the whole surface, scaling the source to fit.
#[derive(Debug, Clone)]
pub struct Surface {
    pixels: RgbaImage,
    state: DrawState,
    saved: Vec<DrawState>,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Geometry(format!(
                "cannot allocate a {}x{} surface",
                width, height
            )));
        }

        Ok(Self {
            pixels: RgbaImage::new(width, height),
            state: DrawState::default(),
            saved: Vec::new(),
        })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn snapshot(&self) -> RgbaImage {
        self.pixels.clone()
    }

    pub fn save(&mut self) {
        self.saved.push(self.state);
    }

    /// Pop the last saved state. Unbalanced restores are ignored.
    pub fn restore(&mut self) {
        if let Some(state) = self.saved.pop() {
            self.state = state;
        }
    }

    pub fn composite(&self) -> CompositeOp {
        self.state.composite
    }

    pub fn set_composite(&mut self, op: CompositeOp) {
        self.state.composite = op;
    }

    pub fn filter(&self) -> Filter {
        self.state.filter
    }

    pub fn set_filter(&mut self, filter: Filter) {
        self.state.filter = filter;
    }

    /// Reset every pixel to transparent black.
    pub fn clear(&mut self) {
        for pixel in self.pixels.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }

    /// Draw `source` across the whole surface under the current state.
    pub fn draw_image(&mut self, source: &RgbaImage) {
        let (width, height) = self.dimensions();
        let scaled = if source.dimensions() == (width, height) {
            Cow::Borrowed(source)
        } else {
            Cow::Owned(imageops::resize(
                source,
                width,
                height,
                imageops::FilterType::Triangle,
            ))
        };

        let filtered = match self.state.filter {
            Filter::Blur(sigma) if sigma > 0.0 => Cow::Owned(imageops::fast_blur(&*scaled, sigma)),
            _ => scaled,
        };

        let op = self.state.composite;
        for (dst, src) in self.pixels.pixels_mut().zip(filtered.pixels()) {
            *dst = blend(op, *src, *dst);
        }
    }

    /// Draw a coverage mask: white wherever the mask is set, with the mask
    /// value as alpha.
    pub fn draw_mask(&mut self, mask: &GrayImage) {
        let coverage = RgbaImage::from_fn(mask.width(), mask.height(), |x, y| {
            Rgba([255, 255, 255, mask.get_pixel(x, y)[0]])
        });
        self.draw_image(&coverage);
    }

    /// Software blur of the colour channels, in place.
    pub fn stack_blur(&mut self, radius: u32) {
        blur::stack_blur_rgb(&mut self.pixels, radius);
    }
}

fn blend(op: CompositeOp, src: Rgba<u8>, dst: Rgba<u8>) -> Rgba<u8> {
    let sa = src[3] as f32 / 255.0;
    let da = dst[3] as f32 / 255.0;

    let (out_a, src_weight, dst_weight) = match op {
        CompositeOp::SourceOver => (sa + da * (1.0 - sa), sa, da * (1.0 - sa)),
        CompositeOp::SourceIn => (sa * da, sa * da, 0.0),
        CompositeOp::DestinationOver => (da + sa * (1.0 - da), sa * (1.0 - da), da),
    };

    if out_a <= f32::EPSILON {
        return Rgba([0, 0, 0, 0]);
    }

    let channel = |i: usize| {
        let value = (src[i] as f32 * src_weight + dst[i] as f32 * dst_weight) / out_a;
        value.round().clamp(0.0, 255.0) as u8
    };

    Rgba([
        channel(0),
        channel(1),
        channel(2),
        (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}
