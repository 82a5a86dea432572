use super::OutputSink;
use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::RgbaImage;
use std::borrow::Cow;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Writes frames to a v4l2loopback device as raw YUYV
///
/// Any writer works; [`LoopbackSink::open`] opens the device file directly,
/// since v4l2loopback accepts raw frame data written to it.
pub struct LoopbackSink<W: Write = File> {
    writer: W,
    width: u32,
    height: u32,
}

impl LoopbackSink<File> {
    pub fn open<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(path = %path.display(), width, height, "Opening v4l2loopback device");

        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        Ok(Self::new(file, width, height))
    }
}

impl<W: Write> LoopbackSink<W> {
    pub fn new(writer: W, width: u32, height: u32) -> Self {
        Self {
            writer,
            width,
            height,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Convert an RGBA frame to YUV422 (YUYV), dropping alpha
///
/// Full-range BT.601 in 8.8 fixed point. Each pixel pair shares the chroma
/// of its averaged colour; an odd last column is paired with itself.
pub fn rgba_to_yuyv(image: &RgbaImage) -> Vec<u8> {
    let (width, height) = image.dimensions();
    let mut yuyv = Vec::with_capacity((width.div_ceil(2) * 4 * height) as usize);

    for row in image.rows() {
        let pixels: Vec<[i32; 3]> = row.map(|p| [p[0] as i32, p[1] as i32, p[2] as i32]).collect();
        for pair in pixels.chunks(2) {
            let left = pair[0];
            let right = pair.get(1).copied().unwrap_or(left);
            let mean = [0, 1, 2].map(|c| (left[c] + right[c] + 1) / 2);
            let (u, v) = chroma(mean);
            yuyv.extend_from_slice(&[luma(left), u, luma(right), v]);
        }
    }

    yuyv
}

fn luma([r, g, b]: [i32; 3]) -> u8 {
    ((77 * r + 150 * g + 29 * b + 128) >> 8).clamp(0, 255) as u8
}

fn chroma([r, g, b]: [i32; 3]) -> (u8, u8) {
    let u = ((-43 * r - 85 * g + 128 * b + 128) >> 8) + 128;
    let v = ((128 * r - 107 * g - 21 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

impl<W: Write + Send> OutputSink for LoopbackSink<W> {
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
        let frame = if frame.dimensions() != (self.width, self.height) {
            Cow::Owned(image::imageops::resize(
                frame,
                self.width,
                self.height,
                FilterType::Triangle,
            ))
        } else {
            Cow::Borrowed(frame)
        };

        self.writer
            .write_all(&rgba_to_yuyv(&frame))
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
