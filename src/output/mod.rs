mod loopback;

pub use loopback::{rgba_to_yuyv, LoopbackSink};

use anyhow::{Context, Result};
use image::RgbaImage;

use crate::track::MediaTrack;

/// Somewhere processed frames end up, fed by [`pump_track`].
pub trait OutputSink: Send {
    /// Write one frame, scaling it to [`OutputSink::resolution`] if needed.
    fn write_frame(&mut self, frame: &RgbaImage) -> Result<()>;

    /// Frame size the destination expects.
    fn resolution(&self) -> (u32, u32);
}

/// Drain `track` into `sink` until the track ends. Returns the number of
/// frames written.
pub async fn pump_track<S: OutputSink>(track: &MediaTrack, sink: &mut S) -> Result<u64> {
    let mut reader = track
        .take_reader()
        .context("output track is already being consumed")?;

    let (width, height) = sink.resolution();
    tracing::info!(id = %track.id(), width, height, "pumping track into output");

    let mut written = 0;
    while let Some(frame) = reader.next_frame().await {
        sink.write_frame(frame.image())
            .with_context(|| format!("Failed to write frame at {:?}", frame.timestamp()))?;
        frame.close();
        written += 1;
    }

    tracing::info!(id = %track.id(), frames = written, "output track ended");
    Ok(written)
}
