use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use image::RgbaImage;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::track::MediaTrack;

/// The frame a playback element is currently showing.
#[derive(Debug, Clone)]
pub(crate) struct DecodedFrame {
    pub image: Arc<RgbaImage>,
    pub timestamp: Duration,
}

impl DecodedFrame {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Plays a source track, always exposing its most recent decoded frame.
///
/// Source frames are released as soon as they have been decoded; a consumer
/// that falls behind simply sees the latest one.
pub(crate) struct PlaybackElement {
    current: watch::Receiver<Option<DecodedFrame>>,
    decoder: JoinHandle<()>,
}

impl PlaybackElement {
    /// Bind `source` and start playing. Resolves once the first frame has
    /// been decoded.
    pub async fn play(source: &MediaTrack) -> Result<Self> {
        let mut reader = source
            .take_reader()
            .ok_or_else(|| Error::Acquisition(anyhow!("track {} is already being consumed", source.id())))?;
        let (frames, mut current) = watch::channel(None);

        let decoder = tokio::spawn(async move {
            while let Some(frame) = reader.next_frame().await {
                let decoded = DecodedFrame {
                    image: frame.shared_image(),
                    timestamp: frame.timestamp(),
                };
                frame.close();
                if frames.send(Some(decoded)).is_err() {
                    break;
                }
            }
            tracing::debug!("playback source ended");
        });

        if current.wait_for(Option::is_some).await.is_err() {
            return Err(Error::Geometry(format!(
                "track {} ended before its first frame was decoded",
                source.id()
            )));
        }

        Ok(Self { current, decoder })
    }

    /// Size of the frame being shown.
    pub fn dimensions(&self) -> (u32, u32) {
        self.current
            .borrow()
            .as_ref()
            .map_or((0, 0), DecodedFrame::dimensions)
    }

    /// Wait for the next decoded frame. `None` once the source has ended.
    pub async fn next_frame(&mut self) -> Option<DecodedFrame> {
        self.current.changed().await.ok()?;
        self.current.borrow_and_update().clone()
    }
}

impl Drop for PlaybackElement {
    fn drop(&mut self) {
        self.decoder.abort();
    }
}
