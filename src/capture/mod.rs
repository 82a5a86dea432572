#[cfg(feature = "camera")]
mod webcam;
mod synthetic;

pub use synthetic::{FramePattern, SyntheticCamera};
#[cfg(feature = "camera")]
pub use webcam::WebcamDevices;

use anyhow::Result;
use async_trait::async_trait;

use crate::track::{MediaTrack, VideoConstraints};

/// Where processors get their camera tracks from.
///
/// Every processed stream acquires its own source, and acquires again when a
/// stream that stops its camera on disable is re-enabled.
#[async_trait]
pub trait DeviceAcquisition: Send + Sync {
    /// Open a video source matching `constraints` and return its live track.
    ///
    /// Fails when no device can satisfy the request.
    async fn acquire(&self, constraints: &VideoConstraints) -> Result<MediaTrack>;
}
