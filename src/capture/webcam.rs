use super::DeviceAcquisition;
use crate::frame::{FrameBudget, VideoFrame};
use crate::track::{MediaTrack, TrackSettings, TrackSink, VideoConstraints};
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::buffer::ConvertBuffer;
use image::RgbaImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use std::time::Instant;
use tokio::sync::oneshot;

/// Webcams opened through nokhwa
///
/// Each acquisition opens the camera on its own capture thread, which keeps
/// pumping decoded frames into the track until the track is stopped.
pub struct WebcamDevices {
    queue_depth: usize,
    budget_limit: usize,
}

impl WebcamDevices {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth,
            budget_limit: queue_depth + 2,
        }
    }
}

#[async_trait]
impl DeviceAcquisition for WebcamDevices {
    async fn acquire(&self, constraints: &VideoConstraints) -> Result<MediaTrack> {
        let constraints = constraints.clone();
        let depth = self.queue_depth;
        let budget = FrameBudget::new(self.budget_limit);
        let (opened_tx, opened_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("webcam-capture".to_string())
            .spawn(move || {
                let camera = match open_camera(&constraints) {
                    Ok(camera) => camera,
                    Err(e) => {
                        let _ = opened_tx.send(Err(e));
                        return;
                    }
                };
                let format = camera.camera_format();
                let settings = TrackSettings {
                    width: Some(format.resolution().width()),
                    height: Some(format.resolution().height()),
                    frame_rate: Some(format.frame_rate() as f64),
                };
                let (track, sink) = MediaTrack::channel("webcam", settings, depth);
                if opened_tx.send(Ok(track)).is_err() {
                    return;
                }
                capture_loop(camera, sink, budget);
            })
            .context("Failed to spawn capture thread")?;

        opened_rx.await.context("Capture thread exited before opening the camera")?
    }
}

fn open_camera(constraints: &VideoConstraints) -> Result<Camera> {
    let index = CameraIndex::Index(constraints.device.unwrap_or(0));
    let requested = match (constraints.width, constraints.height) {
        (Some(width), Some(height)) => {
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(CameraFormat::new(
                Resolution::new(width, height),
                FrameFormat::MJPEG,
                constraints.frame_rate.unwrap_or(30),
            )))
        }
        _ => RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution),
    };

    tracing::info!(
        device = ?index,
        width = ?constraints.width,
        height = ?constraints.height,
        "Opening webcam"
    );

    let mut camera = Camera::new(index, requested).context("Failed to open camera")?;
    camera.open_stream().context("Failed to open camera stream")?;

    tracing::info!(format = %camera.camera_format(), "Webcam initialized successfully");
    Ok(camera)
}

fn capture_loop(mut camera: Camera, sink: TrackSink, budget: FrameBudget) {
    let started = Instant::now();

    while !sink.is_closed() {
        let buffer = match camera.frame() {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to capture frame");
                break;
            }
        };

        let Some(lease) = budget.try_acquire() else {
            tracing::debug!("frame budget exhausted, dropping frame");
            continue;
        };

        let decoded = match buffer.decode_image::<RgbFormat>() {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode frame");
                continue;
            }
        };
        let rgba: RgbaImage = decoded.convert();

        let (width, height) = rgba.dimensions();
        let settings = sink.track().settings();
        if settings.width != Some(width) || settings.height != Some(height) {
            sink.update_settings(TrackSettings {
                width: Some(width),
                height: Some(height),
                ..settings
            });
        }

        let frame = VideoFrame::new(rgba, started.elapsed()).with_lease(lease);
        if sink.offer(frame).is_err() {
            break;
        }
    }

    if let Err(e) = camera.stop_stream() {
        tracing::warn!(error = %e, "Failed to stop camera stream");
    }
    sink.track().stop();
    tracing::info!("Webcam capture stopped");
}
