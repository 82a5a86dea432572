//! Generated camera for headless runs and tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use image::RgbaImage;
use tokio::time::{Instant, MissedTickBehavior};

use super::DeviceAcquisition;
use crate::frame::{FrameBudget, VideoFrame};
use crate::lock;
use crate::track::{MediaTrack, TrackSettings, TrackSink, VideoConstraints};

/// How a synthetic camera emits frames.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePattern {
    /// Free-running at `fps`; frames are dropped while the consumer lags.
    Paced { fps: u32 },
    /// Exactly these timestamps, waiting on the consumer, then the source ends.
    Scripted(Vec<Duration>),
}

#[derive(Debug, Clone, Copy)]
struct Resize {
    after_frames: u64,
    width: u32,
    height: u32,
}

/// Camera that produces gradient frames instead of talking to hardware.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    pattern: FramePattern,
    report_settings: bool,
    resize: Option<Resize>,
    queue_depth: usize,
    budget: FrameBudget,
    unavailable: AtomicBool,
    acquisitions: AtomicUsize,
    tracks: Mutex<Vec<MediaTrack>>,
}

impl SyntheticCamera {
    /// A 30 fps camera whose default geometry is `width` x `height`.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pattern: FramePattern::Paced { fps: 30 },
            report_settings: true,
            resize: None,
            queue_depth: 2,
            budget: FrameBudget::new(8),
            unavailable: AtomicBool::new(false),
            acquisitions: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_pattern(mut self, pattern: FramePattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Switch to `width` x `height` after emitting `after_frames` frames.
    pub fn with_resize(mut self, after_frames: u64, width: u32, height: u32) -> Self {
        self.resize = Some(Resize {
            after_frames,
            width,
            height,
        });
        self
    }

    /// Leave width and height out of the reported track settings.
    pub fn without_settings(mut self) -> Self {
        self.report_settings = false;
        self
    }

    pub fn with_budget(mut self, limit: usize) -> Self {
        self.budget = FrameBudget::new(limit);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Make subsequent acquisitions fail as if no device matched.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Budget shared by every track this camera has produced.
    pub fn budget(&self) -> &FrameBudget {
        &self.budget
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Acquire)
    }

    /// Every track handed out so far, oldest first.
    pub fn tracks(&self) -> Vec<MediaTrack> {
        lock(&self.tracks).clone()
    }
}

#[async_trait]
impl DeviceAcquisition for SyntheticCamera {
    async fn acquire(&self, constraints: &VideoConstraints) -> Result<MediaTrack> {
        if self.unavailable.load(Ordering::Acquire) {
            bail!("no video device matches {:?}", constraints);
        }

        let width = constraints.width.unwrap_or(self.width);
        let height = constraints.height.unwrap_or(self.height);
        let settings = if self.report_settings {
            TrackSettings::sized(width, height)
        } else {
            TrackSettings::default()
        };

        let (track, sink) = MediaTrack::channel("synthetic", settings, self.queue_depth);
        let producer = Producer {
            sink,
            budget: self.budget.clone(),
            geometry: (width, height),
            resize: self.resize,
            report_settings: self.report_settings,
        };
        match self.pattern.clone() {
            FramePattern::Paced { fps } => tokio::spawn(producer.paced(fps)),
            FramePattern::Scripted(timestamps) => tokio::spawn(producer.scripted(timestamps)),
        };

        self.acquisitions.fetch_add(1, Ordering::AcqRel);
        lock(&self.tracks).push(track.clone());
        tracing::debug!(id = %track.id(), width, height, "synthetic camera acquired");
        Ok(track)
    }
}

struct Producer {
    sink: TrackSink,
    budget: FrameBudget,
    geometry: (u32, u32),
    resize: Option<Resize>,
    report_settings: bool,
}

impl Producer {
    async fn paced(self, fps: u32) {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / fps.max(1) as f64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let started = Instant::now();
        let mut index = 0;

        loop {
            tokio::select! {
                _ = self.sink.closed() => break,
                _ = ticker.tick() => {}
            }

            let Some(lease) = self.budget.try_acquire() else {
                tracing::debug!("synthetic camera out of frame budget, skipping frame");
                continue;
            };
            let frame = VideoFrame::new(self.render(index), started.elapsed()).with_lease(lease);
            match self.sink.offer(frame) {
                Ok(_) => index += 1,
                Err(_) => break,
            }
        }
    }

    async fn scripted(self, timestamps: Vec<Duration>) {
        for (index, timestamp) in timestamps.into_iter().enumerate() {
            let lease = tokio::select! {
                _ = self.sink.closed() => return,
                lease = self.budget.acquire() => lease,
            };
            let frame = VideoFrame::new(self.render(index as u64), timestamp).with_lease(lease);
            if self.sink.send(frame).await.is_err() {
                return;
            }
        }
        tracing::debug!("synthetic script finished");
    }

    fn render(&self, index: u64) -> RgbaImage {
        let (width, height) = match self.resize {
            Some(resize) if index >= resize.after_frames => (resize.width, resize.height),
            _ => self.geometry,
        };

        if self.report_settings {
            let settings = self.sink.track().settings();
            if settings.width != Some(width) || settings.height != Some(height) {
                self.sink.update_settings(TrackSettings::sized(width, height));
            }
        }

        gradient(width, height, index)
    }
}

/// Gradient test pattern that shifts with the frame index.
fn gradient(width: u32, height: u32, index: u64) -> RgbaImage {
    let shift = index as u8;
    RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([
            ((x * 255 / width.max(1)) as u8).wrapping_add(shift),
            ((y * 255 / height.max(1)) as u8).wrapping_add(shift),
            128,
            255,
        ])
    })
}
