//! Live media tracks.
//!
//! A [`MediaTrack`] is a cloneable handle onto one stream of frames. The
//! producer side pushes frames through a [`TrackSink`]; a single consumer takes
//! the [`TrackReader`] once. Stopping a track ends it for every holder.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::VideoFrame;
use crate::lock;

/// Geometry a track reports about itself. Sources may leave fields unset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
}

impl TrackSettings {
    pub fn sized(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            frame_rate: None,
        }
    }
}

/// What a caller asks of a camera. Every field is an ideal hint that devices
/// honour as closely as they can, so the decoded geometry may differ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    /// Device index, first available device when unset.
    pub device: Option<u32>,
}

impl VideoConstraints {
    pub fn ideal(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Live,
    Ended,
}

struct TrackInner {
    id: Uuid,
    label: String,
    settings: Mutex<TrackSettings>,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    reader: Mutex<Option<TrackReader>>,
}

/// Handle onto a live video track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a track together with the sink that feeds it. At most `depth`
    /// frames wait between producer and consumer.
    pub fn channel(label: impl Into<String>, settings: TrackSettings, depth: usize) -> (Self, TrackSink) {
        let (frames_tx, frames_rx) = mpsc::channel(depth.max(1));
        let (ended_tx, ended_rx) = watch::channel(false);

        let track = Self {
            inner: Arc::new_cyclic(|inner| TrackInner {
                id: Uuid::new_v4(),
                label: label.into(),
                settings: Mutex::new(settings),
                enabled: AtomicBool::new(true),
                ended: ended_tx,
                reader: Mutex::new(Some(TrackReader {
                    frames: frames_rx,
                    ended: ended_rx,
                    track: inner.clone(),
                })),
            }),
        };

        tracing::debug!(id = %track.id(), label = track.label(), "track created");

        let sink = TrackSink {
            frames: frames_tx,
            track: track.clone(),
        };
        (track, sink)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn settings(&self) -> TrackSettings {
        *lock(&self.inner.settings)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// A disabled track stays live but its sink discards every frame.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
        tracing::debug!(id = %self.id(), enabled, "track enabled changed");
    }

    /// End the track. Idempotent.
    pub fn stop(&self) {
        let was_ended = self.inner.ended.send_replace(true);
        if !was_ended {
            tracing::debug!(id = %self.id(), label = self.label(), "track stopped");
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        if *self.inner.ended.borrow() {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }

    /// Resolves once the track has been stopped.
    pub async fn ended(&self) {
        let mut ended = self.inner.ended.subscribe();
        let _ = ended.wait_for(|ended| *ended).await;
    }

    /// Take the frame reader. Only the first caller gets it.
    pub fn take_reader(&self) -> Option<TrackReader> {
        lock(&self.inner.reader).take()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

/// Producer side of a track.
pub struct TrackSink {
    frames: mpsc::Sender<VideoFrame>,
    track: MediaTrack,
}

impl TrackSink {
    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    /// True once the track has ended or its reader has gone away.
    pub fn is_closed(&self) -> bool {
        self.track.ready_state() == ReadyState::Ended || self.frames.is_closed()
    }

    /// Resolves once [`TrackSink::is_closed`] becomes true.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.track.ended() => {}
            _ = self.frames.closed() => {}
        }
    }

    /// Replace the settings the track reports, e.g. after a resolution change.
    pub fn update_settings(&self, settings: TrackSettings) {
        *lock(&self.track.inner.settings) = settings;
    }

    /// Deliver a frame, waiting for the consumer to make room.
    ///
    /// Frames sent to a disabled track are dropped.
    pub async fn send(&self, frame: VideoFrame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::OutputClosed);
        }
        if !self.track.is_enabled() {
            frame.close();
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = self.track.ended() => Err(Error::OutputClosed),
            sent = self.frames.send(frame) => sent.map_err(|_| Error::OutputClosed),
        }
    }

    /// Deliver a frame without waiting. Returns `Ok(false)` when the frame
    /// was dropped because the consumer is behind.
    pub fn offer(&self, frame: VideoFrame) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::OutputClosed);
        }
        if !self.track.is_enabled() {
            return Ok(false);
        }

        match self.frames.try_send(frame) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::OutputClosed),
        }
    }
}

/// Consumer side of a track.
pub struct TrackReader {
    frames: mpsc::Receiver<VideoFrame>,
    ended: watch::Receiver<bool>,
    track: Weak<TrackInner>,
}

impl TrackReader {
    /// Next frame, or `None` once the track has ended.
    ///
    /// When the producer drops its sink, frames already queued are still
    /// delivered and the track ends after the last one.
    pub async fn next_frame(&mut self) -> Option<VideoFrame> {
        if *self.ended.borrow() {
            return None;
        }

        let frame = tokio::select! {
            biased;
            _ = self.ended.wait_for(|ended| *ended) => None,
            frame = self.frames.recv() => frame,
        };
        if frame.is_none() {
            self.finish();
        }
        frame
    }

    fn finish(&self) {
        if let Some(inner) = self.track.upgrade() {
            if !inner.ended.send_replace(true) {
                tracing::debug!(id = %inner.id, label = %inner.label, "track ended by its producer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use std::time::Duration;

    fn frame(ms: u64) -> VideoFrame {
        VideoFrame::new(RgbaImage::new(2, 2), Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn frames_flow_in_order() {
        let (track, sink) = MediaTrack::channel("test", TrackSettings::sized(2, 2), 4);
        let mut reader = track.take_reader().unwrap();
        assert!(track.take_reader().is_none());

        sink.send(frame(1)).await.unwrap();
        sink.send(frame(2)).await.unwrap();

        assert_eq!(reader.next_frame().await.unwrap().timestamp(), Duration::from_millis(1));
        assert_eq!(reader.next_frame().await.unwrap().timestamp(), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn stop_ends_reader_and_sink() {
        let (track, sink) = MediaTrack::channel("test", TrackSettings::default(), 1);
        let mut reader = track.take_reader().unwrap();

        track.stop();
        track.stop();
        assert_eq!(track.ready_state(), ReadyState::Ended);
        assert!(reader.next_frame().await.is_none());
        assert!(matches!(sink.send(frame(1)).await, Err(Error::OutputClosed)));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn disabled_track_drops_frames() {
        let (track, sink) = MediaTrack::channel("test", TrackSettings::default(), 1);
        let mut reader = track.take_reader().unwrap();

        track.set_enabled(false);
        sink.send(frame(1)).await.unwrap();
        assert!(!sink.offer(frame(2)).unwrap());

        track.set_enabled(true);
        assert!(sink.offer(frame(3)).unwrap());
        assert_eq!(reader.next_frame().await.unwrap().timestamp(), Duration::from_millis(3));
    }

    #[tokio::test]
    async fn offer_drops_when_full() {
        let (track, sink) = MediaTrack::channel("test", TrackSettings::default(), 1);
        let _reader = track.take_reader().unwrap();

        assert!(sink.offer(frame(1)).unwrap());
        assert!(!sink.offer(frame(2)).unwrap());
    }

    #[tokio::test]
    async fn dropped_sink_drains_then_ends() {
        let (track, sink) = MediaTrack::channel("test", TrackSettings::default(), 2);
        let mut reader = track.take_reader().unwrap();

        sink.send(frame(1)).await.unwrap();
        sink.send(frame(2)).await.unwrap();
        drop(sink);

        assert_eq!(track.ready_state(), ReadyState::Live);
        assert_eq!(reader.next_frame().await.unwrap().timestamp(), Duration::from_millis(1));
        assert_eq!(reader.next_frame().await.unwrap().timestamp(), Duration::from_millis(2));
        assert!(reader.next_frame().await.is_none());
        assert_eq!(track.ready_state(), ReadyState::Ended);
    }

    #[test]
    fn settings_update_is_visible_to_holders() {
        let (track, sink) = MediaTrack::channel("test", TrackSettings::sized(640, 480), 1);
        sink.update_settings(TrackSettings::sized(1280, 720));
        assert_eq!(track.settings().width, Some(1280));
        assert_eq!(track.settings().height, Some(720));
    }

    #[test]
    fn clones_compare_equal() {
        let (a, _sink_a) = MediaTrack::channel("a", TrackSettings::default(), 1);
        let (b, _sink_b) = MediaTrack::channel("b", TrackSettings::default(), 1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }
}
