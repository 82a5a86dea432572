//! The processed output track and its enable/disable/dispose lifecycle.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::capture::DeviceAcquisition;
use crate::error::{Error, Result};
use crate::track::{MediaTrack, VideoConstraints};

/// Called with the new output track after a replacement pipeline is live.
pub type UpdateTrackCallback = Arc<dyn Fn(MediaTrack) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Called after the output track and its pipeline have been stopped.
pub type StopTrackCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Blur,
    VirtualBackground,
}

/// Options for [`crate::BlurBackground::create_processed_stream`] and
/// [`crate::VirtualBackground::create_processed_stream`].
#[derive(Clone, Default)]
pub struct StreamOptions {
    /// Disabling stops the camera outright; enabling reacquires it.
    pub stop_track_when_disabled: bool,
    pub constraints: VideoConstraints,
    pub on_update_track: Option<UpdateTrackCallback>,
    pub on_stop_track: Option<StopTrackCallback>,
}

impl StreamOptions {
    pub fn stop_track_when_disabled(mut self, stop: bool) -> Self {
        self.stop_track_when_disabled = stop;
        self
    }

    pub fn constraints(mut self, constraints: VideoConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn on_update_track<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(MediaTrack) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_update_track = Some(Arc::new(move |track| callback(track).boxed()));
        self
    }

    pub fn on_stop_track<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_stop_track = Some(Arc::new(move || callback().boxed()));
        self
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("stop_track_when_disabled", &self.stop_track_when_disabled)
            .field("constraints", &self.constraints)
            .field("on_update_track", &self.on_update_track.is_some())
            .field("on_stop_track", &self.on_stop_track.is_some())
            .finish()
    }
}

/// How a stream reaches back into the pipeline that produced it.
#[async_trait]
pub(crate) trait PipelineHooks: Send + Sync {
    /// Rebuild the pipeline around a freshly acquired source and return the
    /// new output track once it is live.
    async fn replace_source(&self, source: MediaTrack) -> Result<MediaTrack>;

    /// Tear the pipeline down and release its source. Idempotent.
    async fn stop(&self) -> Result<()>;
}

/// Owns the processed output track.
///
/// `track()` is `Some` from construction until [`ProcessedStream::dispose`].
pub struct ProcessedStream {
    track: Option<MediaTrack>,
    kind: StreamKind,
    options: StreamOptions,
    enabled: bool,
    devices: Arc<dyn DeviceAcquisition>,
    hooks: Box<dyn PipelineHooks>,
}

impl ProcessedStream {
    pub(crate) fn new(
        track: MediaTrack,
        kind: StreamKind,
        options: StreamOptions,
        devices: Arc<dyn DeviceAcquisition>,
        hooks: Box<dyn PipelineHooks>,
    ) -> Self {
        tracing::info!(id = %track.id(), ?kind, "processed stream created");
        Self {
            track: Some(track),
            kind,
            options,
            enabled: true,
            devices,
            hooks,
        }
    }

    pub fn track(&self) -> Option<&MediaTrack> {
        self.track.as_ref()
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable the stream.
    ///
    /// With `stop_track_when_disabled` the camera is stopped on disable and
    /// reacquired on enable, which replaces the output track. Otherwise the
    /// track is only muted. Repeating the current state does nothing, and a
    /// disposed stream only logs a warning.
    pub async fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        let Some(track) = self.track.as_ref() else {
            tracing::warn!("processed stream is already disposed");
            return Ok(());
        };
        if enabled == self.enabled {
            return Ok(());
        }

        if !self.options.stop_track_when_disabled {
            track.set_enabled(enabled);
            self.enabled = enabled;
            tracing::debug!(enabled, "processed stream muted state changed");
            return Ok(());
        }

        if enabled {
            let source = self
                .devices
                .acquire(&self.options.constraints)
                .await
                .map_err(Error::Acquisition)?;
            let output = self.hooks.replace_source(source).await?;
            tracing::info!(id = %output.id(), "processed stream resumed with a new track");
            self.track = Some(output.clone());
            self.enabled = true;

            if let Some(callback) = &self.options.on_update_track {
                callback(output).await.map_err(Error::Callback)?;
            }
            Ok(())
        } else {
            track.stop();
            self.enabled = false;
            tracing::info!("processed stream stopped its track");
            self.hooks.stop().await?;
            self.notify_stopped().await
        }
    }

    /// Stop the output track and tear down its pipeline.
    ///
    /// `on_stop_track` runs on every call; after the first there is nothing
    /// left to stop.
    pub async fn dispose(&mut self) -> Result<()> {
        match self.track.take() {
            Some(track) => {
                track.stop();
                tracing::info!(id = %track.id(), "processed stream disposed");
                self.hooks.stop().await?;
            }
            None => tracing::debug!("processed stream already disposed"),
        }
        self.notify_stopped().await
    }

    async fn notify_stopped(&self) -> Result<()> {
        match &self.options.on_stop_track {
            Some(callback) => callback().await.map_err(Error::Callback),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ProcessedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedStream")
            .field("track", &self.track)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("options", &self.options)
            .finish()
    }
}
