use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::{cancelled, track_label, BackgroundStrategy, FrameDelivery, Lifecycle, StrategyContext};
use crate::error::{Error, Result};
use crate::frame::VideoFrame;
use crate::lock;
use crate::processed_stream::{PipelineHooks, ProcessedStream, StreamOptions};
use crate::render::{BlurBackend, Compositor, Surface};
use crate::segmentation::SegmentationAdapter;
use crate::track::{MediaTrack, TrackReader, TrackSettings, TrackSink};

const NAME: &str = "StreamStrategy";

/// Push delivery: source frames flow through a transform into a generated
/// output track.
///
/// Each frame waits for its segmentation round-trip before the next one is
/// read, so the source is throttled to segmentation throughput. One pipeline
/// runs at a time: starting another halts the one before it.
pub struct StreamStrategy {
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
}

struct Shared {
    adapter: Arc<SegmentationAdapter>,
    context: StrategyContext,
    /// Aborts every pipeline this strategy started.
    shutdown: watch::Sender<bool>,
    /// The pipeline currently feeding the adapter.
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

/// Output surface and compositor, shared between the transform and the
/// segmentation callback that renders into them.
struct Stage {
    output: Surface,
    compositor: Compositor,
}

struct Session {
    id: u64,
    source: MediaTrack,
    output: MediaTrack,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Session {
    /// Stop the pipeline with its source and output, and wait until the
    /// pipeline task has let go of the adapter.
    async fn halt(self) {
        self.stop.send_replace(true);
        self.source.stop();
        self.output.stop();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(session = self.id, "stream pipeline panicked");
            }
        }
        tracing::debug!(session = self.id, source = %self.source.id(), "stream pipeline halted");
    }
}

impl StreamStrategy {
    pub fn new(context: StrategyContext) -> Self {
        let adapter = SegmentationAdapter::new(Arc::clone(&context.engines), context.config.segmentation.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                adapter: Arc::new(adapter),
                context,
                shutdown,
                session: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
            lifecycle: Lifecycle::Uninitialized,
        }
    }
}

impl Shared {
    /// Wire `source` through a new transform and return the generated track
    /// with the id of its session. Any pipeline already running is halted
    /// first.
    async fn start_pipeline(&self, source: MediaTrack) -> Result<(MediaTrack, u64)> {
        let settings = source.settings();
        let (Some(width), Some(height)) = (settings.width, settings.height) else {
            return Err(Error::Geometry(format!(
                "track {} does not report a width and height",
                source.id()
            )));
        };

        let raw = Surface::new(width, height)?;
        let stage = Arc::new(Mutex::new(Stage {
            output: Surface::new(width, height)?,
            compositor: Compositor::new(&self.context.backdrop, BlurBackend::Filter, width, height)?,
        }));
        let reader = source
            .take_reader()
            .ok_or_else(|| Error::Acquisition(anyhow!("track {} is already being consumed", source.id())))?;

        let previous = lock(&self.session).take();
        if let Some(previous) = previous {
            tracing::info!(session = previous.id, "superseding running stream pipeline");
            previous.halt().await;
        }

        let render_target = Arc::clone(&stage);
        self.adapter.set_result_callback(move |result| {
            let mut stage = lock(&render_target);
            let Stage { output, compositor } = &mut *stage;
            if let Err(e) = compositor.render(&result, output) {
                tracing::warn!(error = %e, "dropping segmentation result");
            }
        });

        let (output, sink) = MediaTrack::channel(
            track_label(self.context.kind),
            TrackSettings {
                frame_rate: settings.frame_rate,
                ..TrackSettings::sized(width, height)
            },
            self.context.config.frame_queue_depth,
        );
        let (stop, stop_rx) = watch::channel(false);

        let pipeline = Pipeline {
            reader,
            raw,
            stage,
            adapter: Arc::clone(&self.adapter),
            sink,
        };
        let task = tokio::spawn(pipeline.run(stop_rx, self.shutdown.subscribe()));

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            session = id,
            source = %source.id(),
            output = %output.id(),
            width,
            height,
            "stream pipeline started"
        );
        let superseded = lock(&self.session).replace(Session {
            id,
            source,
            output: output.clone(),
            stop,
            task,
        });
        if let Some(superseded) = superseded {
            superseded.halt().await;
        }
        Ok((output, id))
    }

    /// Halt the running pipeline if it is `id`'s, or whichever runs when
    /// `id` is `None`.
    async fn end_session(&self, id: Option<u64>) {
        let session = {
            let mut current = lock(&self.session);
            let matches = current
                .as_ref()
                .is_some_and(|session| id.map_or(true, |id| id == session.id));
            if matches {
                current.take()
            } else {
                None
            }
        };
        if let Some(session) = session {
            session.halt().await;
        }
    }
}

struct Pipeline {
    reader: TrackReader,
    raw: Surface,
    stage: Arc<Mutex<Stage>>,
    adapter: Arc<SegmentationAdapter>,
    sink: TrackSink,
}

impl Pipeline {
    async fn run(mut self, mut stop: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        let mut emitted: u64 = 0;

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancelled(&mut stop) => break,
                _ = cancelled(&mut shutdown) => break,
                frame = self.reader.next_frame() => frame,
            };
            let Some(frame) = frame else {
                tracing::debug!("source track ended");
                break;
            };

            let step = tokio::select! {
                biased;
                _ = cancelled(&mut stop) => break,
                _ = cancelled(&mut shutdown) => break,
                step = self.step(frame) => step,
            };
            match step {
                Ok(()) => emitted += 1,
                Err(Error::OutputClosed) => {
                    tracing::debug!("output track closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "stream pipeline aborted");
                    break;
                }
            }
        }

        // Dropping the sink ends the output track once its queue drains.
        tracing::info!(frames = emitted, "stream pipeline finished");
    }

    /// Transform one frame and emit it. The input frame is released before
    /// the output is sent, whatever the outcome.
    async fn step(&mut self, frame: VideoFrame) -> Result<()> {
        let timestamp = frame.timestamp();
        let transformed = self
            .transform(&frame)
            .instrument(tracing::debug_span!("transform", ?timestamp))
            .await;
        frame.close();

        let output = transformed.map_err(|e| Error::Transform(format!("frame at {timestamp:?}: {e}")))?;
        self.sink.send(output).await
    }

    async fn transform(&mut self, frame: &VideoFrame) -> Result<VideoFrame> {
        self.raw.draw_image(frame.image());
        self.adapter.send(self.raw.pixels()).await?;

        let composed = lock(&self.stage).output.snapshot();
        Ok(VideoFrame::new(composed, frame.timestamp()))
    }
}

/// Rebuilds or tears down the pipeline behind one processed stream.
struct StreamHooks {
    shared: Weak<Shared>,
    /// Session serving this stream; superseded sessions no longer match.
    session: AtomicU64,
}

#[async_trait]
impl PipelineHooks for StreamHooks {
    async fn replace_source(&self, source: MediaTrack) -> Result<MediaTrack> {
        let Some(shared) = self.shared.upgrade().filter(|shared| !*shared.shutdown.borrow()) else {
            source.stop();
            return Err(Error::Disposed(NAME));
        };
        shared.end_session(Some(self.session.load(Ordering::Acquire))).await;

        match shared.start_pipeline(source.clone()).await {
            Ok((output, id)) => {
                self.session.store(id, Ordering::Release);
                Ok(output)
            }
            Err(e) => {
                source.stop();
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if let Some(shared) = self.shared.upgrade() {
            shared.end_session(Some(self.session.load(Ordering::Acquire))).await;
        }
        Ok(())
    }
}

#[async_trait]
impl BackgroundStrategy for StreamStrategy {
    fn delivery(&self) -> FrameDelivery {
        FrameDelivery::Stream
    }

    async fn initialize(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Initialized => return Err(Error::AlreadyInitialized(NAME)),
            Lifecycle::Disposed => return Err(Error::Disposed(NAME)),
            Lifecycle::Uninitialized => {}
        }

        self.shared.adapter.initialize().await?;
        self.lifecycle = Lifecycle::Initialized;
        tracing::info!(kind = ?self.shared.context.kind, "stream strategy initialized");
        Ok(())
    }

    async fn create_processed_stream(&self, options: StreamOptions) -> Result<ProcessedStream> {
        self.lifecycle.require_initialized(NAME)?;

        let context = &self.shared.context;
        let source = context
            .devices
            .acquire(&options.constraints)
            .await
            .map_err(Error::Acquisition)?;

        let (output, session) = match self.shared.start_pipeline(source.clone()).await {
            Ok(started) => started,
            Err(e) => {
                source.stop();
                return Err(e);
            }
        };

        let hooks = StreamHooks {
            shared: Arc::downgrade(&self.shared),
            session: AtomicU64::new(session),
        };
        Ok(ProcessedStream::new(
            output,
            context.kind,
            options,
            Arc::clone(&context.devices),
            Box::new(hooks),
        ))
    }

    async fn dispose(&mut self) -> Result<()> {
        self.lifecycle.require_initialized(NAME)?;

        self.shared.shutdown.send_replace(true);
        self.shared.end_session(None).await;
        self.lifecycle = Lifecycle::Disposed;
        self.shared.adapter.dispose().await?;
        tracing::info!("stream strategy disposed");
        Ok(())
    }
}
