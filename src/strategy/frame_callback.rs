use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use image::RgbaImage;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::playback::{DecodedFrame, PlaybackElement};
use super::{cancelled, track_label, BackgroundStrategy, FrameDelivery, Lifecycle, StrategyContext};
use crate::error::{Error, Result};
use crate::frame::VideoFrame;
use crate::lock;
use crate::processed_stream::{PipelineHooks, ProcessedStream, StreamOptions};
use crate::render::{Backdrop, BlurBackend, Compositor, Surface};
use crate::segmentation::{ResultSlot, SegmentationAdapter};
use crate::track::{MediaTrack, TrackSettings, TrackSink};

const NAME: &str = "FrameCallbackStrategy";

/// Pull delivery: a render loop runs once per decoded source frame and the
/// output surface is captured into the output track at a fixed rate.
///
/// Segmentation results land in a single-slot mailbox and the loop composites
/// whichever result is newest, which may lag the frame just drawn by one
/// cycle. Output frames repeat when segmentation is slower than capture.
pub struct FrameCallbackStrategy {
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
}

struct Shared {
    adapter: Arc<SegmentationAdapter>,
    latest: ResultSlot,
    context: StrategyContext,
    /// The one live processing session, if any.
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

/// A running render loop and capture loop bound to one source track.
struct Session {
    id: u64,
    source: MediaTrack,
    output: MediaTrack,
    shutdown: watch::Sender<bool>,
    render: JoinHandle<()>,
    capture: JoinHandle<()>,
}

/// The working surfaces of one processing geometry, always replaced as a
/// whole. The compositor owns the third, blur, surface.
struct Workspace {
    raw: Surface,
    output: Surface,
    compositor: Compositor,
}

impl Workspace {
    fn new(backdrop: &Backdrop, width: u32, height: u32) -> Result<Self> {
        Ok(Self {
            raw: Surface::new(width, height)?,
            output: Surface::new(width, height)?,
            compositor: Compositor::new(backdrop, BlurBackend::Software, width, height)?,
        })
    }

    fn dimensions(&self) -> (u32, u32) {
        self.compositor.dimensions()
    }
}

impl FrameCallbackStrategy {
    pub fn new(context: StrategyContext) -> Self {
        let adapter = SegmentationAdapter::new(Arc::clone(&context.engines), context.config.segmentation.clone());
        Self {
            shared: Arc::new(Shared {
                adapter: Arc::new(adapter),
                latest: ResultSlot::new(),
                context,
                session: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
            lifecycle: Lifecycle::Uninitialized,
        }
    }
}

impl Shared {
    /// Play `source`, size the workspace to what was actually decoded and
    /// start the render and capture loops. Whatever session was running is
    /// halted before the new loops start. Returns the output track and the
    /// new session's id.
    async fn setup(&self, source: MediaTrack) -> Result<(MediaTrack, u64)> {
        let playback = PlaybackElement::play(&source).await?;
        let (width, height) = playback.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::Geometry(format!(
                "track {} decoded to {width}x{height}",
                source.id()
            )));
        }
        let workspace = Workspace::new(&self.context.backdrop, width, height)?;

        if let Some(previous) = self.end_session(None).await {
            tracing::info!(session = previous, "superseded running frame callback session");
        }

        let (published, frames) = watch::channel(Arc::new(workspace.output.snapshot()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let fps = self.context.config.capture_fps.max(1);
        let (output, sink) = MediaTrack::channel(
            track_label(self.context.kind),
            TrackSettings {
                frame_rate: Some(fps as f64),
                ..TrackSettings::sized(width, height)
            },
            self.context.config.frame_queue_depth,
        );

        let render_loop = RenderLoop {
            playback,
            workspace,
            adapter: Arc::clone(&self.adapter),
            latest: self.latest.clone(),
            backdrop: self.context.backdrop.clone(),
            published,
        };
        let render = tokio::spawn(render_loop.run(shutdown_rx.clone()));
        let capture = tokio::spawn(capture_output(frames, sink, fps, shutdown_rx));

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let superseded = lock(&self.session).replace(Session {
            id,
            source,
            output: output.clone(),
            shutdown,
            render,
            capture,
        });
        if let Some(superseded) = superseded {
            superseded.halt().await;
        }

        tracing::info!(session = id, output = %output.id(), width, height, fps, "frame callback processing started");
        Ok((output, id))
    }

    /// Cancel the loops of session `id` (or of whichever session runs, for
    /// `None`), stop its source and output, and drop its workspace and any
    /// cached result. Idempotent. Returns the id of the halted session.
    async fn end_session(&self, id: Option<u64>) -> Option<u64> {
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
        let session = session?;
        let id = session.id;
        session.halt().await;
        self.latest.clear();
        Some(id)
    }
}

impl Session {
    async fn halt(self) {
        self.shutdown.send_replace(true);
        self.render.abort();
        self.capture.abort();
        self.source.stop();
        self.output.stop();

        for (task, result) in [("render", self.render.await), ("capture", self.capture.await)] {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!(session = self.id, task, "frame callback task panicked");
                }
            }
        }
        tracing::debug!(session = self.id, source = %self.source.id(), "frame callback processing stopped");
    }
}

struct RenderLoop {
    playback: PlaybackElement,
    workspace: Workspace,
    adapter: Arc<SegmentationAdapter>,
    latest: ResultSlot,
    backdrop: Backdrop,
    published: watch::Sender<Arc<RgbaImage>>,
}

impl RenderLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                frame = self.playback.next_frame() => frame,
            };
            let Some(frame) = frame else {
                tracing::debug!("playback ended, render loop stopping");
                break;
            };

            // A failed frame is logged and the loop moves on to the next one.
            if let Err(e) = self.process(&frame).await {
                tracing::error!(error = %e, timestamp = ?frame.timestamp, "frame processing failed");
            }
        }
    }

    async fn process(&mut self, frame: &DecodedFrame) -> Result<()> {
        self.sync_size(frame.dimensions())?;

        self.workspace.raw.draw_image(&frame.image);
        self.adapter.send(self.workspace.raw.pixels()).await?;

        let Some(result) = self.latest.latest() else {
            return Ok(());
        };
        if result.dimensions() != self.workspace.dimensions() {
            tracing::debug!(
                result = ?result.dimensions(),
                workspace = ?self.workspace.dimensions(),
                "discarding segmentation result of a previous size"
            );
            self.latest.clear();
            return Ok(());
        }

        let Workspace {
            output, compositor, ..
        } = &mut self.workspace;
        compositor.render(&result, output)?;
        self.published.send_replace(Arc::new(output.snapshot()));
        Ok(())
    }

    /// Follow the decoded size, replacing every working surface at once and
    /// dropping any result computed at the old size.
    fn sync_size(&mut self, (width, height): (u32, u32)) -> Result<()> {
        if width == 0 || height == 0 || self.workspace.dimensions() == (width, height) {
            return Ok(());
        }

        self.workspace = Workspace::new(&self.backdrop, width, height)?;
        self.latest.clear();
        tracing::info!(width, height, "decoded size changed, working surfaces reallocated");
        Ok(())
    }
}

/// Sample the published output surface into the output track at `fps`.
async fn capture_output(
    mut frames: watch::Receiver<Arc<RgbaImage>>,
    sink: TrackSink,
    fps: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / fps as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => break,
            _ = sink.closed() => break,
            _ = ticker.tick() => {}
        }
        if frames.has_changed().is_err() {
            tracing::debug!("render loop gone, capture stopping");
            break;
        }

        let image = Arc::clone(&frames.borrow_and_update());
        let (width, height) = image.dimensions();
        let settings = sink.track().settings();
        if settings.width != Some(width) || settings.height != Some(height) {
            sink.update_settings(TrackSettings {
                width: Some(width),
                height: Some(height),
                ..settings
            });
        }

        if sink.offer(VideoFrame::from_shared(image, started.elapsed())).is_err() {
            break;
        }
    }
}

/// Rebuilds or tears down processing behind one processed stream.
struct FrameCallbackHooks {
    shared: Weak<Shared>,
    /// Session serving this stream; superseded sessions no longer match.
    session: AtomicU64,
}

#[async_trait]
impl PipelineHooks for FrameCallbackHooks {
    async fn replace_source(&self, source: MediaTrack) -> Result<MediaTrack> {
        let Some(shared) = self.shared.upgrade().filter(|shared| shared.adapter.is_initialized()) else {
            source.stop();
            return Err(Error::Disposed(NAME));
        };

        shared.end_session(Some(self.session.load(Ordering::Acquire))).await;
        match shared.setup(source.clone()).await {
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
impl BackgroundStrategy for FrameCallbackStrategy {
    fn delivery(&self) -> FrameDelivery {
        FrameDelivery::FrameCallback
    }

    async fn initialize(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Initialized => return Err(Error::AlreadyInitialized(NAME)),
            Lifecycle::Disposed => return Err(Error::Disposed(NAME)),
            Lifecycle::Uninitialized => {}
        }

        let slot = self.shared.latest.clone();
        self.shared.adapter.set_result_callback(move |result| slot.put(result));
        self.shared.adapter.initialize().await?;

        self.lifecycle = Lifecycle::Initialized;
        tracing::info!(kind = ?self.shared.context.kind, "frame callback strategy initialized");
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

        let (output, session) = match self.shared.setup(source.clone()).await {
            Ok(started) => started,
            Err(e) => {
                source.stop();
                return Err(e);
            }
        };

        let hooks = FrameCallbackHooks {
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

        self.shared.end_session(None).await;
        self.lifecycle = Lifecycle::Disposed;
        self.shared.adapter.dispose().await?;
        tracing::info!("frame callback strategy disposed");
        Ok(())
    }
}
