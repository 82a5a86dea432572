use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by processors, strategies and the segmentation adapter.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected configuration, raised by constructors only.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{0} is already initialized")]
    AlreadyInitialized(&'static str),

    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// Neither frame-delivery strategy is available on this platform.
    #[error("{0} is not supported in this environment")]
    Unsupported(&'static str),

    /// Decoded or reported frame geometry is unusable.
    #[error("invalid video geometry: {0}")]
    Geometry(String),

    /// A second `send` was issued while one was still in flight.
    #[error("segmentation request already in flight")]
    SegmentationBusy,

    #[error("segmentation engine failed")]
    Segmentation(#[source] anyhow::Error),

    #[error("failed to acquire video source")]
    Acquisition(#[source] anyhow::Error),

    /// Per-frame failure inside the stream pipeline.
    #[error("frame transform failed: {0}")]
    Transform(String),

    #[error("surface error: {0}")]
    Surface(String),

    #[error("failed to load background image")]
    BackgroundImage(#[from] image::ImageError),

    #[error("stream callback failed")]
    Callback(#[source] anyhow::Error),

    /// The consumer side of an output track went away.
    #[error("output track closed")]
    OutputClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the lifecycle family: double initialize, use before initialize
    /// and use after dispose.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Error::AlreadyInitialized(_) | Error::NotInitialized(_) | Error::Disposed(_)
        )
    }
}
