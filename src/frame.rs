//! Decoded video frames and the production budget they are leased from.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use tokio::sync::Notify;

/// Bounds how many frames a source may have outstanding at once.
///
/// A source leases one slot per frame it produces; the slot returns when the
/// frame is closed or dropped. A source whose budget is exhausted either skips
/// frames ([`FrameBudget::try_acquire`]) or waits for a release
/// ([`FrameBudget::acquire`]).
#[derive(Debug, Clone)]
pub struct FrameBudget {
    slots: Arc<Slots>,
    limit: usize,
}

#[derive(Debug, Default)]
struct Slots {
    outstanding: AtomicUsize,
    released: Notify,
}

impl FrameBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Slots::default()),
            limit,
        }
    }

    /// Reserve a slot, or `None` when every slot is leased.
    pub fn try_acquire(&self) -> Option<FrameLease> {
        self.slots
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .ok()
            .map(|_| FrameLease {
                slots: Arc::clone(&self.slots),
            })
    }

    /// Reserve a slot, waiting for a lease to be released if none is free.
    pub async fn acquire(&self) -> FrameLease {
        loop {
            let released = self.slots.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed.
            released.as_mut().enable();

            if let Some(lease) = self.try_acquire() {
                return lease;
            }
            released.await;
        }
    }

    /// Frames leased and not yet released.
    pub fn outstanding(&self) -> usize {
        self.slots.outstanding.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// One leased budget slot, returned on drop.
#[derive(Debug)]
pub struct FrameLease {
    slots: Arc<Slots>,
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.slots.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.slots.released.notify_waiters();
    }
}

/// A single decoded image plus its presentation timestamp.
///
/// Frames are consumed exactly once. [`VideoFrame::close`] releases the
/// frame's budget slot explicitly; dropping the frame does the same.
#[derive(Debug)]
pub struct VideoFrame {
    image: Arc<RgbaImage>,
    timestamp: Duration,
    lease: Option<FrameLease>,
}

impl VideoFrame {
    pub fn new(image: RgbaImage, timestamp: Duration) -> Self {
        Self::from_shared(Arc::new(image), timestamp)
    }

    pub fn from_shared(image: Arc<RgbaImage>, timestamp: Duration) -> Self {
        Self {
            image,
            timestamp,
            lease: None,
        }
    }

    /// Tie this frame to a budget slot.
    pub fn with_lease(mut self, lease: FrameLease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn shared_image(&self) -> Arc<RgbaImage> {
        Arc::clone(&self.image)
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Release the frame and its budget slot.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_and_recovers() {
        let budget = FrameBudget::new(2);
        let a = budget.try_acquire().unwrap();
        let b = budget.try_acquire().unwrap();
        assert!(budget.try_acquire().is_none());
        assert_eq!(budget.outstanding(), 2);

        drop(a);
        assert_eq!(budget.outstanding(), 1);
        let c = budget.try_acquire();
        assert!(c.is_some());
        drop(b);
        drop(c);
        assert_eq!(budget.outstanding(), 0);
    }

    #[test]
    fn closing_a_frame_releases_its_lease() {
        let budget = FrameBudget::new(1);
        let frame = VideoFrame::new(RgbaImage::new(4, 2), Duration::from_millis(33))
            .with_lease(budget.try_acquire().unwrap());
        assert_eq!(budget.outstanding(), 1);
        assert_eq!(frame.dimensions(), (4, 2));
        assert_eq!(frame.timestamp(), Duration::from_millis(33));

        frame.close();
        assert_eq!(budget.outstanding(), 0);
    }

    #[tokio::test]
    async fn acquire_waits_for_a_release() {
        let budget = FrameBudget::new(1);
        let held = budget.try_acquire().unwrap();

        let waiter = tokio::spawn({
            let budget = budget.clone();
            async move { budget.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let lease = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
        assert_eq!(budget.outstanding(), 1);
        drop(lease);
        assert_eq!(budget.outstanding(), 0);
    }
}
