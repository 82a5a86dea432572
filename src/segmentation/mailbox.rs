use std::sync::{Arc, Mutex};

use super::types::SegmentationResult;
use crate::lock;

/// Single-slot mailbox holding the most recent segmentation result.
///
/// Each `put` supersedes whatever was there; readers see the latest value
/// without consuming it. Clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct ResultSlot {
    latest: Arc<Mutex<Option<Arc<SegmentationResult>>>>,
}

impl ResultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, result: SegmentationResult) {
        *lock(&self.latest) = Some(Arc::new(result));
    }

    pub fn latest(&self) -> Option<Arc<SegmentationResult>> {
        lock(&self.latest).clone()
    }

    /// Drop the stored result, e.g. after a geometry change.
    pub fn clear(&self) {
        lock(&self.latest).take();
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.latest).is_none()
    }
}
