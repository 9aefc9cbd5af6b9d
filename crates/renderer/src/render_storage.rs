//! Pooled per-source scratch buffers.
//!
//! Each visible source renders into its own ARGB buffer plus a per-pixel
//! validity mask before the accumulate step combines them. Buffers are
//! dimensioned to the finest screen scale and reused across passes and
//! frames to avoid allocation churn; projectors hold `Arc`s into the pool
//! for the duration of a pass series.

use std::sync::{Arc, Mutex, MutexGuard};

pub const MASK_INVALID: u8 = 0;
pub const MASK_VALID: u8 = 1;

#[derive(Debug, Default)]
pub struct SlotBuffers {
    pub argb: Vec<u32>,
    pub mask: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct SourceRenderSlot {
    buffers: Mutex<SlotBuffers>,
}

impl SourceRenderSlot {
    pub fn lock(&self) -> MutexGuard<'_, SlotBuffers> {
        self.buffers.lock().expect("render slot lock poisoned")
    }
}

#[derive(Debug, Default)]
pub struct RenderStorage {
    slots: Vec<Arc<SourceRenderSlot>>,
    width: u32,
    height: u32,
}

impl RenderStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the pool so it holds `num_sources` slots of `max_width` x
    /// `max_height` pixels. A dimension change reallocates every slot (old
    /// buffers stay alive through projectors still holding them).
    pub fn check_renew_data(&mut self, max_width: u32, max_height: u32, num_sources: usize) {
        let num_pixels = (max_width as usize) * (max_height as usize);
        let dimensions_changed = max_width != self.width || max_height != self.height;
        if dimensions_changed {
            self.width = max_width;
            self.height = max_height;
            self.slots.clear();
        }
        while self.slots.len() < num_sources {
            self.slots.push(Arc::new(SourceRenderSlot {
                buffers: Mutex::new(SlotBuffers {
                    argb: vec![0; num_pixels],
                    mask: vec![MASK_INVALID; num_pixels],
                }),
            }));
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn slot(&self, index: usize) -> Arc<SourceRenderSlot> {
        Arc::clone(&self.slots[index])
    }

    /// Drop the pool. Used on teardown.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.width = 0;
        self.height = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_grows_on_demand_and_keeps_existing_slots() {
        let mut storage = RenderStorage::new();
        storage.check_renew_data(16, 8, 2);
        assert_eq!(storage.num_slots(), 2);
        let first = storage.slot(0);

        storage.check_renew_data(16, 8, 4);
        assert_eq!(storage.num_slots(), 4);
        assert!(Arc::ptr_eq(&first, &storage.slot(0)));

        // shrinking the source count keeps the pool
        storage.check_renew_data(16, 8, 1);
        assert_eq!(storage.num_slots(), 4);
    }

    #[test]
    fn dimension_change_reallocates_slots() {
        let mut storage = RenderStorage::new();
        storage.check_renew_data(4, 4, 1);
        let old = storage.slot(0);
        old.lock().argb[0] = 0xFFFF_FFFF;

        storage.check_renew_data(8, 8, 1);
        let new = storage.slot(0);
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.lock().argb.len(), 64);
        assert_eq!(new.lock().argb[0], 0);
    }

    #[test]
    fn clear_drops_the_pool() {
        let mut storage = RenderStorage::new();
        storage.check_renew_data(4, 4, 3);
        storage.clear();
        assert_eq!(storage.num_slots(), 0);
    }
}
