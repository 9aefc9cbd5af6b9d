use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::RenderResult;

/// Receiver for rendered frames: reports the canvas size, pools reusable
/// results, and accepts the published result for display.
pub trait RenderTarget: Send {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// A fresh result, not part of the reusable pool (the renderer uses one
    /// as its dedicated interval scratch result).
    fn create_render_result(&mut self) -> RenderResult;

    /// A result that is currently not displayed and may be rendered into.
    fn reusable_render_result(&mut self) -> RenderResult;

    /// Publish: the given result becomes the displayed one; the previously
    /// displayed result returns to the reusable pool.
    fn set_render_result(&mut self, result: RenderResult);
}

#[derive(Debug)]
struct TargetShared {
    width: AtomicU32,
    height: AtomicU32,
    visible: Mutex<Option<RenderResult>>,
}

/// Double-buffering `RenderTarget` backed by plain CPU images.
///
/// The renderer owns the `BufferedRenderTarget`; the display side (and
/// tests) observe published frames and drive canvas resizes through the
/// cloneable `RenderTargetHandle`.
#[derive(Debug)]
pub struct BufferedRenderTarget {
    shared: Arc<TargetShared>,
    spare: Vec<RenderResult>,
}

impl BufferedRenderTarget {
    pub fn new(width: u32, height: u32) -> (Self, RenderTargetHandle) {
        let shared = Arc::new(TargetShared {
            width: AtomicU32::new(width),
            height: AtomicU32::new(height),
            visible: Mutex::new(None),
        });
        let target = Self {
            shared: Arc::clone(&shared),
            spare: Vec::new(),
        };
        (target, RenderTargetHandle { shared })
    }
}

impl RenderTarget for BufferedRenderTarget {
    fn width(&self) -> u32 {
        self.shared.width.load(Ordering::Acquire)
    }

    fn height(&self) -> u32 {
        self.shared.height.load(Ordering::Acquire)
    }

    fn create_render_result(&mut self) -> RenderResult {
        RenderResult::new()
    }

    fn reusable_render_result(&mut self) -> RenderResult {
        self.spare.pop().unwrap_or_default()
    }

    fn set_render_result(&mut self, result: RenderResult) {
        let mut visible = self
            .shared
            .visible
            .lock()
            .expect("render target lock poisoned");
        if let Some(previous) = visible.take() {
            if !previous.ptr_eq(&result) {
                self.spare.push(previous);
            }
        }
        *visible = Some(result);
    }
}

/// Display-side view of a `BufferedRenderTarget`.
#[derive(Debug, Clone)]
pub struct RenderTargetHandle {
    shared: Arc<TargetShared>,
}

impl RenderTargetHandle {
    pub fn set_canvas_size(&self, width: u32, height: u32) {
        self.shared.width.store(width, Ordering::Release);
        self.shared.height.store(height, Ordering::Release);
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        (
            self.shared.width.load(Ordering::Acquire),
            self.shared.height.load(Ordering::Acquire),
        )
    }

    /// The currently published frame, if any.
    pub fn visible_result(&self) -> Option<RenderResult> {
        self.shared
            .visible
            .lock()
            .expect("render target lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishing_rotates_displaced_result_into_spare_pool() {
        let (mut target, handle) = BufferedRenderTarget::new(100, 50);

        let first = target.reusable_render_result();
        first.init(10, 5);
        target.set_render_result(first.clone());
        assert!(handle
            .visible_result()
            .expect("published result")
            .ptr_eq(&first));

        let second = target.reusable_render_result();
        assert!(!second.ptr_eq(&first));
        target.set_render_result(second.clone());

        // the displaced first result is handed back for reuse
        let third = target.reusable_render_result();
        assert!(third.ptr_eq(&first));
    }

    #[test]
    fn republishing_the_visible_result_does_not_pool_it() {
        let (mut target, _handle) = BufferedRenderTarget::new(10, 10);
        let result = target.reusable_render_result();
        target.set_render_result(result.clone());
        target.set_render_result(result.clone());

        let reusable = target.reusable_render_result();
        assert!(!reusable.ptr_eq(&result));
    }

    #[test]
    fn canvas_size_updates_are_visible_to_the_renderer_side() {
        let (target, handle) = BufferedRenderTarget::new(640, 480);
        assert_eq!((target.width(), target.height()), (640, 480));

        handle.set_canvas_size(800, 600);
        assert_eq!((target.width(), target.height()), (800, 600));
        assert_eq!(handle.canvas_size(), (800, 600));
    }
}
