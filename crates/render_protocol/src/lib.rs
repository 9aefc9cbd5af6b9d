//! Shared vocabulary crossing the renderer boundary.
//!
//! Types in this crate are exchanged between the renderer, the painter
//! thread, and the display: canvas intervals, render results, the render
//! target contract, and the cross-thread repaint/cancel capabilities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod interval;
mod result;
mod target;

pub use interval::Interval;
pub use result::{ArgbImage, RenderResult};
pub use target::{BufferedRenderTarget, RenderTarget, RenderTargetHandle};

/// Capability to wake the painter thread. Implemented by the painter's
/// signal; the renderer uses it for its internal iterate-repaint scheduling
/// and hands it to clients through its request handle.
pub trait RequestRepaint: Send + Sync {
    fn request_repaint(&self);
}

/// Cooperative cancellation flag shared between a running projector and the
/// client threads that may abort it. `cancel` is idempotent and safe to call
/// concurrently with the render pass.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_and_idempotent() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn fresh_tokens_are_independent() {
        let first = CancelToken::new();
        let second = CancelToken::new();
        first.cancel();
        assert!(!second.is_cancelled());
    }
}
