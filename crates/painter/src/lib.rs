//! The painter thread.
//!
//! A single dedicated thread owns all `paint` calls. Clients wake it
//! through a coalescing one-slot channel: any number of repaint requests
//! arriving while a paint is in flight collapse into a single follow-up
//! paint, which then services the most recent request state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::debug;
use render_protocol::RequestRepaint;

/// One paint iteration, driven by the painter thread whenever a repaint has
/// been requested.
pub trait Paintable: Send + 'static {
    fn paint(&mut self);
}

impl<F: FnMut() + Send + 'static> Paintable for F {
    fn paint(&mut self) {
        self()
    }
}

/// Create the wake-up channel. The signal side goes to the renderer and to
/// clients; the receiver side is handed to `PainterThread::spawn`.
pub fn repaint_channel() -> (PaintSignal, PaintReceiver) {
    let (notify, events) = bounded(1);
    (
        PaintSignal {
            notify: notify.clone(),
        },
        PaintReceiver { notify, events },
    )
}

/// Cloneable, thread-safe repaint wake-up. Requests sent after the painter
/// thread has shut down are dropped.
#[derive(Debug, Clone)]
pub struct PaintSignal {
    notify: Sender<()>,
}

impl PaintSignal {
    pub fn request_repaint(&self) {
        match self.notify.try_send(()) {
            // a pending token already guarantees a follow-up paint
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {}
        }
    }
}

impl RequestRepaint for PaintSignal {
    fn request_repaint(&self) {
        PaintSignal::request_repaint(self);
    }
}

/// Receiver side of the wake-up channel.
#[derive(Debug)]
pub struct PaintReceiver {
    notify: Sender<()>,
    events: Receiver<()>,
}

/// Owns the dedicated paint thread. Dropping (or calling `shutdown`) stops
/// the loop and joins the thread.
pub struct PainterThread {
    notify: Sender<()>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PainterThread {
    pub fn spawn(receiver: PaintReceiver, mut paintable: impl Paintable) -> Self {
        let PaintReceiver { notify, events } = receiver;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let join = thread::Builder::new()
            .name("painter".into())
            .spawn(move || {
                debug!("painter thread running");
                while events.recv().is_ok() {
                    if shutdown_flag.load(Ordering::Acquire) {
                        break;
                    }
                    paintable.paint();
                }
                debug!("painter thread stopped");
            })
            .expect("failed to spawn painter thread");

        Self {
            notify,
            shutdown,
            join: Some(join),
        }
    }

    /// Stop the paint loop and join the thread. The currently running paint
    /// (if any) completes first.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        // a Full error means a wake token is already pending
        let _ = self.notify.try_send(());
        if join.join().is_err() {
            debug!("painter thread exited with a panic");
        }
    }
}

impl Drop for PainterThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
