//! Progressive multi-resolution renderer.
//!
//! Rendering proceeds coarse-to-fine: a small screen image at a fraction of
//! the canvas resolution is rendered first and scaled up by the display,
//! then increasingly finer images are rendered until the full canvas
//! resolution is reached. While the view transform keeps changing, repaint
//! requests cancel in-flight fine passes so the display stays interactive;
//! once it settles, detail fills in.
//!
//! The starting (coarsest acceptable) scale is chosen so one pass stays
//! close to the configured target render time, based on a moving per-pixel,
//! per-source time estimate measured on previous frames.
//!
//! Volatile sources may deliver placeholder data while blocks are fetched;
//! a pass then completes as successful-but-invalid and is re-attempted
//! until every pixel is backed by authoritative data.
//!
//! Dirty intervals are a second rendering mode: instead of a full frame,
//! only the bounding box of the requested canvas rectangles is rendered and
//! patched into the current full-frame result. Full-frame requests obsolete
//! pending intervals.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use cache::{CacheControl, IoTimeBudget};
use log::{debug, trace};
use render_protocol::{CancelToken, Interval, RenderResult, RenderTarget, RequestRepaint};
use serde::{Deserialize, Serialize};

use view::SnapshotSource;

pub mod moving_average;
pub mod projector;
pub mod projector_factory;
pub mod render_storage;
pub mod screen_scales;


pub use moving_average::MovingAverage;
pub use projector::{
    AccumulateProjector, AccumulateProjectorFactory, CompositeVolatileProjector,
    SourceVolatileProjector, SumAccumulateProjectorFactory, VolatileProjector,
};
pub use projector_factory::{ProjectorFactory, StandardProjectorFactory};
pub use render_storage::RenderStorage;
pub use screen_scales::{IntervalRenderData, ScreenScale, ScreenScales};

const ESTIMATOR_WINDOW: usize = 3;

/// Seed for the per-pixel-and-source render time estimate. Chosen so the
/// very first frame starts at a mid-coarse scale.
const ESTIMATOR_SEED_NANOS: f64 = 500.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Rendering scale ladder, finest first. 1.0 renders one screen-image
    /// pixel per canvas pixel.
    pub screen_scale_factors: Vec<f64>,

    /// Per-frame latency goal; drives the adaptive scale selection.
    pub target_render_nanos: u64,

    /// How many row strips a projector pass is split into.
    pub num_rendering_threads: usize,

    /// Prefer volatile (cache-asynchronous) source access.
    pub use_volatile_if_available: bool,

    /// IO budget handed to the cache control at projector creation.
    pub io_budget: IoTimeBudget,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            screen_scale_factors: vec![1.0, 0.75, 0.5, 0.25, 0.125],
            target_render_nanos: 30_000_000,
            num_rendering_threads: 3,
            use_volatile_if_available: true,
            io_budget: IoTimeBudget::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RendererConfigError {
    EmptyScreenScaleFactors,
    InvalidScreenScaleFactor { index: usize, value: f64 },
    ZeroRenderingThreads,
    ZeroTargetRenderNanos,
}

impl RendererConfig {
    pub fn validate(&self) -> Result<(), RendererConfigError> {
        if self.screen_scale_factors.is_empty() {
            return Err(RendererConfigError::EmptyScreenScaleFactors);
        }
        for (index, value) in self.screen_scale_factors.iter().copied().enumerate() {
            if !value.is_finite() || value <= 0.0 || value > 1.0 {
                return Err(RendererConfigError::InvalidScreenScaleFactor { index, value });
            }
        }
        if self.num_rendering_threads == 0 {
            return Err(RendererConfigError::ZeroRenderingThreads);
        }
        if self.target_render_nanos == 0 {
            return Err(RendererConfigError::ZeroTargetRenderNanos);
        }
        Ok(())
    }
}

/// Request/state bundle shared between the painter thread and client
/// threads, guarded by one coarse mutex.
///
/// Scale indices use the original sentinel convention: a current index of
/// `-1` means "nothing rendered yet", a requested index of `-1` means
/// "fully resolved, nothing scheduled".
#[derive(Debug)]
struct SharedState {
    screen_scales: ScreenScales,

    /// A full repaint was requested. Obsoletes pending interval requests.
    new_frame_request: bool,

    /// Repainting of a dirty interval was requested.
    new_interval_request: bool,

    /// Whether the in-flight pass may be cancelled. False while rendering
    /// the first, committing pass of a frame or interval batch.
    rendering_may_be_cancelled: bool,

    /// True iff dirty intervals are being serviced instead of full frames.
    interval_mode: bool,

    /// Screen scale of the last committed full-frame pass.
    current_screen_scale_index: i32,

    /// Screen scale to render next in full-frame mode; -1 when converged.
    requested_screen_scale_index: i32,

    /// Scale of the last committed interval pass.
    current_interval_scale_index: i32,

    requested_interval_scale_index: i32,

    /// Visible-source count of the snapshot being rendered; kept here so
    /// interval scale suggestions can read it together with the indices.
    current_num_visible_sources: usize,

    /// Cancel access to the in-flight projector for client threads.
    cancel: Option<CancelToken>,
}

#[derive(Debug)]
struct RendererShared {
    state: Mutex<SharedState>,
}

impl RendererShared {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().expect("renderer state lock poisoned")
    }
}

/// Cloneable client handle for repaint requests. Safe to use from any
/// thread; the painter thread is woken through the repaint signal.
#[derive(Clone)]
pub struct RepaintRequests {
    shared: Arc<RendererShared>,
    repaint: Arc<dyn RequestRepaint>,
}

impl RepaintRequests {
    /// Request a full repaint. Cancels the in-flight pass if it may be
    /// cancelled; otherwise the request takes effect after it finishes.
    pub fn request_repaint(&self) {
        {
            let mut state = self.shared.lock();
            if state.rendering_may_be_cancelled {
                if let Some(cancel) = &state.cancel {
                    cancel.cancel();
                }
            }
            state.new_frame_request = true;
        }
        self.repaint.request_repaint();
    }

    /// Request a repaint of a canvas interval. During a committing
    /// full-frame pass this upgrades to a full repaint so the coarse result
    /// is not partially overwritten by stale interval data.
    pub fn request_repaint_interval(&self, interval: Interval) {
        {
            let mut state = self.shared.lock();
            if state.rendering_may_be_cancelled || state.interval_mode {
                if let Some(cancel) = &state.cancel {
                    cancel.cancel();
                }
                state.screen_scales.request_interval(interval);
                state.new_interval_request = true;
            } else {
                state.new_frame_request = true;
            }
        }
        self.repaint.request_repaint();
    }
}

/// The coarse-to-fine rendering state machine. Owned and driven by the
/// painter thread; everything clients touch goes through `RepaintRequests`.
pub struct MultiResolutionRenderer {
    display: Box<dyn RenderTarget>,
    repaint: Arc<dyn RequestRepaint>,
    projector_factory: Box<dyn ProjectorFactory>,
    cache_control: Arc<dyn CacheControl>,
    io_budget: IoTimeBudget,
    shared: Arc<RendererShared>,
    render_storage: RenderStorage,

    /// Estimate of the time to render one screen pixel from one source.
    /// Updated only on committing full-frame passes.
    render_nanos_per_pixel_and_source: MovingAverage,

    /// The active projector. Client threads cancel it through the token in
    /// the shared state, never through this owned handle.
    projector: Option<Box<dyn VolatileProjector>>,

    /// Snapshot captured at the start of the current frame; immutable for
    /// the lifetime of that frame.
    current_viewer_state: Option<view::ViewerSnapshot>,

    /// The published full-frame result interval passes patch into.
    current_render_result: Option<RenderResult>,

    /// Dedicated scratch result for interval passes.
    interval_result: RenderResult,

    interval_render_data: Option<IntervalRenderData>,
}

impl MultiResolutionRenderer {
    pub fn new(
        mut display: Box<dyn RenderTarget>,
        repaint: Arc<dyn RequestRepaint>,
        projector_factory: Box<dyn ProjectorFactory>,
        cache_control: Arc<dyn CacheControl>,
        config: RendererConfig,
    ) -> Result<Self, RendererConfigError> {
        config.validate()?;

        let screen_scales =
            ScreenScales::new(&config.screen_scale_factors, config.target_render_nanos);
        let requested_screen_scale_index = screen_scales.coarsest_index() as i32;
        let interval_result = display.create_render_result();

        let mut render_nanos_per_pixel_and_source = MovingAverage::new(ESTIMATOR_WINDOW);
        render_nanos_per_pixel_and_source.init(ESTIMATOR_SEED_NANOS);

        Ok(Self {
            display,
            repaint,
            projector_factory,
            cache_control,
            io_budget: config.io_budget,
            shared: Arc::new(RendererShared {
                state: Mutex::new(SharedState {
                    screen_scales,
                    new_frame_request: false,
                    new_interval_request: false,
                    rendering_may_be_cancelled: false,
                    interval_mode: false,
                    current_screen_scale_index: -1,
                    requested_screen_scale_index,
                    current_interval_scale_index: 0,
                    requested_interval_scale_index: 0,
                    current_num_visible_sources: 0,
                    cancel: None,
                }),
            }),
            render_storage: RenderStorage::new(),
            render_nanos_per_pixel_and_source,
            projector: None,
            current_viewer_state: None,
            current_render_result: None,
            interval_result,
            interval_render_data: None,
        })
    }

    pub fn repaint_requests(&self) -> RepaintRequests {
        RepaintRequests {
            shared: Arc::clone(&self.shared),
            repaint: Arc::clone(&self.repaint),
        }
    }

    /// Render one pass at the currently requested scale. Returns false when
    /// nothing was rendered: zero-sized canvas, a cancelled pass, or a
    /// spurious wake-up after convergence.
    pub fn paint(&mut self, viewer: &dyn SnapshotSource) -> bool {
        let canvas_width = self.display.width();
        let canvas_height = self.display.height();
        if canvas_width == 0 || canvas_height == 0 {
            return false;
        }

        // Phase 1: classify pending requests.
        let resized;
        let new_frame;
        let new_interval;
        let paint_interval;
        let prepare_next_frame;
        let mut create_projector = false;
        {
            let mut state = self.shared.lock();
            resized = state.screen_scales.check_resize(canvas_width, canvas_height);

            new_frame = state.new_frame_request || resized;
            if new_frame {
                state.interval_mode = false;
                state.screen_scales.clear_requested_intervals();
            }

            new_interval = state.new_interval_request && !new_frame;
            if new_interval {
                state.interval_mode = true;
                let nanos_per_pixel = self.render_nanos_per_pixel_and_source.average()
                    * state.current_num_visible_sources as f64;
                let base = state.current_screen_scale_index.max(0) as usize;
                state.requested_interval_scale_index = state
                    .screen_scales
                    .suggest_interval_screen_scale(nanos_per_pixel, base)
                    as i32;
            }

            prepare_next_frame = new_frame || new_interval;
            paint_interval = state.interval_mode;

            if paint_interval {
                create_projector = new_interval
                    || state.requested_interval_scale_index != state.current_interval_scale_index;
                if create_projector {
                    let requested = state.requested_interval_scale_index as usize;
                    let base = state.current_screen_scale_index.max(0) as usize;
                    self.interval_render_data =
                        Some(state.screen_scales.pull_interval_render_data(requested, base));
                }
            } else if !new_frame && state.requested_screen_scale_index < 0 {
                // Spurious wake-up after convergence; nothing is scheduled.
                state.new_frame_request = false;
                state.new_interval_request = false;
                return false;
            }

            state.new_frame_request = false;
            state.new_interval_request = false;
        }

        // Phase 2: frame preparation.
        if prepare_next_frame {
            self.cache_control.prepare_next_frame();
        }

        if new_frame {
            let snapshot = viewer.snapshot();
            let num_visible_sources = snapshot.visible_and_present_sources().len();
            let nanos_per_pixel =
                self.render_nanos_per_pixel_and_source.average() * num_visible_sources as f64;
            {
                let mut state = self.shared.lock();
                state.current_num_visible_sources = num_visible_sources;
                state.requested_screen_scale_index =
                    state.screen_scales.suggest_screen_scale(nanos_per_pixel) as i32;
            }
            self.current_viewer_state = Some(snapshot);
        }

        // Phase 3: projector creation.
        let mut render_result: Option<RenderResult> = None;
        let mut request_new_frame_if_incomplete = false;

        if paint_interval {
            let interval_data = self
                .interval_render_data
                .clone()
                .expect("interval render data exists in interval mode");
            self.interval_result
                .init(interval_data.width(), interval_data.height());
            self.interval_result.set_scale_factor(interval_data.scale());

            if create_projector {
                let snapshot = self
                    .current_viewer_state
                    .clone()
                    .expect("a full frame precedes interval rendering");
                let cancel = CancelToken::new();
                let mut state = self.shared.lock();

                let scale_index = state.requested_interval_scale_index as usize;
                let mut screen_transform = snapshot.viewer_transform();
                screen_transform
                    .pre_concatenate(&state.screen_scales.get(scale_index).scale_transform());
                screen_transform.translate(
                    -f64::from(interval_data.offset_x()),
                    -f64::from(interval_data.offset_y()),
                    0.0,
                );

                self.projector = Some(self.projector_factory.create_projector(
                    &snapshot,
                    self.interval_result.clone(),
                    screen_transform,
                    &mut self.render_storage,
                    cancel.clone(),
                ));
                self.cache_control.reset_io_time_budget(self.io_budget);
                state.cancel = Some(cancel);
                state.rendering_may_be_cancelled = !new_interval;
            }
        } else {
            let mut state = self.shared.lock();
            create_projector =
                new_frame || state.requested_screen_scale_index != state.current_screen_scale_index;
            if create_projector {
                let snapshot = self
                    .current_viewer_state
                    .clone()
                    .expect("a new frame captures a snapshot before rendering");
                let scale_index = state.requested_screen_scale_index as usize;
                let screen_scale = *state.screen_scales.get(scale_index);
                let finest = *state.screen_scales.get(0);

                let result = self.display.reusable_render_result();
                result.init(screen_scale.width(), screen_scale.height());
                result.set_scale_factor(screen_scale.scale());
                result.set_viewer_transform(snapshot.viewer_transform());

                self.render_storage.check_renew_data(
                    finest.width(),
                    finest.height(),
                    state.current_num_visible_sources,
                );

                let cancel = CancelToken::new();
                let mut screen_transform = snapshot.viewer_transform();
                screen_transform.pre_concatenate(&screen_scale.scale_transform());

                self.projector = Some(self.projector_factory.create_projector(
                    &snapshot,
                    result.clone(),
                    screen_transform,
                    &mut self.render_storage,
                    cancel.clone(),
                ));
                self.cache_control.reset_io_time_budget(self.io_budget);
                request_new_frame_if_incomplete =
                    self.projector_factory.request_new_frame_if_incomplete();
                state.cancel = Some(cancel);
                state.rendering_may_be_cancelled = !new_frame;
                render_result = Some(result);
            }
        }

        // Phase 4: render, outside the lock.
        let (success, render_time_nanos, projector_valid) = {
            let projector = self
                .projector
                .as_mut()
                .expect("a projector exists for the scheduled pass");
            let success = projector.map(create_projector);
            (
                success,
                projector.last_frame_render_nanos(),
                projector.is_valid(),
            )
        };

        // Phase 5: disposition.
        let mut wake_painter = false;
        let mut backoff_for_missing_data = false;
        {
            let mut state = self.shared.lock();
            if success {
                if paint_interval {
                    if create_projector {
                        state.current_interval_scale_index = state.requested_interval_scale_index;
                    }

                    let interval_data = self
                        .interval_render_data
                        .as_ref()
                        .expect("interval render data exists in interval mode");
                    self.current_render_result
                        .as_ref()
                        .expect("interval passes patch into a committed frame")
                        .patch(
                            &self.interval_result,
                            interval_data.target_interval(),
                            interval_data.tx(),
                            interval_data.ty(),
                        );

                    if state.current_interval_scale_index > state.current_screen_scale_index {
                        state.requested_interval_scale_index =
                            state.current_interval_scale_index - 1;
                        wake_painter = true;
                    } else if projector_valid {
                        // Back to full-frame rendering. When the canvas was
                        // already fully resolved at this scale, bump the
                        // current index so the next paint re-checks it.
                        trace!("interval batch complete, leaving interval mode");
                        state.interval_mode = false;
                        state.rendering_may_be_cancelled = false;
                        if state.requested_screen_scale_index >= 0
                            && state.requested_screen_scale_index
                                == state.current_screen_scale_index
                        {
                            state.current_screen_scale_index += 1;
                        }
                        wake_painter = true;
                    } else {
                        // Missing blocks; retry the same interval scale.
                        backoff_for_missing_data = true;
                        state.screen_scales.re_request(interval_data);
                        state.requested_interval_scale_index = state.current_interval_scale_index;
                        wake_painter = true;
                    }
                } else {
                    if create_projector {
                        state.current_screen_scale_index = state.requested_screen_scale_index;
                        let result = render_result
                            .take()
                            .expect("created full-frame pass has a render result");
                        result.set_updated();
                        self.display.set_render_result(result.clone());

                        if state.current_num_visible_sources > 0 {
                            let num_render_pixels =
                                result.num_pixels() * state.current_num_visible_sources as u64;
                            if num_render_pixels > 0 {
                                self.render_nanos_per_pixel_and_source
                                    .add(render_time_nanos as f64 / num_render_pixels as f64);
                            }
                        }
                        trace!(
                            "committed full-frame pass at screen scale index {}",
                            state.current_screen_scale_index
                        );
                        self.current_render_result = Some(result);
                    } else {
                        self.current_render_result
                            .as_ref()
                            .expect("re-rendered pass refreshes a committed frame")
                            .set_updated();
                    }

                    if !projector_valid && request_new_frame_if_incomplete {
                        if state.rendering_may_be_cancelled {
                            if let Some(cancel) = &state.cancel {
                                cancel.cancel();
                            }
                        }
                        state.new_frame_request = true;
                        wake_painter = true;
                    } else if state.current_screen_scale_index > 0 {
                        state.requested_screen_scale_index = state.current_screen_scale_index - 1;
                        wake_painter = true;
                    } else if projector_valid {
                        // Fully resolved.
                        state.requested_screen_scale_index = -1;
                    } else {
                        backoff_for_missing_data = true;
                        state.requested_screen_scale_index = state.current_screen_scale_index;
                        wake_painter = true;
                    }
                }
            } else if paint_interval {
                // Cancelled mid-interval; keep the dirty region queued.
                if let Some(interval_data) = &self.interval_render_data {
                    state.screen_scales.re_request(interval_data);
                }
            }
        }

        if backoff_for_missing_data {
            thread::sleep(Duration::from_millis(1));
        }
        if wake_painter {
            self.repaint.request_repaint();
        }

        success
    }

    /// Drop the projector, results, and buffer pool. Call when the
    /// enclosing window closes; the painter thread must be stopped first.
    pub fn kill(&mut self) {
        debug!("renderer killed, dropping projector and render storage");
        {
            let mut state = self.shared.lock();
            state.cancel = None;
            state.new_frame_request = false;
            state.new_interval_request = false;
            state.interval_mode = false;
            state.rendering_may_be_cancelled = false;
            state.requested_screen_scale_index = -1;
        }
        self.projector = None;
        self.current_viewer_state = None;
        self.current_render_result = None;
        self.interval_render_data = None;
        self.render_storage.clear();
    }
}
