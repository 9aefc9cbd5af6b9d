//! Screen-scale ladder and dirty-interval bookkeeping.
//!
//! A screen scale of 1.0 renders one screen-image pixel per canvas pixel;
//! 0.5 renders at half resolution and is scaled up by the display. Index 0
//! is the finest scale, higher indices are coarser. The table also owns the
//! pending dirty intervals and turns them into consolidated interval render
//! work units.
//!
//! Pending intervals are tracked per scale: a repaint request is unioned
//! into every scale's set, and pulling render data drains only the pulled
//! scale's copy. Iterating an interval batch to the next finer scale
//! therefore still finds the dirty region in that scale's set.

use render_protocol::Interval;
use smallvec::SmallVec;
use view::AffineTransform3d;

/// Immutable descriptor of one rendering resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenScale {
    scale: f64,
    width: u32,
    height: u32,
}

impl ScreenScale {
    fn new(canvas_width: u32, canvas_height: u32, scale: f64) -> Self {
        Self {
            scale,
            width: ((f64::from(canvas_width) * scale).round() as u32).max(1),
            height: ((f64::from(canvas_height) * scale).round() as u32).max(1),
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Canvas-to-screen-image transform (diagonal scale).
    pub fn scale_transform(&self) -> AffineTransform3d {
        AffineTransform3d::scaling(self.scale, self.scale, 1.0)
    }

    pub fn estimated_render_nanos(&self, nanos_per_pixel: f64) -> f64 {
        f64::from(self.width) * f64::from(self.height) * nanos_per_pixel
    }
}

/// The pulled, consolidated work unit for one interval render pass.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalRenderData {
    target_interval: Interval,
    scale_index: usize,
    offset_x: i32,
    offset_y: i32,
    width: u32,
    height: u32,
    scale: f64,
    tx: i32,
    ty: i32,
}

impl IntervalRenderData {
    /// Bounding box of the drained dirty intervals, canvas coordinates,
    /// clamped to the canvas.
    pub fn target_interval(&self) -> Interval {
        self.target_interval
    }

    /// The scale this work unit was pulled for.
    pub fn scale_index(&self) -> usize {
        self.scale_index
    }

    /// Crop origin of the interval render image, in interval-scale
    /// screen-image coordinates.
    pub fn offset_x(&self) -> i32 {
        self.offset_x
    }

    pub fn offset_y(&self) -> i32 {
        self.offset_y
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Paste origin into the current full-frame result, in base-scale pixel
    /// coordinates.
    pub fn tx(&self) -> i32 {
        self.tx
    }

    pub fn ty(&self) -> i32 {
        self.ty
    }
}

#[derive(Debug)]
pub struct ScreenScales {
    scales: Vec<ScreenScale>,
    scale_factors: Vec<f64>,
    target_render_nanos: u64,
    canvas_width: u32,
    canvas_height: u32,
    pending_intervals: Vec<SmallVec<[Interval; 4]>>,
}

impl ScreenScales {
    pub fn new(scale_factors: &[f64], target_render_nanos: u64) -> Self {
        assert!(
            !scale_factors.is_empty(),
            "screen scale ladder must not be empty"
        );
        Self {
            scales: scale_factors
                .iter()
                .map(|factor| ScreenScale::new(0, 0, *factor))
                .collect(),
            scale_factors: scale_factors.to_vec(),
            target_render_nanos,
            canvas_width: 0,
            canvas_height: 0,
            pending_intervals: vec![SmallVec::new(); scale_factors.len()],
        }
    }

    pub fn len(&self) -> usize {
        self.scales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }

    pub fn get(&self, index: usize) -> &ScreenScale {
        &self.scales[index]
    }

    pub fn coarsest_index(&self) -> usize {
        self.scales.len() - 1
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        (self.canvas_width, self.canvas_height)
    }

    /// Rebuild the scale table if the canvas size changed. Pending intervals
    /// refer to the old canvas and are discarded. Returns true iff the size
    /// changed.
    pub fn check_resize(&mut self, canvas_width: u32, canvas_height: u32) -> bool {
        if self.canvas_width == canvas_width && self.canvas_height == canvas_height {
            return false;
        }
        self.canvas_width = canvas_width;
        self.canvas_height = canvas_height;
        self.scales = self
            .scale_factors
            .iter()
            .map(|factor| ScreenScale::new(canvas_width, canvas_height, *factor))
            .collect();
        self.clear_requested_intervals();
        true
    }

    /// Smallest (finest) index whose estimated render time fits the target,
    /// or the coarsest index when none fits.
    pub fn suggest_screen_scale(&self, nanos_per_pixel: f64) -> usize {
        self.suggest_from(0, nanos_per_pixel)
    }

    /// Like `suggest_screen_scale`, but never finer than the scale of the
    /// full frame the interval is patched into.
    pub fn suggest_interval_screen_scale(
        &self,
        nanos_per_pixel: f64,
        current_screen_scale_index: usize,
    ) -> usize {
        self.suggest_from(current_screen_scale_index, nanos_per_pixel)
    }

    fn suggest_from(&self, start_index: usize, nanos_per_pixel: f64) -> usize {
        let start = start_index.min(self.coarsest_index());
        for index in start..self.scales.len() {
            let estimate = self.scales[index].estimated_render_nanos(nanos_per_pixel);
            if estimate <= self.target_render_nanos as f64 {
                return index;
            }
        }
        self.coarsest_index()
    }

    /// Union a canvas interval into every scale's pending set.
    pub fn request_interval(&mut self, interval: Interval) {
        if interval.is_empty() {
            return;
        }
        for pending in &mut self.pending_intervals {
            pending.push(interval);
        }
    }

    pub fn has_pending_intervals(&self) -> bool {
        self.pending_intervals
            .iter()
            .any(|pending| !pending.is_empty())
    }

    pub fn clear_requested_intervals(&mut self) {
        for pending in &mut self.pending_intervals {
            pending.clear();
        }
    }

    /// Re-queue the target interval of a cancelled or still-invalid pass
    /// into its scale's pending set so the dirty region is not lost.
    pub fn re_request(&mut self, data: &IntervalRenderData) {
        if data.target_interval.is_empty() {
            return;
        }
        self.pending_intervals[data.scale_index].push(data.target_interval);
    }

    /// Drain the requested scale's pending intervals into one consolidated
    /// work unit: their bounding box clamped to the canvas, the crop
    /// geometry at the interval scale, and the paste offset at the base
    /// (full-frame) scale.
    pub fn pull_interval_render_data(
        &mut self,
        requested_interval_scale_index: usize,
        base_screen_scale_index: usize,
    ) -> IntervalRenderData {
        let canvas = Interval::new(0, 0, self.canvas_width as i32, self.canvas_height as i32);
        let bounds = self.pending_intervals[requested_interval_scale_index]
            .drain(..)
            .fold(Interval::empty(), |acc, interval| acc.union(&interval))
            .intersection(&canvas);

        let interval_scale = self.scales[requested_interval_scale_index].scale();
        let base_scale = self.scales[base_screen_scale_index].scale();

        if bounds.is_empty() {
            return IntervalRenderData {
                target_interval: Interval::empty(),
                scale_index: requested_interval_scale_index,
                offset_x: 0,
                offset_y: 0,
                width: 0,
                height: 0,
                scale: interval_scale,
                tx: 0,
                ty: 0,
            };
        }

        let offset_x = (f64::from(bounds.min_x) * interval_scale).floor() as i32;
        let offset_y = (f64::from(bounds.min_y) * interval_scale).floor() as i32;
        let max_x = (f64::from(bounds.max_x) * interval_scale).ceil() as i32;
        let max_y = (f64::from(bounds.max_y) * interval_scale).ceil() as i32;

        IntervalRenderData {
            target_interval: bounds,
            scale_index: requested_interval_scale_index,
            offset_x,
            offset_y,
            width: (max_x - offset_x).max(1) as u32,
            height: (max_y - offset_y).max(1) as u32,
            scale: interval_scale,
            tx: (f64::from(bounds.min_x) * base_scale).floor() as i32,
            ty: (f64::from(bounds.min_y) * base_scale).floor() as i32,
        }
    }
}
