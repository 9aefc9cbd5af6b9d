use std::sync::{Arc, Mutex, MutexGuard};

use view::AffineTransform3d;

use crate::Interval;

/// CPU-side ARGB (0xAARRGGBB) image buffer.
#[derive(Debug, Clone, Default)]
pub struct ArgbImage {
    width: u32,
    height: u32,
    data: Vec<u32>,
}

impl ArgbImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width as usize) * (height as usize)],
        }
    }

    /// Resize, reusing the allocation where possible. Contents of retained
    /// pixels are unspecified afterwards; producers overwrite every pixel.
    pub fn init(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.data.resize((width as usize) * (height as usize), 0);
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn num_pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn data(&self) -> &[u32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u32] {
        &mut self.data
    }

    pub fn get(&self, x: u32, y: u32) -> u32 {
        self.data[(y as usize) * (self.width as usize) + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, argb: u32) {
        self.data[(y as usize) * (self.width as usize) + x as usize] = argb;
    }
}

#[derive(Debug)]
struct RenderResultState {
    image: ArgbImage,
    scale_factor: f64,
    viewer_transform: AffineTransform3d,
    updated: bool,
}

/// One rendered frame (or interval crop): the screen image, the scale factor
/// it was rendered at, and the viewer transform it was produced under.
///
/// This is a cheap-clone shared handle. The renderer keeps one clone for
/// in-place interval patching while the display holds another for blitting;
/// the interior mutex makes each operation atomic.
#[derive(Debug, Clone)]
pub struct RenderResult {
    shared: Arc<Mutex<RenderResultState>>,
}

impl RenderResult {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(RenderResultState {
                image: ArgbImage::default(),
                scale_factor: 1.0,
                viewer_transform: AffineTransform3d::identity(),
                updated: false,
            })),
        }
    }

    /// Two handles are the same result iff they share storage.
    pub fn ptr_eq(&self, other: &RenderResult) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn state(&self) -> MutexGuard<'_, RenderResultState> {
        self.shared.lock().expect("render result lock poisoned")
    }

    /// Prepare for a new pass at the given screen-image size.
    pub fn init(&self, width: u32, height: u32) {
        let mut state = self.state();
        state.image.init(width, height);
        state.updated = false;
    }

    pub fn width(&self) -> u32 {
        self.state().image.width()
    }

    pub fn height(&self) -> u32 {
        self.state().image.height()
    }

    pub fn num_pixels(&self) -> u64 {
        self.state().image.num_pixels()
    }

    pub fn set_scale_factor(&self, scale_factor: f64) {
        self.state().scale_factor = scale_factor;
    }

    pub fn scale_factor(&self) -> f64 {
        self.state().scale_factor
    }

    pub fn set_viewer_transform(&self, transform: AffineTransform3d) {
        self.state().viewer_transform = transform;
    }

    pub fn viewer_transform(&self) -> AffineTransform3d {
        self.state().viewer_transform
    }

    pub fn set_updated(&self) {
        self.state().updated = true;
    }

    pub fn is_updated(&self) -> bool {
        self.state().updated
    }

    /// Consume the updated marker; the display calls this when deciding
    /// whether to blit.
    pub fn take_updated(&self) -> bool {
        let mut state = self.state();
        std::mem::take(&mut state.updated)
    }

    /// Run `f` with exclusive access to the screen image. Projectors write
    /// their accumulated output through this.
    pub fn with_image_mut<R>(&self, f: impl FnOnce(&mut ArgbImage) -> R) -> R {
        f(&mut self.state().image)
    }

    pub fn with_image<R>(&self, f: impl FnOnce(&ArgbImage) -> R) -> R {
        f(&self.state().image)
    }

    /// Copy `source` (an interval render at a coarser or equal scale) into
    /// this result, nearest-neighbor scaled, clipped to `target_interval`
    /// (canvas coordinates) and to both images' bounds. `(tx, ty)` is the
    /// paste origin in this result's pixel coordinates.
    pub fn patch(&self, source: &RenderResult, target_interval: Interval, tx: i32, ty: i32) {
        if target_interval.is_empty() {
            return;
        }
        let source_state = source.state();
        let mut state = self.state();
        if state.scale_factor <= 0.0 || source_state.scale_factor <= 0.0 {
            return;
        }

        let source_width = source_state.image.width() as i64;
        let source_height = source_state.image.height() as i64;
        if source_width == 0 || source_height == 0 {
            return;
        }

        let relative_scale = source_state.scale_factor / state.scale_factor;
        let min_px = ((f64::from(target_interval.min_x)) * state.scale_factor).floor() as i64;
        let min_py = ((f64::from(target_interval.min_y)) * state.scale_factor).floor() as i64;
        let max_px = ((f64::from(target_interval.max_x)) * state.scale_factor).ceil() as i64;
        let max_py = ((f64::from(target_interval.max_y)) * state.scale_factor).ceil() as i64;

        let min_px = min_px.max(0);
        let min_py = min_py.max(0);
        let max_px = max_px.min(i64::from(state.image.width()));
        let max_py = max_py.min(i64::from(state.image.height()));
        if min_px >= max_px || min_py >= max_py {
            return;
        }

        for py in min_py..max_py {
            let sy = (((py - i64::from(ty)) as f64) * relative_scale).floor() as i64;
            let sy = sy.clamp(0, source_height - 1) as u32;
            for px in min_px..max_px {
                let sx = (((px - i64::from(tx)) as f64) * relative_scale).floor() as i64;
                let sx = sx.clamp(0, source_width - 1) as u32;
                let argb = source_state.image.get(sx, sy);
                state.image.set(px as u32, py as u32, argb);
            }
        }
        state.updated = true;
    }
}

impl Default for RenderResult {
    fn default() -> Self {
        Self::new()
    }
}
