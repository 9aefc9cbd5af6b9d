//! Viewer-state model.
//!
//! This crate defines the immutable snapshot the renderer consumes
//! (`ViewerSnapshot`), the mutable state it is taken from (`ViewerState`),
//! and the source-data access contract (`RenderSource`).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use slotmap::SlotMap;

mod transform;

pub use transform::AffineTransform3d;

slotmap::new_key_type! {
    pub struct SourceId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    NearestNeighbor,
    NLinear,
}

/// How a source is asked for data.
///
/// `Volatile` access returns immediately and may hand back placeholder data
/// (`valid == false`) while blocks are fetched asynchronously. `Blocking`
/// access waits for authoritative data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Volatile,
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatileSample {
    pub argb: u32,
    pub valid: bool,
}

impl VolatileSample {
    pub fn valid(argb: u32) -> Self {
        Self { argb, valid: true }
    }

    pub fn placeholder(argb: u32) -> Self {
        Self { argb, valid: false }
    }
}

/// Access contract for one N-dimensional image source backed by a mipmap
/// pyramid. Level 0 is the finest resolution; transforms map level-local
/// coordinates into global space.
pub trait RenderSource: fmt::Debug + Send + Sync {
    fn is_present(&self, timepoint: u32) -> bool;

    fn num_mipmap_levels(&self) -> usize;

    fn mipmap_transform(&self, level: usize) -> AffineTransform3d;

    fn sample(
        &self,
        level: usize,
        position: [f64; 3],
        timepoint: u32,
        interpolation: Interpolation,
        mode: AccessMode,
    ) -> VolatileSample;
}

#[derive(Debug)]
struct SourceEntry {
    source: Arc<dyn RenderSource>,
    active: bool,
}

/// Mutable viewer state. Clients mutate it through `SharedViewerState`; the
/// renderer only ever sees immutable `ViewerSnapshot`s taken from it.
#[derive(Debug)]
pub struct ViewerState {
    sources: SlotMap<SourceId, SourceEntry>,
    source_order: Vec<SourceId>,
    viewer_transform: AffineTransform3d,
    timepoint: u32,
    interpolation: Interpolation,
}

impl Default for ViewerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewerState {
    pub fn new() -> Self {
        Self {
            sources: SlotMap::with_key(),
            source_order: Vec::new(),
            viewer_transform: AffineTransform3d::identity(),
            timepoint: 0,
            interpolation: Interpolation::NearestNeighbor,
        }
    }

    pub fn add_source(&mut self, source: Arc<dyn RenderSource>) -> SourceId {
        let id = self.sources.insert(SourceEntry {
            source,
            active: true,
        });
        self.source_order.push(id);
        id
    }

    pub fn remove_source(&mut self, id: SourceId) -> bool {
        if self.sources.remove(id).is_none() {
            return false;
        }
        self.source_order.retain(|existing| *existing != id);
        true
    }

    pub fn num_sources(&self) -> usize {
        self.source_order.len()
    }

    /// Returns false if the source is unknown.
    pub fn set_source_active(&mut self, id: SourceId, active: bool) -> bool {
        match self.sources.get_mut(id) {
            Some(entry) => {
                entry.active = active;
                true
            }
            None => false,
        }
    }

    pub fn is_source_active(&self, id: SourceId) -> bool {
        self.sources.get(id).is_some_and(|entry| entry.active)
    }

    pub fn set_viewer_transform(&mut self, transform: AffineTransform3d) {
        self.viewer_transform = transform;
    }

    pub fn viewer_transform(&self) -> AffineTransform3d {
        self.viewer_transform
    }

    pub fn set_timepoint(&mut self, timepoint: u32) {
        self.timepoint = timepoint;
    }

    pub fn timepoint(&self) -> u32 {
        self.timepoint
    }

    pub fn set_interpolation(&mut self, interpolation: Interpolation) {
        self.interpolation = interpolation;
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    /// Immutable copy for one rendered frame. Only sources that are both
    /// active and present at the current timepoint are included.
    pub fn snapshot(&self) -> ViewerSnapshot {
        let visible = self
            .source_order
            .iter()
            .filter_map(|id| {
                let entry = self.sources.get(*id)?;
                (entry.active && entry.source.is_present(self.timepoint)).then(|| VisibleSource {
                    id: *id,
                    source: Arc::clone(&entry.source),
                })
            })
            .collect::<Vec<_>>();

        ViewerSnapshot {
            viewer_transform: self.viewer_transform,
            timepoint: self.timepoint,
            interpolation: self.interpolation,
            sources: visible.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisibleSource {
    pub id: SourceId,
    pub source: Arc<dyn RenderSource>,
}

/// Immutable per-frame snapshot of the viewer state.
#[derive(Debug, Clone)]
pub struct ViewerSnapshot {
    viewer_transform: AffineTransform3d,
    timepoint: u32,
    interpolation: Interpolation,
    sources: Arc<[VisibleSource]>,
}

impl ViewerSnapshot {
    pub fn viewer_transform(&self) -> AffineTransform3d {
        self.viewer_transform
    }

    pub fn timepoint(&self) -> u32 {
        self.timepoint
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn visible_and_present_sources(&self) -> &[VisibleSource] {
        &self.sources
    }

    /// Picks the mipmap level to render `source_index` with under
    /// `screen_transform` (global-to-screen, screen scale already applied):
    /// the coarsest level whose voxels still cover at most one screen pixel,
    /// or the finest level when even that one is magnified.
    pub fn best_mipmap_level(
        &self,
        screen_transform: &AffineTransform3d,
        source_index: usize,
    ) -> usize {
        let source = &self.sources[source_index].source;
        let num_levels = source.num_mipmap_levels().max(1);

        let mut best = 0;
        for level in 0..num_levels {
            let mut source_to_screen = *screen_transform;
            source_to_screen.concatenate(&source.mipmap_transform(level));
            let voxel_screen_size = (0..3)
                .map(|axis| source_to_screen.axis_scale(axis))
                .fold(0.0, f64::max);
            if voxel_screen_size <= 1.0 {
                best = level;
            } else {
                break;
            }
        }
        best
    }
}

/// Capability to take a viewer snapshot; implemented by `SharedViewerState`
/// and by test fixtures.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> ViewerSnapshot;
}

/// Thread-safe handle to a `ViewerState`, shared between client threads
/// (mutations) and the painter thread (snapshots).
#[derive(Clone)]
pub struct SharedViewerState {
    inner: Arc<Mutex<ViewerState>>,
}

impl SharedViewerState {
    pub fn new(state: ViewerState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ViewerState> {
        self.inner.lock().expect("viewer state lock poisoned")
    }
}

impl Default for SharedViewerState {
    fn default() -> Self {
        Self::new(ViewerState::new())
    }
}

impl SnapshotSource for SharedViewerState {
    fn snapshot(&self) -> ViewerSnapshot {
        self.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct PyramidSource {
        levels: usize,
        present_from: u32,
    }

    impl RenderSource for PyramidSource {
        fn is_present(&self, timepoint: u32) -> bool {
            timepoint >= self.present_from
        }

        fn num_mipmap_levels(&self) -> usize {
            self.levels
        }

        fn mipmap_transform(&self, level: usize) -> AffineTransform3d {
            let scale = (1 << level) as f64;
            AffineTransform3d::scaling(scale, scale, scale)
        }

        fn sample(
            &self,
            _level: usize,
            _position: [f64; 3],
            _timepoint: u32,
            _interpolation: Interpolation,
            _mode: AccessMode,
        ) -> VolatileSample {
            VolatileSample::valid(0xFF00_0000)
        }
    }

    fn pyramid(levels: usize) -> Arc<dyn RenderSource> {
        Arc::new(PyramidSource {
            levels,
            present_from: 0,
        })
    }

    #[test]
    fn snapshot_contains_only_active_and_present_sources() {
        let mut state = ViewerState::new();
        let visible = state.add_source(pyramid(1));
        let inactive = state.add_source(pyramid(1));
        let absent = state.add_source(Arc::new(PyramidSource {
            levels: 1,
            present_from: 5,
        }));
        state.set_source_active(inactive, false);

        let snapshot = state.snapshot();
        let ids = snapshot
            .visible_and_present_sources()
            .iter()
            .map(|vs| vs.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![visible]);
        assert!(!ids.contains(&absent));
    }

    #[test]
    fn snapshot_is_unaffected_by_later_mutations() {
        let mut state = ViewerState::new();
        state.add_source(pyramid(1));
        state.set_timepoint(3);

        let snapshot = state.snapshot();
        state.set_timepoint(9);
        state.add_source(pyramid(1));

        assert_eq!(snapshot.timepoint(), 3);
        assert_eq!(snapshot.visible_and_present_sources().len(), 1);
    }

    #[test]
    fn removed_source_leaves_the_ordering() {
        let mut state = ViewerState::new();
        let first = state.add_source(pyramid(1));
        let second = state.add_source(pyramid(1));

        assert!(state.remove_source(first));
        assert!(!state.remove_source(first));

        let snapshot = state.snapshot();
        let ids = snapshot
            .visible_and_present_sources()
            .iter()
            .map(|vs| vs.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![second]);
        assert_eq!(state.num_sources(), 1);
    }

    #[test]
    fn best_mipmap_level_picks_coarsest_non_blocky_level() {
        let mut state = ViewerState::new();
        state.add_source(pyramid(4));
        let snapshot = state.snapshot();

        // Zoomed out 8x: levels 0..3 cover 1/8, 1/4, 1/2, 1 screen pixel.
        let zoomed_out = AffineTransform3d::scaling(0.125, 0.125, 0.125);
        assert_eq!(snapshot.best_mipmap_level(&zoomed_out, 0), 3);

        // Zoomed in: even the finest level is magnified.
        let zoomed_in = AffineTransform3d::scaling(4.0, 4.0, 4.0);
        assert_eq!(snapshot.best_mipmap_level(&zoomed_in, 0), 0);

        // 1:1 view: finest level maps one voxel to one pixel.
        let unit = AffineTransform3d::identity();
        assert_eq!(snapshot.best_mipmap_level(&unit, 0), 0);
    }
}
