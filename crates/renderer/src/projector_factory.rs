//! Builds composite projectors for viewer snapshots.

use log::warn;
use render_protocol::{CancelToken, RenderResult};
use view::{AccessMode, AffineTransform3d, ViewerSnapshot};

use crate::projector::{
    AccumulateProjectorFactory, CompositeVolatileProjector, SourceVolatileProjector,
    VolatileProjector,
};
use crate::render_storage::RenderStorage;

/// Creates projectors that render a viewer snapshot into a destination
/// image. `screen_transform` is the global-to-screen-image transform with
/// the screen scale already pre-concatenated (and offset-translated for
/// interval crops).
pub trait ProjectorFactory: Send {
    fn create_projector(
        &self,
        snapshot: &ViewerSnapshot,
        destination: RenderResult,
        screen_transform: AffineTransform3d,
        storage: &mut RenderStorage,
        cancel: CancelToken,
    ) -> Box<dyn VolatileProjector>;

    /// Whether the renderer should request a whole new frame (with
    /// `prepare_next_frame`) when a pass completes with invalid data,
    /// instead of re-mapping the same projector.
    fn request_new_frame_if_incomplete(&self) -> bool;
}

pub struct StandardProjectorFactory {
    num_rendering_threads: usize,
    use_volatile_if_available: bool,
    accumulate_factory: Box<dyn AccumulateProjectorFactory>,
}

impl StandardProjectorFactory {
    pub fn new(
        num_rendering_threads: usize,
        use_volatile_if_available: bool,
        accumulate_factory: Box<dyn AccumulateProjectorFactory>,
    ) -> Self {
        Self {
            num_rendering_threads: num_rendering_threads.max(1),
            use_volatile_if_available,
            accumulate_factory,
        }
    }
}

impl ProjectorFactory for StandardProjectorFactory {
    fn create_projector(
        &self,
        snapshot: &ViewerSnapshot,
        destination: RenderResult,
        screen_transform: AffineTransform3d,
        storage: &mut RenderStorage,
        cancel: CancelToken,
    ) -> Box<dyn VolatileProjector> {
        let width = destination.width();
        let height = destination.height();
        let sources = snapshot.visible_and_present_sources();

        // Interval crops can exceed the pooled dimensions by a rounding
        // pixel; grow the pool rather than assuming the caller sized it.
        storage.check_renew_data(
            width.max(storage.width()),
            height.max(storage.height()),
            sources.len(),
        );

        let access_mode = if self.use_volatile_if_available {
            AccessMode::Volatile
        } else {
            AccessMode::Blocking
        };

        let mut source_projectors = Vec::with_capacity(sources.len());
        for (source_index, visible) in sources.iter().enumerate() {
            let level = snapshot.best_mipmap_level(&screen_transform, source_index);
            let mut source_to_screen = screen_transform;
            source_to_screen.concatenate(&visible.source.mipmap_transform(level));
            let Some(screen_to_source) = source_to_screen.invert() else {
                warn!("skipping source with singular screen transform at mipmap level {level}");
                continue;
            };
            source_projectors.push(SourceVolatileProjector::new(
                visible.source.clone(),
                storage.slot(source_index),
                screen_to_source,
                level,
                width,
                height,
                snapshot.timepoint(),
                snapshot.interpolation(),
                access_mode,
                cancel.clone(),
            ));
        }

        let accumulate = self
            .accumulate_factory
            .create_accumulate_projector(source_projectors.len());
        Box::new(CompositeVolatileProjector::new(
            source_projectors,
            destination,
            accumulate,
            self.num_rendering_threads,
            cancel,
        ))
    }

    fn request_new_frame_if_incomplete(&self) -> bool {
        // Without volatile access an incomplete pass cannot heal by
        // re-mapping the same frame; only a new frame with a fresh fetch
        // cycle can.
        !self.use_volatile_if_available
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use view::{Interpolation, RenderSource, ViewerState, VolatileSample};

    use crate::projector::SumAccumulateProjectorFactory;

    use super::*;

    #[derive(Debug)]
    struct RecordingSource {
        levels: usize,
        level_scale_step: f64,
        argb: u32,
        sampled_levels: Mutex<Vec<usize>>,
        samples: AtomicUsize,
    }

    impl RecordingSource {
        fn new(levels: usize, argb: u32) -> Self {
            Self {
                levels,
                level_scale_step: 2.0,
                argb,
                sampled_levels: Mutex::new(Vec::new()),
                samples: AtomicUsize::new(0),
            }
        }
    }

    impl RenderSource for RecordingSource {
        fn is_present(&self, _timepoint: u32) -> bool {
            true
        }

        fn num_mipmap_levels(&self) -> usize {
            self.levels
        }

        fn mipmap_transform(&self, level: usize) -> AffineTransform3d {
            let scale = self.level_scale_step.powi(level as i32);
            AffineTransform3d::scaling(scale, scale, scale)
        }

        fn sample(
            &self,
            level: usize,
            _position: [f64; 3],
            _timepoint: u32,
            _interpolation: Interpolation,
            _mode: AccessMode,
        ) -> VolatileSample {
            if self.samples.fetch_add(1, Ordering::Relaxed) == 0 {
                self.sampled_levels.lock().unwrap().push(level);
            }
            VolatileSample::valid(self.argb)
        }
    }

    fn factory() -> StandardProjectorFactory {
        StandardProjectorFactory::new(1, true, Box::new(SumAccumulateProjectorFactory))
    }

    #[test]
    fn builds_projector_that_renders_all_visible_sources() {
        let mut state = ViewerState::new();
        state.add_source(Arc::new(RecordingSource::new(1, 0x0100_0000)));
        state.add_source(Arc::new(RecordingSource::new(1, 0x0200_0000)));
        let snapshot = state.snapshot();

        let destination = RenderResult::new();
        destination.init(4, 4);
        let mut storage = RenderStorage::new();
        let mut projector = factory().create_projector(
            &snapshot,
            destination.clone(),
            AffineTransform3d::identity(),
            &mut storage,
            CancelToken::new(),
        );

        assert!(projector.map(true));
        assert!(projector.is_valid());
        destination.with_image(|image| assert_eq!(image.get(0, 0), 0x0300_0000));
    }

    #[test]
    fn zoomed_out_view_samples_a_coarser_mipmap_level() {
        let source = Arc::new(RecordingSource::new(4, 0xFF00_0000));
        let mut state = ViewerState::new();
        state.add_source(source.clone());
        let snapshot = state.snapshot();

        let destination = RenderResult::new();
        destination.init(4, 4);
        let mut storage = RenderStorage::new();

        // Zoomed out 4x: level 2 voxels land on exactly one screen pixel.
        let screen_transform = AffineTransform3d::scaling(0.25, 0.25, 0.25);
        let mut projector = factory().create_projector(
            &snapshot,
            destination,
            screen_transform,
            &mut storage,
            CancelToken::new(),
        );
        assert!(projector.map(true));

        assert_eq!(*source.sampled_levels.lock().unwrap(), vec![2]);
    }

    #[test]
    fn singular_source_transform_is_skipped_not_fatal() {
        #[derive(Debug)]
        struct FlatSource;

        impl RenderSource for FlatSource {
            fn is_present(&self, _timepoint: u32) -> bool {
                true
            }

            fn num_mipmap_levels(&self) -> usize {
                1
            }

            fn mipmap_transform(&self, _level: usize) -> AffineTransform3d {
                AffineTransform3d::scaling(1.0, 0.0, 1.0)
            }

            fn sample(
                &self,
                _level: usize,
                _position: [f64; 3],
                _timepoint: u32,
                _interpolation: Interpolation,
                _mode: AccessMode,
            ) -> VolatileSample {
                VolatileSample::valid(0xFFFF_FFFF)
            }
        }

        let mut state = ViewerState::new();
        state.add_source(Arc::new(FlatSource));
        let snapshot = state.snapshot();

        let destination = RenderResult::new();
        destination.init(2, 2);
        destination.with_image_mut(|image| image.data_mut().fill(0xAAAA_AAAA));
        let mut storage = RenderStorage::new();
        let mut projector = factory().create_projector(
            &snapshot,
            destination.clone(),
            AffineTransform3d::identity(),
            &mut storage,
            CancelToken::new(),
        );

        assert!(projector.map(true));
        assert!(projector.is_valid());
        // no sources survived; the frame is cleared
        destination.with_image(|image| assert_eq!(image.get(0, 0), 0));
    }

    #[test]
    fn incomplete_frame_policy_follows_volatile_configuration() {
        assert!(!factory().request_new_frame_if_incomplete());
        let blocking =
            StandardProjectorFactory::new(1, false, Box::new(SumAccumulateProjectorFactory));
        assert!(blocking.request_new_frame_if_incomplete());
    }
}
