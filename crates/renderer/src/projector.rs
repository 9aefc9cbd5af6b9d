//! Volatile projectors.
//!
//! A projector produces one render pass into a destination image and reports
//! whether every sampled pixel came from authoritative data. Under volatile
//! access some pixels may be placeholders; the renderer keeps re-mapping the
//! same projector until the pass is valid. Cancellation is cooperative
//! through a shared `CancelToken`, checked once per image row.

use std::sync::{Arc, MutexGuard};
use std::thread;
use std::time::Instant;

use render_protocol::{CancelToken, RenderResult};
use view::{AccessMode, AffineTransform3d, Interpolation, RenderSource};

use crate::render_storage::{SlotBuffers, SourceRenderSlot, MASK_INVALID, MASK_VALID};

/// One rendering pass producer. `map` blocks; it returns `false` iff the
/// pass was cancelled (any other termination is a success, with `is_valid`
/// possibly false).
pub trait VolatileProjector: Send {
    fn map(&mut self, clear: bool) -> bool;

    fn cancel(&self);

    fn is_valid(&self) -> bool;

    fn last_frame_render_nanos(&self) -> u64;
}

/// Combines the per-source scratch buffers into the final ARGB image.
pub trait AccumulateProjector: Send {
    fn accumulate(&mut self, source_buffers: &[&[u32]], destination: &mut [u32]);
}

pub trait AccumulateProjectorFactory: Send + Sync {
    fn create_accumulate_projector(&self, num_sources: usize) -> Box<dyn AccumulateProjector>;
}

/// Default composition rule: per-channel saturating sum over all sources.
#[derive(Debug, Default)]
pub struct SumAccumulateProjectorFactory;

impl AccumulateProjectorFactory for SumAccumulateProjectorFactory {
    fn create_accumulate_projector(&self, _num_sources: usize) -> Box<dyn AccumulateProjector> {
        Box::new(SumAccumulateProjector)
    }
}

struct SumAccumulateProjector;

impl AccumulateProjector for SumAccumulateProjector {
    fn accumulate(&mut self, source_buffers: &[&[u32]], destination: &mut [u32]) {
        for (index, target) in destination.iter_mut().enumerate() {
            let mut alpha = 0u32;
            let mut red = 0u32;
            let mut green = 0u32;
            let mut blue = 0u32;
            for source in source_buffers {
                let argb = source[index];
                alpha += (argb >> 24) & 0xFF;
                red += (argb >> 16) & 0xFF;
                green += (argb >> 8) & 0xFF;
                blue += argb & 0xFF;
            }
            *target = (alpha.min(0xFF) << 24)
                | (red.min(0xFF) << 16)
                | (green.min(0xFF) << 8)
                | blue.min(0xFF);
        }
    }
}

enum PassOutcome {
    Completed { valid: bool },
    Cancelled,
}

struct RowsResult {
    cancelled: bool,
    num_invalid: u64,
}

/// Renders a single source into its storage slot.
///
/// The validity mask persists between passes: a pass only re-samples pixels
/// that previous passes could not fill with authoritative data, which is
/// what makes the repeated-pass refinement converge cheaply.
pub struct SourceVolatileProjector {
    source: Arc<dyn RenderSource>,
    slot: Arc<SourceRenderSlot>,
    screen_to_source: AffineTransform3d,
    level: usize,
    width: u32,
    height: u32,
    timepoint: u32,
    interpolation: Interpolation,
    access_mode: AccessMode,
    cancel: CancelToken,
}

impl SourceVolatileProjector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn RenderSource>,
        slot: Arc<SourceRenderSlot>,
        screen_to_source: AffineTransform3d,
        level: usize,
        width: u32,
        height: u32,
        timepoint: u32,
        interpolation: Interpolation,
        access_mode: AccessMode,
        cancel: CancelToken,
    ) -> Self {
        Self {
            source,
            slot,
            screen_to_source,
            level,
            width,
            height,
            timepoint,
            interpolation,
            access_mode,
            cancel,
        }
    }

    fn slot_guard(&self) -> MutexGuard<'_, SlotBuffers> {
        self.slot.lock()
    }

    fn render_pass(&mut self, clear: bool, num_tasks: usize) -> PassOutcome {
        let num_pixels = (self.width as usize) * (self.height as usize);
        if num_pixels == 0 {
            return PassOutcome::Completed { valid: true };
        }
        let width = self.width as usize;
        let mut buffers = self.slot.lock();
        assert!(
            buffers.argb.len() >= num_pixels,
            "render slot smaller than the requested pass"
        );
        let SlotBuffers { argb, mask } = &mut *buffers;
        let argb = &mut argb[..num_pixels];
        let mask = &mut mask[..num_pixels];
        if clear {
            mask.fill(MASK_INVALID);
        }

        let context = RowContext {
            source: self.source.as_ref(),
            screen_to_source: self.screen_to_source,
            level: self.level,
            timepoint: self.timepoint,
            interpolation: self.interpolation,
            access_mode: self.access_mode,
            cancel: &self.cancel,
            width,
        };

        let result = if num_tasks <= 1 || self.height <= 1 {
            render_rows(&context, 0, argb, mask)
        } else {
            let rows_per_task = (self.height as usize).div_ceil(num_tasks);
            let chunk_pixels = rows_per_task * width;
            thread::scope(|scope| {
                let mut workers = Vec::new();
                let argb_chunks = argb.chunks_mut(chunk_pixels);
                let mask_chunks = mask.chunks_mut(chunk_pixels);
                for (chunk_index, (argb_chunk, mask_chunk)) in
                    argb_chunks.zip(mask_chunks).enumerate()
                {
                    let context = &context;
                    let first_row = (chunk_index * rows_per_task) as u32;
                    workers.push(scope.spawn(move || {
                        render_rows(context, first_row, argb_chunk, mask_chunk)
                    }));
                }
                workers.into_iter().fold(
                    RowsResult {
                        cancelled: false,
                        num_invalid: 0,
                    },
                    |mut total, worker| {
                        let result = worker.join().expect("projector worker panicked");
                        total.cancelled |= result.cancelled;
                        total.num_invalid += result.num_invalid;
                        total
                    },
                )
            })
        };

        if result.cancelled {
            PassOutcome::Cancelled
        } else {
            PassOutcome::Completed {
                valid: result.num_invalid == 0,
            }
        }
    }
}

struct RowContext<'a> {
    source: &'a dyn RenderSource,
    screen_to_source: AffineTransform3d,
    level: usize,
    timepoint: u32,
    interpolation: Interpolation,
    access_mode: AccessMode,
    cancel: &'a CancelToken,
    width: usize,
}

fn render_rows(
    context: &RowContext<'_>,
    first_row: u32,
    argb: &mut [u32],
    mask: &mut [u8],
) -> RowsResult {
    let mut num_invalid = 0u64;
    for (row_offset, (argb_row, mask_row)) in argb
        .chunks_mut(context.width)
        .zip(mask.chunks_mut(context.width))
        .enumerate()
    {
        if context.cancel.is_cancelled() {
            return RowsResult {
                cancelled: true,
                num_invalid,
            };
        }
        let y = first_row + row_offset as u32;
        for (x, (pixel, pixel_mask)) in argb_row.iter_mut().zip(mask_row.iter_mut()).enumerate() {
            if *pixel_mask == MASK_VALID {
                continue;
            }
            let position = context
                .screen_to_source
                .apply([x as f64, f64::from(y), 0.0]);
            let sample = context.source.sample(
                context.level,
                position,
                context.timepoint,
                context.interpolation,
                context.access_mode,
            );
            *pixel = sample.argb;
            if sample.valid {
                *pixel_mask = MASK_VALID;
            } else {
                num_invalid += 1;
            }
        }
    }
    RowsResult {
        cancelled: false,
        num_invalid,
    }
}

/// Renders the whole visible-source set: one pass over every per-source
/// projector, then the accumulate step into the destination image.
pub struct CompositeVolatileProjector {
    source_projectors: Vec<SourceVolatileProjector>,
    destination: RenderResult,
    accumulate: Box<dyn AccumulateProjector>,
    num_tasks: usize,
    cancel: CancelToken,
    valid: bool,
    last_render_nanos: u64,
}

impl CompositeVolatileProjector {
    pub fn new(
        source_projectors: Vec<SourceVolatileProjector>,
        destination: RenderResult,
        accumulate: Box<dyn AccumulateProjector>,
        num_tasks: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            source_projectors,
            destination,
            accumulate,
            num_tasks,
            cancel,
            valid: false,
            last_render_nanos: 0,
        }
    }
}

impl VolatileProjector for CompositeVolatileProjector {
    fn map(&mut self, clear: bool) -> bool {
        let start = Instant::now();
        if self.cancel.is_cancelled() {
            self.last_render_nanos = start.elapsed().as_nanos() as u64;
            return false;
        }

        let mut all_valid = true;
        for projector in &mut self.source_projectors {
            match projector.render_pass(clear, self.num_tasks) {
                PassOutcome::Cancelled => {
                    self.last_render_nanos = start.elapsed().as_nanos() as u64;
                    return false;
                }
                PassOutcome::Completed { valid } => all_valid &= valid,
            }
        }

        let projectors = &self.source_projectors;
        let accumulate = &mut self.accumulate;
        self.destination.with_image_mut(|image| {
            let num_pixels = image.num_pixels() as usize;
            let destination = &mut image.data_mut()[..num_pixels];
            if projectors.is_empty() {
                destination.fill(0);
            } else {
                let guards: Vec<_> = projectors
                    .iter()
                    .map(|projector| projector.slot_guard())
                    .collect();
                let views: Vec<&[u32]> = guards.iter().map(|guard| &guard.argb[..num_pixels]).collect();
                accumulate.accumulate(&views, destination);
            }
        });

        self.valid = all_valid;
        self.last_render_nanos = start.elapsed().as_nanos() as u64;
        true
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn last_frame_render_nanos(&self) -> u64 {
        self.last_render_nanos
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use view::VolatileSample;

    use super::*;
    use crate::render_storage::RenderStorage;

    /// Uniform color; left half reports placeholder data until `complete`
    /// is flipped. Counts every sample call.
    #[derive(Debug)]
    struct HalfValidSource {
        argb: u32,
        complete: AtomicBool,
        samples: AtomicUsize,
    }

    impl HalfValidSource {
        fn new(argb: u32) -> Self {
            Self {
                argb,
                complete: AtomicBool::new(false),
                samples: AtomicUsize::new(0),
            }
        }
    }

    impl RenderSource for HalfValidSource {
        fn is_present(&self, _timepoint: u32) -> bool {
            true
        }

        fn num_mipmap_levels(&self) -> usize {
            1
        }

        fn mipmap_transform(&self, _level: usize) -> AffineTransform3d {
            AffineTransform3d::identity()
        }

        fn sample(
            &self,
            _level: usize,
            position: [f64; 3],
            _timepoint: u32,
            _interpolation: Interpolation,
            _mode: AccessMode,
        ) -> VolatileSample {
            self.samples.fetch_add(1, Ordering::Relaxed);
            if self.complete.load(Ordering::Relaxed) || position[0] >= 4.0 {
                VolatileSample::valid(self.argb)
            } else {
                VolatileSample::placeholder(0)
            }
        }
    }

    fn projector_for(
        source: Arc<dyn RenderSource>,
        width: u32,
        height: u32,
        num_tasks: usize,
        cancel: CancelToken,
    ) -> (CompositeVolatileProjector, RenderResult, RenderStorage) {
        let mut storage = RenderStorage::new();
        storage.check_renew_data(width, height, 1);
        let destination = RenderResult::new();
        destination.init(width, height);
        let source_projector = SourceVolatileProjector::new(
            source,
            storage.slot(0),
            AffineTransform3d::identity(),
            0,
            width,
            height,
            0,
            Interpolation::NearestNeighbor,
            AccessMode::Volatile,
            cancel.clone(),
        );
        let projector = CompositeVolatileProjector::new(
            vec![source_projector],
            destination.clone(),
            SumAccumulateProjectorFactory.create_accumulate_projector(1),
            num_tasks,
            cancel,
        );
        (projector, destination, storage)
    }

    #[test]
    fn repeated_passes_resample_only_invalid_pixels() {
        let source = Arc::new(HalfValidSource::new(0xFF00_1122));
        let (mut projector, destination, _storage) =
            projector_for(source.clone(), 8, 4, 1, CancelToken::new());

        assert!(projector.map(true));
        assert!(!projector.is_valid());
        assert_eq!(source.samples.load(Ordering::Relaxed), 32);

        // still incomplete: the invalid half is re-sampled, the valid half kept
        assert!(projector.map(false));
        assert!(!projector.is_valid());
        assert_eq!(source.samples.load(Ordering::Relaxed), 48);

        source.complete.store(true, Ordering::Relaxed);
        assert!(projector.map(false));
        assert!(projector.is_valid());
        assert_eq!(source.samples.load(Ordering::Relaxed), 64);

        destination.with_image(|image| {
            assert_eq!(image.get(0, 0), 0xFF00_1122);
            assert_eq!(image.get(7, 3), 0xFF00_1122);
        });
    }

    #[test]
    fn clear_discards_previously_valid_pixels() {
        let source = Arc::new(HalfValidSource::new(0xFF00_0000));
        source.complete.store(true, Ordering::Relaxed);
        let (mut projector, _destination, _storage) =
            projector_for(source.clone(), 4, 4, 1, CancelToken::new());

        assert!(projector.map(true));
        assert!(projector.map(true));
        // both passes sampled every pixel
        assert_eq!(source.samples.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn multithreaded_pass_matches_single_threaded_output() {
        let source = Arc::new(HalfValidSource::new(0xFF33_4455));
        source.complete.store(true, Ordering::Relaxed);
        let (mut projector, destination, _storage) =
            projector_for(source, 8, 16, 4, CancelToken::new());

        assert!(projector.map(true));
        assert!(projector.is_valid());
        destination.with_image(|image| {
            for y in 0..16 {
                for x in 0..8 {
                    assert_eq!(image.get(x, y), 0xFF33_4455);
                }
            }
        });
    }

    #[test]
    fn pre_cancelled_projector_refuses_to_map() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let source = Arc::new(HalfValidSource::new(0xFF00_0000));
        let (mut projector, _destination, _storage) = projector_for(source, 4, 4, 1, cancel);

        assert!(!projector.map(true));
    }

    /// Cancels its own token part-way through the pass.
    #[derive(Debug)]
    struct SelfCancellingSource {
        cancel: CancelToken,
        cancel_after: usize,
        samples: AtomicUsize,
    }

    impl RenderSource for SelfCancellingSource {
        fn is_present(&self, _timepoint: u32) -> bool {
            true
        }

        fn num_mipmap_levels(&self) -> usize {
            1
        }

        fn mipmap_transform(&self, _level: usize) -> AffineTransform3d {
            AffineTransform3d::identity()
        }

        fn sample(
            &self,
            _level: usize,
            _position: [f64; 3],
            _timepoint: u32,
            _interpolation: Interpolation,
            _mode: AccessMode,
        ) -> VolatileSample {
            if self.samples.fetch_add(1, Ordering::Relaxed) + 1 >= self.cancel_after {
                self.cancel.cancel();
            }
            VolatileSample::valid(0xFFFF_FFFF)
        }
    }

    #[test]
    fn cancellation_mid_pass_reports_failure() {
        let cancel = CancelToken::new();
        let source = Arc::new(SelfCancellingSource {
            cancel: cancel.clone(),
            cancel_after: 4,
            samples: AtomicUsize::new(0),
        });
        let (mut projector, _destination, _storage) = projector_for(source.clone(), 4, 8, 1, cancel);

        assert!(!projector.map(true));
        // cancelled at a row boundary, long before the full 32 pixels
        assert!(source.samples.load(Ordering::Relaxed) < 32);
    }

    #[test]
    fn empty_source_set_renders_a_cleared_valid_frame() {
        let destination = RenderResult::new();
        destination.init(4, 4);
        destination.with_image_mut(|image| image.data_mut().fill(0xDEAD_BEEF));
        let mut projector = CompositeVolatileProjector::new(
            Vec::new(),
            destination.clone(),
            SumAccumulateProjectorFactory.create_accumulate_projector(0),
            1,
            CancelToken::new(),
        );

        assert!(projector.map(true));
        assert!(projector.is_valid());
        destination.with_image(|image| assert_eq!(image.get(2, 2), 0));
    }

    #[test]
    fn sum_accumulate_saturates_per_channel() {
        let mut accumulate = SumAccumulateProjectorFactory.create_accumulate_projector(2);
        let first = [0xC0C0_C0C0u32];
        let second = [0x80FF_2010u32];
        let mut destination = [0u32];

        accumulate.accumulate(&[&first, &second], &mut destination);
        assert_eq!(destination[0], 0xFFFF_E0D0);
    }
}
