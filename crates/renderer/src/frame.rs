//! Frame scheduling state that does not touch the GPU.
//!
//! - [`FrameScheduler`] cycles the frame slots, carries the skip-next-frame
//!   flag raised by reassignment and turns acquire and present outcomes
//!   into a [`FrameStep`]
//! - [`StaticUboTracker`] decides which images need a fresh copy of the
//!   static UBO
//! - [`fit_extent_height`] caps the render resolution

use ash::vk;
use tracing::debug;

use renderer_rhi::swapchain::{Acquire, SurfaceStatus};
use renderer_rhi::sync::MAX_CONCURRENT_FRAMES;
use renderer_rhi::{RhiError, RhiResult};

/// What the frame loop does after an acquire or a present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
    /// Record and submit into this image.
    Render(usize),
    /// The frame was queued for display and the slot moved on.
    Presented,
    /// The surface went stale. The next frame is already skipped; the
    /// caller waits for the device and rebuilds.
    Invalidate,
}

/// Round-robin frame slot counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameScheduler {
    slot: usize,
    slot_count: usize,
    skip_next: bool,
}

impl FrameScheduler {
    /// Scheduler over `slot_count` slots, at least one.
    pub fn new(slot_count: usize) -> Self {
        Self {
            slot: 0,
            slot_count: slot_count.max(1),
            skip_next: false,
        }
    }

    /// Slot whose semaphores the next frame uses.
    #[inline]
    pub fn current_slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Makes the next [`begin_frame`](Self::begin_frame) return `false`.
    pub fn skip_next_frame(&mut self) {
        self.skip_next = true;
    }

    #[inline]
    pub fn is_skipping(&self) -> bool {
        self.skip_next
    }

    /// Whether a frame may be rendered now. Consumes a pending skip.
    pub fn begin_frame(&mut self) -> bool {
        !std::mem::take(&mut self.skip_next)
    }

    /// Moves on to the next slot after a presented frame.
    pub fn advance(&mut self) {
        self.slot = (self.slot + 1) % self.slot_count;
    }

    /// Handles the outcome of acquiring an image of a surface with
    /// `image_count` images.
    ///
    /// A suboptimal image is still rendered; present reports it again.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the index is out of range.
    pub fn on_acquire(&mut self, acquired: Acquire, image_count: usize) -> RhiResult<FrameStep> {
        match acquired {
            Acquire::Image { index, suboptimal } => {
                if index as usize >= image_count {
                    return Err(RhiError::InvalidState(format!(
                        "acquired image {} of {}",
                        index, image_count
                    )));
                }
                if suboptimal {
                    debug!("Acquired image {} is suboptimal", index);
                }
                Ok(FrameStep::Render(index as usize))
            }
            Acquire::OutOfDate => {
                self.skip_next_frame();
                Ok(FrameStep::Invalidate)
            }
        }
    }

    /// Handles the outcome of presenting the current slot's frame.
    ///
    /// Only an optimal present advances the slot.
    pub fn on_present(&mut self, status: SurfaceStatus) -> FrameStep {
        match status {
            SurfaceStatus::Optimal => {
                self.advance();
                FrameStep::Presented
            }
            SurfaceStatus::Suboptimal | SurfaceStatus::OutOfDate => {
                self.skip_next_frame();
                FrameStep::Invalidate
            }
        }
    }
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new(MAX_CONCURRENT_FRAMES)
    }
}

/// Write counters of the base static UBO and of each image's copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticUboTracker {
    base: u64,
    images: Vec<Option<u64>>,
}

impl StaticUboTracker {
    /// Marks every image of a freshly assigned surface as stale.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images = vec![None; image_count];
    }

    /// Records a write to the base copy.
    pub fn bump(&mut self) {
        self.base = self.base.wrapping_add(1);
    }

    #[inline]
    pub fn base_counter(&self) -> u64 {
        self.base
    }

    /// Whether `image` has not seen the latest base write.
    pub fn is_stale(&self, image: usize) -> bool {
        self.images
            .get(image)
            .is_none_or(|counter| *counter != Some(self.base))
    }

    /// Records that `image` now holds the latest base contents.
    pub fn mark_current(&mut self, image: usize) {
        if let Some(counter) = self.images.get_mut(image) {
            *counter = Some(self.base);
        }
    }
}

/// Scales `extent` down so that its height does not exceed
/// `max_height`, keeping the aspect ratio.
pub fn fit_extent_height(max_height: u32, extent: vk::Extent2D) -> vk::Extent2D {
    if extent.height <= max_height || extent.height == 0 {
        return extent;
    }
    let height = max_height.max(1);
    let width = u64::from(extent.width) * u64::from(height) / u64::from(extent.height);
    vk::Extent2D {
        width: (width as u32).max(1),
        height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_cycles_slots() {
        let mut scheduler = FrameScheduler::new(3);
        let slots: Vec<usize> = (0..7)
            .map(|_| {
                let slot = scheduler.current_slot();
                scheduler.advance();
                slot
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_scheduler_skips_once() {
        let mut scheduler = FrameScheduler::default();
        assert!(scheduler.begin_frame());
        scheduler.skip_next_frame();
        assert!(scheduler.is_skipping());
        assert!(!scheduler.begin_frame());
        assert!(scheduler.begin_frame());
    }

    #[test]
    fn test_acquire_renders_suboptimal_image() {
        let mut scheduler = FrameScheduler::new(3);
        let step = scheduler
            .on_acquire(
                Acquire::Image {
                    index: 2,
                    suboptimal: true,
                },
                3,
            )
            .unwrap();
        assert_eq!(step, FrameStep::Render(2));
        assert!(!scheduler.is_skipping());
    }

    #[test]
    fn test_acquire_out_of_date_skips_next_frame() {
        let mut scheduler = FrameScheduler::new(3);
        let step = scheduler.on_acquire(Acquire::OutOfDate, 3).unwrap();
        assert_eq!(step, FrameStep::Invalidate);
        assert_eq!(scheduler.current_slot(), 0);
        assert!(!scheduler.begin_frame());
    }

    #[test]
    fn test_acquire_index_out_of_range() {
        let mut scheduler = FrameScheduler::new(3);
        let result = scheduler.on_acquire(
            Acquire::Image {
                index: 3,
                suboptimal: false,
            },
            3,
        );
        assert!(matches!(result, Err(RhiError::InvalidState(_))));
    }

    #[test]
    fn test_present_advances_only_when_optimal() {
        let mut scheduler = FrameScheduler::new(3);
        assert_eq!(scheduler.on_present(SurfaceStatus::Optimal), FrameStep::Presented);
        assert_eq!(scheduler.current_slot(), 1);

        for status in [SurfaceStatus::Suboptimal, SurfaceStatus::OutOfDate] {
            assert_eq!(scheduler.on_present(status), FrameStep::Invalidate);
            assert_eq!(scheduler.current_slot(), 1);
            assert!(!scheduler.begin_frame());
        }
    }

    #[test]
    fn test_static_ubo_new_images_are_stale() {
        let mut tracker = StaticUboTracker::default();
        tracker.reset_images(3);
        assert!((0..3).all(|i| tracker.is_stale(i)));
        tracker.mark_current(1);
        assert!(!tracker.is_stale(1));
        assert!(tracker.is_stale(0));
    }

    #[test]
    fn test_static_ubo_double_write_single_copy() {
        let mut tracker = StaticUboTracker::default();
        tracker.reset_images(2);
        tracker.mark_current(0);

        tracker.bump();
        tracker.bump();
        let mut copies = 0;
        for _ in 0..2 {
            if tracker.is_stale(0) {
                copies += 1;
                tracker.mark_current(0);
            }
        }
        assert_eq!(copies, 1);
        assert_eq!(tracker.base_counter(), 2);
    }

    #[test]
    fn test_fit_extent_height() {
        let extent = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        assert_eq!(
            fit_extent_height(540, extent),
            vk::Extent2D {
                width: 960,
                height: 540
            }
        );
        assert_eq!(fit_extent_height(65535, extent), extent);
        assert_eq!(fit_extent_height(1080, extent), extent);
    }

    #[test]
    fn test_fit_extent_height_degenerate() {
        let zero = vk::Extent2D {
            width: 0,
            height: 0,
        };
        assert_eq!(fit_extent_height(100, zero), zero);
        let tall = vk::Extent2D {
            width: 1,
            height: 1000,
        };
        assert_eq!(fit_extent_height(10, tall).width, 1);
    }
}
