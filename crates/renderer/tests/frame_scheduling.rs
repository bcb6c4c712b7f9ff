//! Integration tests for frame scheduling.
//!
//! These drive `FrameScheduler` and `StaticUboTracker`, the state behind
//! `FrameGraph::run_render_pass`, against a simulated surface and queue so
//! they run without a GPU.

use std::collections::VecDeque;

use ash::vk;
use renderer_renderer::{FrameScheduler, FrameStep, StaticUboTracker, fit_extent_height};
use renderer_rhi::swapchain::{Acquire, SurfaceStatus};
use renderer_rhi::sync::MAX_CONCURRENT_FRAMES;
use renderer_rhi::{RhiError, RhiResult};

/// A surface with a fixed image count, handing out images round robin.
struct SimulatedSurface {
    image_count: usize,
    next_image: usize,
    acquire_results: VecDeque<Acquire>,
    present_results: VecDeque<SurfaceStatus>,
}

impl SimulatedSurface {
    fn new(image_count: usize) -> Self {
        Self {
            image_count,
            next_image: 0,
            acquire_results: VecDeque::new(),
            present_results: VecDeque::new(),
        }
    }

    fn acquire(&mut self) -> Acquire {
        self.acquire_results.pop_front().unwrap_or_else(|| {
            let index = self.next_image as u32;
            self.next_image = (self.next_image + 1) % self.image_count;
            Acquire::Image {
                index,
                suboptimal: false,
            }
        })
    }

    fn present(&mut self) -> SurfaceStatus {
        self.present_results
            .pop_front()
            .unwrap_or(SurfaceStatus::Optimal)
    }
}

/// A queue completing submissions in order, each signaling the fence of
/// the image it rendered.
struct SimulatedQueue {
    in_flight: VecDeque<usize>,
    /// Per image: whether its fence is unsignaled.
    busy: Vec<bool>,
}

impl SimulatedQueue {
    fn new(image_count: usize) -> Self {
        Self {
            in_flight: VecDeque::new(),
            busy: vec![false; image_count],
        }
    }

    fn submit(&mut self, image: usize) {
        assert!(!self.busy[image], "image {} resubmitted while busy", image);
        self.busy[image] = true;
        self.in_flight.push_back(image);
    }

    /// Lets the oldest submission finish.
    fn complete_one(&mut self) {
        if let Some(image) = self.in_flight.pop_front() {
            self.busy[image] = false;
        }
    }

    fn wait_fence(&mut self, image: usize) {
        while self.busy[image] {
            assert!(
                !self.in_flight.is_empty(),
                "fence of image {} can never signal",
                image
            );
            self.complete_one();
        }
    }

    fn wait_idle(&mut self) {
        while !self.in_flight.is_empty() {
            self.complete_one();
        }
        assert!(self.busy.iter().all(|&b| !b), "fence left unsignaled");
    }
}

/// The frame loop of a frame graph over the simulated surface and queue.
struct SimulatedGraph {
    scheduler: FrameScheduler,
    static_ubo: StaticUboTracker,
    queue: SimulatedQueue,
    observer_calls: usize,
    static_copies: Vec<usize>,
    slots_used: Vec<usize>,
    fail_next_record: bool,
}

impl SimulatedGraph {
    fn new(surface: &SimulatedSurface) -> Self {
        let mut static_ubo = StaticUboTracker::default();
        static_ubo.reset_images(surface.image_count);
        Self {
            scheduler: FrameScheduler::new(MAX_CONCURRENT_FRAMES),
            static_ubo,
            queue: SimulatedQueue::new(surface.image_count),
            observer_calls: 0,
            static_copies: vec![0; surface.image_count],
            slots_used: Vec::new(),
            fail_next_record: false,
        }
    }

    fn reassign(&mut self, surface: &SimulatedSurface) {
        self.queue.wait_idle();
        self.static_ubo.reset_images(surface.image_count);
        self.queue = SimulatedQueue::new(surface.image_count);
        self.scheduler.skip_next_frame();
    }

    fn invalidate(&mut self, surface: &SimulatedSurface) {
        self.queue.wait_idle();
        self.observer_calls += 1;
        self.reassign(surface);
    }

    /// Waits for the image, records, then unsignals the fence and submits.
    fn record_and_submit(&mut self, image: usize) -> RhiResult<()> {
        self.queue.wait_fence(image);
        if std::mem::take(&mut self.fail_next_record) {
            return Err(RhiError::InvalidState("recording failed".to_string()));
        }
        if self.static_ubo.is_stale(image) {
            self.static_copies[image] += 1;
        }
        self.queue.submit(image);
        Ok(())
    }

    fn run_render_pass(&mut self, surface: &mut SimulatedSurface) -> RhiResult<bool> {
        if !self.scheduler.begin_frame() {
            return Ok(false);
        }
        let slot = self.scheduler.current_slot();
        let image = match self
            .scheduler
            .on_acquire(surface.acquire(), surface.image_count)?
        {
            FrameStep::Render(image) => image,
            FrameStep::Presented | FrameStep::Invalidate => {
                self.invalidate(surface);
                return Ok(false);
            }
        };
        self.slots_used.push(slot);

        let refresh_static = self.static_ubo.is_stale(image);
        self.record_and_submit(image)?;
        if refresh_static {
            self.static_ubo.mark_current(image);
        }
        tracing::debug!(image, slot, "frame recorded");

        match self.scheduler.on_present(surface.present()) {
            FrameStep::Presented => Ok(true),
            FrameStep::Render(_) | FrameStep::Invalidate => {
                self.invalidate(surface);
                Ok(false)
            }
        }
    }

    fn frame(&mut self, surface: &mut SimulatedSurface) -> bool {
        self.run_render_pass(surface).unwrap()
    }
}

#[test]
fn test_steady_state_renders_every_frame() {
    let mut surface = SimulatedSurface::new(3);
    let mut graph = SimulatedGraph::new(&surface);

    let results: Vec<bool> = (0..10).map(|_| graph.frame(&mut surface)).collect();

    assert!(results.iter().all(|&r| r), "all frames should render");
    assert_eq!(graph.observer_calls, 0);
}

#[test]
fn test_images_in_flight_wait_for_their_fence() {
    // Two images keep the queue behind the acquire order, so each image
    // comes around while its previous submission is still queued.
    let mut surface = SimulatedSurface::new(2);
    let mut graph = SimulatedGraph::new(&surface);

    for _ in 0..8 {
        assert!(graph.frame(&mut surface));
        assert!(graph.queue.in_flight.len() <= surface.image_count);
    }
    assert_eq!(graph.queue.in_flight.len(), 2);
}

#[test]
fn test_slots_stay_within_bound() {
    let mut surface = SimulatedSurface::new(3);
    let mut graph = SimulatedGraph::new(&surface);

    for _ in 0..10 {
        graph.frame(&mut surface);
    }

    assert!(graph.slots_used.iter().all(|&s| s < MAX_CONCURRENT_FRAMES));
    assert_eq!(&graph.slots_used[..4], &[0, 1, 2, 0]);
}

#[test]
fn test_reassign_skips_exactly_one_frame() {
    let mut surface = SimulatedSurface::new(3);
    let mut graph = SimulatedGraph::new(&surface);
    assert!(graph.frame(&mut surface));

    graph.reassign(&surface);

    assert!(!graph.frame(&mut surface));
    assert!(graph.frame(&mut surface));
    assert!(graph.frame(&mut surface));
}

#[test]
fn test_out_of_date_acquire_calls_observer_once() {
    let mut surface = SimulatedSurface::new(3);
    surface.acquire_results.push_back(Acquire::OutOfDate);
    let mut graph = SimulatedGraph::new(&surface);

    assert!(!graph.frame(&mut surface));
    assert_eq!(graph.observer_calls, 1);
    assert!(!graph.frame(&mut surface), "rebuild skips a frame");
    assert!(graph.frame(&mut surface));
    assert_eq!(graph.observer_calls, 1);
}

#[test]
fn test_suboptimal_acquire_still_renders() {
    let mut surface = SimulatedSurface::new(3);
    surface.acquire_results.push_back(Acquire::Image {
        index: 1,
        suboptimal: true,
    });
    surface.present_results.push_back(SurfaceStatus::Suboptimal);
    let mut graph = SimulatedGraph::new(&surface);

    assert!(!graph.frame(&mut surface));
    assert_eq!(graph.slots_used, vec![0]);
    assert_eq!(graph.static_copies, vec![0, 1, 0]);
    assert_eq!(graph.observer_calls, 1);
}

#[test]
fn test_stale_present_does_not_advance_slot() {
    let mut surface = SimulatedSurface::new(3);
    surface.present_results.push_back(SurfaceStatus::OutOfDate);
    let mut graph = SimulatedGraph::new(&surface);

    assert!(!graph.frame(&mut surface));
    assert_eq!(graph.scheduler.current_slot(), 0);
    assert_eq!(graph.observer_calls, 1);
}

#[test]
fn test_out_of_range_image_is_an_error() {
    let mut surface = SimulatedSurface::new(3);
    surface.acquire_results.push_back(Acquire::Image {
        index: 5,
        suboptimal: false,
    });
    let mut graph = SimulatedGraph::new(&surface);

    let result = graph.run_render_pass(&mut surface);
    assert!(matches!(result, Err(RhiError::InvalidState(_))));
}

#[test]
fn test_failed_recording_leaves_image_idle() {
    let mut surface = SimulatedSurface::new(3);
    let mut graph = SimulatedGraph::new(&surface);
    assert!(graph.frame(&mut surface));

    graph.fail_next_record = true;
    assert!(graph.run_render_pass(&mut surface).is_err());
    assert!(!graph.queue.busy[1]);

    // A rebuild after the error must not wait on a fence nothing signals.
    graph.reassign(&surface);
    assert!(!graph.frame(&mut surface));
    assert!(graph.frame(&mut surface));
}

#[test]
fn test_static_ubo_copied_once_per_write() {
    let mut surface = SimulatedSurface::new(3);
    let mut graph = SimulatedGraph::new(&surface);
    for _ in 0..3 {
        graph.frame(&mut surface);
    }
    assert_eq!(graph.static_copies, vec![1, 1, 1]);

    graph.static_ubo.bump();
    graph.static_ubo.bump();
    for _ in 0..6 {
        graph.frame(&mut surface);
    }

    assert_eq!(graph.static_copies, vec![2, 2, 2]);
}

#[test]
fn test_render_extent_fits_under_cap() {
    let surface = vk::Extent2D {
        width: 800,
        height: 600,
    };
    let render = fit_extent_height(300, surface);
    assert_eq!(
        render,
        vk::Extent2D {
            width: 400,
            height: 300
        }
    );
}

#[test]
fn test_scoped_subscriber_captures_frames() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let mut surface = SimulatedSurface::new(2);
        let mut graph = SimulatedGraph::new(&surface);
        assert!(graph.frame(&mut surface));
        assert!(graph.frame(&mut surface));
    });
}
