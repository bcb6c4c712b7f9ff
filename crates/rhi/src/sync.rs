//! Synchronization primitives for Vulkan.
//!
//! This module provides wrappers for Vulkan synchronization objects:
//! - [`Semaphore`] - GPU-to-GPU synchronization (between queue operations)
//! - [`Fence`] - GPU-to-CPU synchronization (for host waiting)
//! - [`FrameSync`] - The semaphores of one frame slot
//!
//! # Overview
//!
//! A frame moves through three queue operations: acquiring a surface image,
//! rendering into the offscreen target, and blitting that target into the
//! surface image. Each hop is ordered by one semaphore of the frame slot,
//! and the last submission signals the fence guarding the surface image.
//!
//! Fence waits take a timeout in nanoseconds. [`WAIT_FOREVER`] is the normal
//! value; an expired finite timeout surfaces as `VK_TIMEOUT` and is treated
//! as an error like any other.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderer_rhi::device::Device;
//! use renderer_rhi::sync::{Fence, FrameSync, WAIT_FOREVER};
//!
//! # fn example(device: Arc<Device>) -> Result<(), renderer_rhi::RhiError> {
//! let slot = FrameSync::new(device.clone())?;
//! let available = Fence::new(device.clone(), true)?;
//!
//! available.wait(WAIT_FOREVER)?;
//! available.reset()?;
//! let _acquired = slot.image_acquired();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;

/// Number of frame slots cycled by the frame graph.
pub const MAX_CONCURRENT_FRAMES: usize = 3;

/// Timeout meaning "until signaled".
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Vulkan semaphore wrapper.
///
/// The semaphore is created unsignaled and destroyed on drop.
pub struct Semaphore {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new binary semaphore.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };
        Ok(Self { device, semaphore })
    }

    /// Returns the Vulkan semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
    }
}

/// Vulkan fence wrapper.
pub struct Fence {
    device: Arc<Device>,
    fence: vk::Fence,
}

impl Fence {
    /// Creates a new fence, optionally already signaled.
    ///
    /// A signaled fence lets the first wait on a resource that was never
    /// submitted return immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(device: Arc<Device>, signaled: bool) -> RhiResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { device.handle().create_fence(&create_info, None)? };
        Ok(Self { device, fence })
    }

    /// Returns the Vulkan fence handle.
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks until the fence is signaled or `timeout` nanoseconds pass.
    ///
    /// # Errors
    ///
    /// Returns `VK_TIMEOUT` as an error when the timeout expires, or any
    /// other wait failure.
    pub fn wait(&self, timeout: u64) -> RhiResult<()> {
        wait_for_fences(&self.device, &[self.fence], timeout)
    }

    /// Returns the fence to the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&self) -> RhiResult<()> {
        unsafe { self.device.handle().reset_fences(&[self.fence])? };
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_fence(self.fence, None);
        }
    }
}

/// Waits until every fence in `fences` is signaled.
///
/// An empty slice returns immediately.
///
/// # Errors
///
/// Returns `VK_TIMEOUT` as an error when the timeout expires, or any other
/// wait failure.
pub fn wait_for_fences(device: &Device, fences: &[vk::Fence], timeout: u64) -> RhiResult<()> {
    if fences.is_empty() {
        return Ok(());
    }
    unsafe { device.handle().wait_for_fences(fences, true, timeout)? };
    Ok(())
}

/// The semaphores of one frame slot.
///
/// Slots are created once per frame graph and are independent of the
/// surface, so they survive surface rebuilds.
pub struct FrameSync {
    image_acquired: Semaphore,
    render_done: Semaphore,
    blit_done: Semaphore,
}

impl FrameSync {
    /// Creates the three semaphores of a frame slot.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let slot = Self {
            image_acquired: Semaphore::new(device.clone())?,
            render_done: Semaphore::new(device.clone())?,
            blit_done: Semaphore::new(device)?,
        };
        debug!("Created frame slot semaphores");
        Ok(slot)
    }

    /// Signaled by the presentation engine when the surface image is ready.
    #[inline]
    pub fn image_acquired(&self) -> vk::Semaphore {
        self.image_acquired.handle()
    }

    /// Signaled when the render pass of the frame has executed.
    #[inline]
    pub fn render_done(&self) -> vk::Semaphore {
        self.render_done.handle()
    }

    /// Signaled when the render target has been copied to the surface image.
    #[inline]
    pub fn blit_done(&self) -> vk::Semaphore {
        self.blit_done.handle()
    }
}

/// Creates [`MAX_CONCURRENT_FRAMES`] frame slots.
///
/// # Errors
///
/// Returns an error if semaphore creation fails.
pub fn create_frame_slots(device: &Arc<Device>) -> RhiResult<Vec<FrameSync>> {
    (0..MAX_CONCURRENT_FRAMES)
        .map(|_| FrameSync::new(device.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_concurrent_frames_constant() {
        assert_eq!(MAX_CONCURRENT_FRAMES, 3);
    }

    #[test]
    fn test_sync_objects_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore>();
        assert_send_sync::<Fence>();
        assert_send_sync::<FrameSync>();
    }
}
