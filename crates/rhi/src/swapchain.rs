//! Presentable surface management.
//!
//! This module handles VkSwapchainKHR creation, image acquisition, and presentation.
//!
//! # Overview
//!
//! The [`PresentableSurface`] struct owns the chain of images the
//! presentation engine shows. It is only ever written by a blit, so the
//! images carry `TRANSFER_DST` usage and no views. Creation picks:
//! - the extent ([`choose_extent`])
//! - the present mode from [`PRESENT_MODE_PREFERENCE`]
//! - the composite alpha from [`COMPOSITE_ALPHA_PREFERENCE`]
//! - the pre-transform and image count
//!
//! Out-of-date and suboptimal results are reported as [`SurfaceStatus`]
//! values; every other failure is an error.
//!
//! A surface can be retired instead of destroyed with
//! [`PresentableSurface::destroy`]. The returned [`RetiredSwapchain`] seeds
//! the next [`PresentableSurface::create`] and is released once the new
//! chain exists.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderer_rhi::device::Device;
//! use renderer_rhi::instance::Instance;
//! use renderer_rhi::swapchain::{Acquire, PresentableSurface};
//! use ash::vk;
//!
//! # fn example(instance: &Instance, device: Arc<Device>, surface: vk::SurfaceKHR, acquired: vk::Semaphore) -> Result<(), renderer_rhi::RhiError> {
//! let chain = PresentableSurface::create(
//!     instance,
//!     device,
//!     surface,
//!     vk::Extent2D { width: 800, height: 600 },
//!     3,
//!     None,
//! )?;
//! if let Acquire::Image { index, .. } = chain.acquire(acquired)? {
//!     let _image = chain.image(index as usize);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;
use crate::sync::WAIT_FOREVER;

/// Present modes tried in order; FIFO is the fallback.
pub const PRESENT_MODE_PREFERENCE: [vk::PresentModeKHR; 4] = [
    vk::PresentModeKHR::SHARED_DEMAND_REFRESH,
    vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH,
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::FIFO_RELAXED,
];

/// Composite alpha modes tried in order; OPAQUE is the fallback.
pub const COMPOSITE_ALPHA_PREFERENCE: [vk::CompositeAlphaFlagsKHR; 3] = [
    vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::INHERIT,
];

/// Usage every presentable image is created with.
pub const IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

/// Swapchain surface support details.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// Queries swapchain support details for a physical device and surface.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the queries fail.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> RhiResult<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        debug!(
            "Swapchain support: {} formats, {} present modes, image count: {}-{}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count,
            if capabilities.max_image_count == 0 {
                "unlimited".to_string()
            } else {
                capabilities.max_image_count.to_string()
            }
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }
}

/// Whether the chain still matches the surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceStatus {
    Optimal,
    /// Usable, but should be rebuilt.
    Suboptimal,
    /// Unusable until rebuilt.
    OutOfDate,
}

/// Result of an acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

/// A swapchain handle kept after its surface was torn down.
///
/// Passed as `cached` to [`PresentableSurface::create`], which hands it to
/// the driver as the old swapchain. Destroyed on drop.
pub struct RetiredSwapchain {
    loader: ash::khr::swapchain::Device,
    handle: vk::SwapchainKHR,
}

impl RetiredSwapchain {
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }
}

impl Drop for RetiredSwapchain {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_swapchain(self.handle, None);
        }
        debug!("Destroyed retired swapchain {:?}", self.handle);
    }
}

/// The chain of presentable images.
///
/// # Thread Safety
///
/// Not thread-safe. Only the frame loop thread acquires and presents.
pub struct PresentableSurface {
    device: Arc<Device>,
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

impl PresentableSurface {
    /// Builds a chain for `surface`.
    ///
    /// # Arguments
    ///
    /// * `desired_extent` - Used only when the surface leaves the extent
    ///   to the swapchain
    /// * `min_image_count` - Lower bound on the image count, usually the
    ///   number of frame slots
    /// * `cached` - A previously retired chain to recycle
    ///
    /// # Errors
    ///
    /// Returns an error if the surface reports no formats, does not support
    /// `TRANSFER_DST` images, or swapchain creation fails.
    pub fn create(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        desired_extent: vk::Extent2D,
        min_image_count: u32,
        cached: Option<RetiredSwapchain>,
    ) -> RhiResult<Self> {
        device.wait_idle()?;

        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        let support = SwapchainSupportDetails::query(
            device.physical_device_info().device,
            surface,
            &surface_loader,
        )?;
        let capabilities = &support.capabilities;

        if !capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            return Err(RhiError::SurfaceError(
                "surface images cannot be transfer destinations".to_string(),
            ));
        }
        let format = choose_surface_format(&support.formats).ok_or_else(|| {
            RhiError::SurfaceError("surface reports no formats".to_string())
        })?;
        let present_mode = choose_present_mode(&support.present_modes);
        let composite_alpha = choose_composite_alpha(capabilities.supported_composite_alpha);
        let pre_transform = choose_pre_transform(capabilities);
        let extent = choose_extent(capabilities, desired_extent);
        let image_count = choose_image_count(capabilities, min_image_count);

        info!(
            "Creating swapchain: {}x{}, format {:?}, present mode {:?}, {} images{}",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            image_count,
            if cached.is_some() { " (recycled)" } else { "" }
        );

        let queue_family_indices = [device.graphics_family(), device.present_family()];
        let (sharing_mode, queue_family_indices) =
            if queue_family_indices[0] != queue_family_indices[1] {
                (vk::SharingMode::CONCURRENT, &queue_family_indices[..])
            } else {
                (vk::SharingMode::EXCLUSIVE, &[][..])
            };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(IMAGE_USAGE)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(queue_family_indices)
            .pre_transform(pre_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(cached.as_ref().map_or(vk::SwapchainKHR::null(), |c| c.handle()));

        let loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };
        drop(cached);

        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };
        info!("Swapchain created with {} images", images.len());

        Ok(Self {
            device,
            loader,
            swapchain,
            images,
            format,
            extent,
            present_mode,
        })
    }

    /// Tears the surface down.
    ///
    /// With `keep`, the native handle survives as a [`RetiredSwapchain`] to
    /// be recycled by the next [`create`](Self::create). The device must be
    /// idle.
    pub fn destroy(mut self, keep: bool) -> Option<RetiredSwapchain> {
        self.retire(keep)
    }

    /// Replaces the chain in place, for owners that only hold a borrow.
    ///
    /// Equivalent to [`destroy`](Self::destroy) followed by
    /// [`create`](Self::create) with the retired chain as `cached` when
    /// `keep` is set. On error the surface is left without a chain and must
    /// not be used again.
    ///
    /// # Errors
    ///
    /// Returns an error if the device wait or the new chain fails.
    pub fn rebuild(
        &mut self,
        instance: &Instance,
        surface: vk::SurfaceKHR,
        desired_extent: vk::Extent2D,
        min_image_count: u32,
        keep: bool,
    ) -> RhiResult<()> {
        self.device.wait_idle()?;
        let cached = self.retire(keep);
        *self = Self::create(
            instance,
            self.device.clone(),
            surface,
            desired_extent,
            min_image_count,
            cached,
        )?;
        Ok(())
    }

    fn retire(&mut self, keep: bool) -> Option<RetiredSwapchain> {
        let handle = std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null());
        self.images.clear();
        if handle == vk::SwapchainKHR::null() {
            return None;
        }
        if keep {
            debug!("Retiring swapchain {:?}", handle);
            Some(RetiredSwapchain {
                loader: self.loader.clone(),
                handle,
            })
        } else {
            unsafe { self.loader.destroy_swapchain(handle, None) };
            debug!("Destroyed swapchain {:?}", handle);
            None
        }
    }

    /// Acquires the next image, signaling `semaphore` when it is ready.
    ///
    /// # Errors
    ///
    /// Returns every result other than success, suboptimal or out of date.
    pub fn acquire(&self, semaphore: vk::Semaphore) -> RhiResult<Acquire> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                WAIT_FOREVER,
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Queues `image_index` for presentation once `wait_semaphore` signals.
    ///
    /// # Errors
    ///
    /// Returns every result other than success, suboptimal or out of date.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> RhiResult<SurfaceStatus> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        present_status(result)
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    #[inline]
    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.format.color_space
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    pub fn image(&self, index: usize) -> vk::Image {
        self.images[index]
    }

    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }
}

impl Drop for PresentableSurface {
    fn drop(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.loader.destroy_swapchain(self.swapchain, None);
            }
            info!(
                "Swapchain destroyed (was {}x{}, {} images)",
                self.extent.width,
                self.extent.height,
                self.images.len()
            );
        }
    }
}

/// Maps a present result onto a status, keeping only real failures as errors.
pub fn present_status(result: Result<bool, vk::Result>) -> RhiResult<SurfaceStatus> {
    match result {
        Ok(false) => Ok(SurfaceStatus::Optimal),
        Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => Ok(SurfaceStatus::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SurfaceStatus::OutOfDate),
        Err(e) => Err(e.into()),
    }
}

/// Prefers B8G8R8A8_SRGB with SRGB_NONLINEAR, else the first format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = formats.iter().find(|f| {
        f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });
    if let Some(&format) = preferred {
        return Some(format);
    }
    let first = formats.first().copied();
    if let Some(format) = first {
        warn!("Using first available surface format: {:?}", format.format);
    }
    first
}

/// First supported mode of [`PRESENT_MODE_PREFERENCE`], else FIFO.
pub fn choose_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    PRESENT_MODE_PREFERENCE
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// First supported bit of [`COMPOSITE_ALPHA_PREFERENCE`], else OPAQUE.
pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    COMPOSITE_ALPHA_PREFERENCE
        .into_iter()
        .find(|&alpha| supported.contains(alpha))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// IDENTITY when supported, else the current transform.
pub fn choose_pre_transform(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::SurfaceTransformFlagsKHR {
    if capabilities
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        capabilities.current_transform
    }
}

/// The current extent, or `desired` clamped to the surface limits when the
/// surface leaves the choice to the swapchain.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: vk::Extent2D,
) -> vk::Extent2D {
    let current = capabilities.current_extent;
    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    let pick = |current: u32, desired: u32, min: u32, max: u32| {
        if current == u32::MAX {
            desired.clamp(min, max.max(min))
        } else {
            current
        }
    };
    vk::Extent2D {
        width: pick(current.width, desired.width, min.width, max.width),
        height: pick(current.height, desired.height, min.height, max.height),
    }
}

/// One image more than the surface minimum, at least `min_image_count`,
/// capped by the surface maximum (0 meaning no cap).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, min_image_count: u32) -> u32 {
    let floor = min_image_count.max(capabilities.min_image_count);
    let count = (capabilities.min_image_count + 1).max(floor);
    if capabilities.max_image_count == 0 {
        count
    } else {
        count.min(capabilities.max_image_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_choose_present_mode_preference() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::MAILBOX);

        let modes = [
            vk::PresentModeKHR::FIFO_RELAXED,
            vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH,
        ];
        assert_eq!(
            choose_present_mode(&modes),
            vk::PresentModeKHR::SHARED_CONTINUOUS_REFRESH
        );
    }

    #[test]
    fn test_choose_present_mode_fallback() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&[]), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_choose_composite_alpha() {
        let supported =
            vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED;
        assert_eq!(
            choose_composite_alpha(supported),
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
        );
        assert_eq!(
            choose_composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE),
            vk::CompositeAlphaFlagsKHR::OPAQUE
        );
    }

    #[test]
    fn test_choose_pre_transform() {
        let mut caps = capabilities(2, 3);
        caps.supported_transforms =
            vk::SurfaceTransformFlagsKHR::IDENTITY | vk::SurfaceTransformFlagsKHR::ROTATE_90;
        caps.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(
            choose_pre_transform(&caps),
            vk::SurfaceTransformFlagsKHR::IDENTITY
        );

        caps.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(
            choose_pre_transform(&caps),
            vk::SurfaceTransformFlagsKHR::ROTATE_90
        );
    }

    #[test]
    fn test_choose_extent_uses_current_when_defined() {
        let caps = capabilities(2, 3);
        let desired = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        assert_eq!(choose_extent(&caps, desired), caps.current_extent);
    }

    #[test]
    fn test_choose_extent_clamps_when_unconstrained() {
        let mut caps = capabilities(2, 3);
        caps.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        let desired = vk::Extent2D {
            width: 10_000,
            height: 600,
        };
        assert_eq!(
            choose_extent(&caps, desired),
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );
    }

    #[test]
    fn test_choose_image_count() {
        assert_eq!(choose_image_count(&capabilities(2, 8), 3), 3);
        assert_eq!(choose_image_count(&capabilities(3, 8), 3), 4);
        assert_eq!(choose_image_count(&capabilities(2, 2), 3), 2);
        assert_eq!(choose_image_count(&capabilities(1, 0), 5), 5);
        assert_eq!(choose_image_count(&capabilities(4, 0), 3), 5);
    }

    #[test]
    fn test_choose_surface_format() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]), Some(srgb));
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_present_status() {
        assert_eq!(present_status(Ok(false)).ok(), Some(SurfaceStatus::Optimal));
        assert_eq!(present_status(Ok(true)).ok(), Some(SurfaceStatus::Suboptimal));
        assert_eq!(
            present_status(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).ok(),
            Some(SurfaceStatus::OutOfDate)
        );
        assert!(present_status(Err(vk::Result::ERROR_DEVICE_LOST)).is_err());
    }

    #[test]
    fn test_image_usage_allows_blit() {
        assert!(IMAGE_USAGE.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(IMAGE_USAGE.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
    }
}
