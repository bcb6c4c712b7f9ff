//! Images, views, samplers and sampled textures.
//!
//! # Overview
//!
//! - [`Image`] wraps a 2D VkImage, its view and its gpu-allocator memory.
//!   It backs render targets, resolve targets and the depth buffer
//! - [`Sampler`] wraps a VkSampler with a linear or nearest filter
//! - [`Texture`] is an RGBA8 image uploaded through staging plus its sampler
//! - [`layout_barrier`] builds the single-level layout transitions used by
//!   uploads and by the blit to the presentable image

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::debug;

use crate::buffer::{Buffer, BufferUsage};
use crate::command::CommandExecutor;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Parameters of a single-level 2D image.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
    pub aspect: vk::ImageAspectFlags,
    /// Debug name handed to the allocator.
    pub name: &'static str,
}

impl ImageDesc {
    /// Offscreen color target that is blitted to the surface.
    pub fn render_target(
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            samples,
            aspect: vk::ImageAspectFlags::COLOR,
            name: "render_target",
        }
    }

    /// Single-sample target a multisampled render target resolves into.
    pub fn resolve_target(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            name: "resolve_target",
            ..Self::render_target(extent, format, vk::SampleCountFlags::TYPE_1)
        }
    }

    pub fn depth(extent: vk::Extent2D, format: vk::Format, samples: vk::SampleCountFlags) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            samples,
            aspect: vk::ImageAspectFlags::DEPTH,
            name: "depth_buffer",
        }
    }

    pub fn sampled(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            samples: vk::SampleCountFlags::TYPE_1,
            aspect: vk::ImageAspectFlags::COLOR,
            name: "texture",
        }
    }
}

/// Device-local 2D image with a view.
///
/// # Resource Destruction
///
/// Resources are destroyed in the following order:
/// 1. Image view
/// 2. Image
/// 3. Memory allocation
pub struct Image {
    device: Arc<Device>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    desc: ImageDesc,
}

impl Image {
    /// Creates the image, binds GPU-only memory and creates its view.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The extent is zero
    /// - Image creation fails
    /// - Memory allocation fails
    /// - Image view creation fails
    pub fn new(device: Arc<Device>, desc: ImageDesc) -> RhiResult<Self> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RhiError::InvalidHandle(format!(
                "{} dimensions must be greater than 0",
                desc.name
            )));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&image_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation = device.lock_allocator().and_then(|mut allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.name,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(RhiError::from)
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(e);
            }
        };

        let (memory, memory_offset) = unsafe { (allocation.memory(), allocation.offset()) };
        let mut created = Self {
            device,
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            desc,
        };
        unsafe {
            created
                .device
                .handle()
                .bind_image_memory(image, memory, memory_offset)?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(subresource_range(desc.aspect));
        created.view = unsafe { created.device.handle().create_image_view(&view_info, None)? };

        debug!(
            "Created {}: {}x{} ({:?}, {:?})",
            desc.name, desc.extent.width, desc.extent.height, desc.format, desc.samples
        );
        Ok(created)
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    #[inline]
    pub fn samples(&self) -> vk::SampleCountFlags {
        self.desc.samples
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.handle().destroy_image_view(self.view, None);
            }
            self.device.handle().destroy_image(self.image, None);
        }

        if let Some(allocation) = self.allocation.take() {
            match self.device.lock_allocator() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        tracing::error!("Failed to free image allocation: {:?}", e);
                    }
                }
                Err(e) => tracing::error!("Leaking image allocation: {}", e),
            }
        }

        debug!("Destroyed {}", self.desc.name);
    }
}

/// Whole single-level, single-layer subresource of the given aspect.
pub fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

/// Color layout transition of a whole single-level image.
pub fn layout_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR))
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
}

/// Texture sampler with repeat addressing.
pub struct Sampler {
    device: Arc<Device>,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Creates a sampler using linear filtering, or nearest when `linear`
    /// is false. Anisotropy is enabled up to the device limit.
    ///
    /// # Errors
    ///
    /// Returns an error if sampler creation fails.
    pub fn new(device: Arc<Device>, linear: bool) -> RhiResult<Self> {
        let filter = if linear {
            vk::Filter::LINEAR
        } else {
            vk::Filter::NEAREST
        };
        let max_anisotropy = device
            .physical_device_info()
            .properties
            .limits
            .max_sampler_anisotropy;
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(max_anisotropy > 1.0)
            .max_anisotropy(max_anisotropy.max(1.0))
            .min_lod(0.0)
            .max_lod(0.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);
        let sampler = unsafe { device.handle().create_sampler(&create_info, None)? };
        debug!(
            "Created {} sampler (anisotropy {})",
            if linear { "linear" } else { "nearest" },
            max_anisotropy
        );
        Ok(Self { device, sampler })
    }

    #[inline]
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_sampler(self.sampler, None);
        }
    }
}

/// Sampled RGBA8 texture.
pub struct Texture {
    image: Image,
    sampler: Sampler,
}

impl Texture {
    /// Format of every texture created by [`Texture::from_rgba8`].
    pub const FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    /// Uploads tightly packed RGBA8 `pixels` and leaves the image in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pixel count does not match the extent, or
    /// if any allocation or the upload fails.
    pub fn from_rgba8(
        device: Arc<Device>,
        executor: &mut CommandExecutor,
        queue: vk::Queue,
        extent: vk::Extent2D,
        pixels: &[u8],
        linear: bool,
    ) -> RhiResult<Self> {
        let expected = extent.width as usize * extent.height as usize * 4;
        if pixels.len() != expected {
            return Err(RhiError::InvalidHandle(format!(
                "texture {}x{} needs {} bytes, got {}",
                extent.width,
                extent.height,
                expected,
                pixels.len()
            )));
        }

        let image = Image::new(device.clone(), ImageDesc::sampled(extent, Self::FORMAT))?;
        let staging = Buffer::new_with_data(device.clone(), BufferUsage::Staging, pixels)?;

        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        executor.run_cmds(queue, |cmd| {
            cmd.image_barrier(
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                &[layout_barrier(
                    image.handle(),
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                )],
            );
            cmd.copy_buffer_to_image(staging.handle(), image.handle(), &[region]);
            cmd.image_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                &[layout_barrier(
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                )],
            );
            Ok(())
        })?;

        let sampler = Sampler::new(device, linear)?;
        Ok(Self { image, sampler })
    }

    /// 1x1 texture of a single color.
    ///
    /// # Errors
    ///
    /// See [`from_rgba8`](Self::from_rgba8).
    pub fn solid(
        device: Arc<Device>,
        executor: &mut CommandExecutor,
        queue: vk::Queue,
        rgba: [u8; 4],
        linear: bool,
    ) -> RhiResult<Self> {
        let extent = vk::Extent2D {
            width: 1,
            height: 1,
        };
        Self::from_rgba8(device, executor, queue, extent, &rgba, linear)
    }

    #[inline]
    pub fn image(&self) -> &Image {
        &self.image
    }

    #[inline]
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Descriptor info for a combined image sampler binding.
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler.handle(),
            image_view: self.image.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    #[test]
    fn test_render_target_desc() {
        let desc = ImageDesc::render_target(
            EXTENT,
            vk::Format::B8G8R8A8_SRGB,
            vk::SampleCountFlags::TYPE_4,
        );
        assert!(desc.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert!(desc.usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert_eq!(desc.samples, vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn test_resolve_target_is_single_sample() {
        let desc = ImageDesc::resolve_target(EXTENT, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(desc.samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(desc.name, "resolve_target");
    }

    #[test]
    fn test_depth_desc_aspect() {
        let desc = ImageDesc::depth(EXTENT, vk::Format::D32_SFLOAT, vk::SampleCountFlags::TYPE_1);
        assert_eq!(desc.aspect, vk::ImageAspectFlags::DEPTH);
        assert_eq!(desc.usage, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);
    }

    #[test]
    fn test_layout_barrier_covers_single_level() {
        let barrier = layout_barrier(
            vk::Image::null(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
        );
        assert_eq!(barrier.subresource_range.level_count, 1);
        assert_eq!(barrier.subresource_range.layer_count, 1);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }
}
