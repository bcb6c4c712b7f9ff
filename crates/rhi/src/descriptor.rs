//! Descriptor set management for shader resource binding.
//!
//! This module provides abstractions for Vulkan descriptor management:
//! - [`DescriptorSetLayout`] defines the layout of shader bindings
//! - [`DescriptorPool`] manages allocation of descriptor sets
//! - [`DynamicDescriptorPool`] hands out sets of one layout and regrows
//!   its pool when it runs out
//! - Helper functions for writing descriptor sets
//!
//! # Regrowth
//!
//! Vulkan pools cannot be enlarged in place. When a [`DynamicDescriptorPool`]
//! needs more sets it waits for the device, destroys its pool, creates one
//! twice as large and allocates every set again. Handles stay valid but the
//! sets they name are blank, which the pool reports through
//! [`DynamicDescriptorPool::take_out_of_date`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use renderer_rhi::device::Device;
//! use renderer_rhi::descriptor::{DescriptorBindingBuilder, DescriptorSetLayout, DynamicDescriptorPool};
//!
//! # fn example(device: Arc<Device>) -> Result<(), renderer_rhi::RhiError> {
//! let layout = DescriptorSetLayout::new(
//!     device.clone(),
//!     &[DescriptorBindingBuilder::uniform_buffer(0, vk::ShaderStageFlags::VERTEX)],
//! )?;
//! let sizes = [vk::DescriptorPoolSize::default()
//!     .ty(vk::DescriptorType::UNIFORM_BUFFER)
//!     .descriptor_count(1)];
//! let mut pool = DynamicDescriptorPool::new(device, layout.handle(), &sizes, 1)?;
//! let handle = pool.request()?;
//! let _set = pool.get(handle);
//! pool.release(handle);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Descriptor set layout wrapper.
///
/// # Thread Safety
///
/// The layout itself is immutable after creation. It can be shared between
/// threads when wrapped in `Arc`.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Creates a new descriptor set layout.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn new(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RhiResult<Self> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);

        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };

        debug!(
            "Created descriptor set layout with {} binding(s)",
            bindings.len()
        );

        Ok(Self { device, layout })
    }

    /// Returns the Vulkan descriptor set layout handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("Destroyed descriptor set layout");
    }
}

/// Descriptor pool for allocating descriptor sets.
///
/// Sets are never freed individually; they go away with the pool.
///
/// # Thread Safety
///
/// Descriptor pool operations are not thread-safe. Synchronize access
/// externally when sharing between threads.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Creates a new descriptor pool.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails.
    pub fn new(
        device: Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> RhiResult<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = unsafe { device.handle().create_descriptor_pool(&create_info, None)? };

        debug!(
            "Created descriptor pool: max_sets={}, pool_sizes={}",
            max_sets,
            pool_sizes.len()
        );

        Ok(Self {
            device,
            pool,
            max_sets,
        })
    }

    /// Allocates one descriptor set per entry of `layouts`.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails (e.g., pool exhausted).
    pub fn allocate(
        &self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        if layouts.is_empty() {
            return Ok(Vec::new());
        }
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info)? };

        debug!("Allocated {} descriptor set(s)", sets.len());

        Ok(sets)
    }

    /// Returns the Vulkan descriptor pool handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Returns the maximum number of sets that can be allocated from this pool.
    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_pool(self.pool, None);
        }
        debug!("Destroyed descriptor pool");
    }
}

/// Writes descriptor sets.
pub fn update_descriptor_sets(device: &Device, writes: &[vk::WriteDescriptorSet]) {
    if writes.is_empty() {
        return;
    }
    unsafe {
        device.handle().update_descriptor_sets(writes, &[]);
    }
}

/// Write of a single uniform buffer descriptor.
pub fn write_uniform_buffer<'a>(
    set: vk::DescriptorSet,
    binding: u32,
    info: &'a [vk::DescriptorBufferInfo; 1],
) -> vk::WriteDescriptorSet<'a> {
    vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(info)
}

/// Write of a single combined image sampler descriptor.
pub fn write_combined_image_sampler<'a>(
    set: vk::DescriptorSet,
    binding: u32,
    info: &'a [vk::DescriptorImageInfo; 1],
) -> vk::WriteDescriptorSet<'a> {
    vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(0)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(info)
}

/// Builder for common descriptor set layout bindings.
///
/// # Example
///
/// ```
/// use ash::vk;
/// use renderer_rhi::descriptor::DescriptorBindingBuilder;
///
/// let bindings = [
///     DescriptorBindingBuilder::uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
///     DescriptorBindingBuilder::combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT),
/// ];
/// ```
pub struct DescriptorBindingBuilder;

impl DescriptorBindingBuilder {
    /// Creates a uniform buffer binding.
    #[inline]
    pub fn uniform_buffer(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(stage_flags)
    }

    /// Creates a combined image sampler binding.
    #[inline]
    pub fn combined_image_sampler(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(stage_flags)
    }
}

// =============================================================================
// Dynamic Pool
// =============================================================================

/// Index of a set issued by a [`DynamicDescriptorPool`].
///
/// Only meaningful for the pool that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle(usize);

impl DescriptorSetHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Slot bookkeeping of a dynamic pool, independent of Vulkan.
///
/// Indices are issued densely; `issued` is the high-water mark, so
/// `acquired + free.len() == issued <= capacity` at all times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSlots {
    capacity: usize,
    issued: usize,
    acquired: usize,
    free: Vec<usize>,
    out_of_date: bool,
}

impl DescriptorSlots {
    /// Empty bookkeeping for `capacity` slots, at least one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            issued: 0,
            acquired: 0,
            free: Vec::new(),
            out_of_date: false,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn acquired(&self) -> usize {
        self.acquired
    }

    #[inline]
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Whether the sets were reallocated since the last
    /// [`take_out_of_date`](Self::take_out_of_date).
    #[inline]
    pub fn is_out_of_date(&self) -> bool {
        self.out_of_date
    }

    /// Returns the out-of-date flag and clears it.
    pub fn take_out_of_date(&mut self) -> bool {
        std::mem::take(&mut self.out_of_date)
    }

    /// Issues a slot.
    ///
    /// Returns the slot and, when the slot lies past the current capacity,
    /// the doubled capacity the pool must grow to before using it. Growing
    /// marks every set out of date.
    pub fn request(&mut self) -> (usize, Option<usize>) {
        self.acquired += 1;
        if let Some(index) = self.free.pop() {
            return (index, None);
        }
        let index = self.issued;
        self.issued += 1;
        if self.issued > self.capacity {
            self.capacity *= 2;
            self.out_of_date = true;
            (index, Some(self.capacity))
        } else {
            (index, None)
        }
    }

    /// Issues a slot, running `grow` with the new capacity first when the
    /// pool has to grow.
    ///
    /// The bookkeeping only changes once `grow` succeeded.
    pub fn request_with<T>(
        &mut self,
        grow: impl FnOnce(usize) -> RhiResult<T>,
    ) -> RhiResult<(usize, Option<T>)> {
        let mut next = self.clone();
        let (index, grow_to) = next.request();
        let grown = grow_to.map(grow).transpose()?;
        *self = next;
        Ok((index, grown))
    }

    /// Returns a slot; it is the next one handed out.
    pub fn release(&mut self, index: usize) {
        debug_assert!(index < self.issued && !self.free.contains(&index));
        self.free.push(index);
        self.acquired -= 1;
    }

    /// Sets the capacity to `max(size, 1)`, marking every set out of date.
    ///
    /// Returns `None` when that would drop slots that were already issued.
    pub fn resize(&mut self, size: usize) -> Option<usize> {
        let size = size.max(1);
        if size < self.issued {
            return None;
        }
        self.capacity = size;
        self.out_of_date = true;
        Some(size)
    }

    /// [`resize`](Self::resize) that runs `rebuild` with the new capacity
    /// and only commits once it succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if issued slots would be dropped,
    /// or the error of `rebuild`.
    pub fn resize_with<T>(
        &mut self,
        size: usize,
        rebuild: impl FnOnce(usize) -> RhiResult<T>,
    ) -> RhiResult<T> {
        let mut next = self.clone();
        let capacity = next.resize(size).ok_or_else(|| {
            RhiError::InvalidState(format!(
                "descriptor pool cannot shrink to {} below issued handles",
                size
            ))
        })?;
        let rebuilt = rebuild(capacity)?;
        *self = next;
        Ok(rebuilt)
    }
}

/// Growable pool of descriptor sets sharing one layout.
///
/// # Thread Safety
///
/// Not thread-safe; owned by the thread recording frames.
pub struct DynamicDescriptorPool {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    sizes_per_set: Vec<vk::DescriptorPoolSize>,
    pool: DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    slots: DescriptorSlots,
}

impl DynamicDescriptorPool {
    /// Creates a pool of `max(size, 1)` sets of `layout`.
    ///
    /// `sizes_per_set` lists the descriptors one set consumes; they are
    /// multiplied by the set count whenever the pool is built. The layout
    /// must outlive the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation or set allocation fails.
    pub fn new(
        device: Arc<Device>,
        layout: vk::DescriptorSetLayout,
        sizes_per_set: &[vk::DescriptorPoolSize],
        size: usize,
    ) -> RhiResult<Self> {
        let slots = DescriptorSlots::new(size);
        let (pool, sets) = Self::build(&device, layout, sizes_per_set, slots.capacity())?;
        Ok(Self {
            device,
            layout,
            sizes_per_set: sizes_per_set.to_vec(),
            pool,
            sets,
            slots,
        })
    }

    /// Hands out a set, reusing released ones before growing.
    ///
    /// A failed regrowth leaves the pool as it was.
    ///
    /// # Errors
    ///
    /// Returns an error if a required regrowth fails.
    pub fn request(&mut self) -> RhiResult<DescriptorSetHandle> {
        let (device, layout, sizes) = (&self.device, self.layout, &self.sizes_per_set);
        let (index, grown) = self
            .slots
            .request_with(|capacity| Self::regrow(device, layout, sizes, capacity))?;
        if let Some((pool, sets)) = grown {
            self.install(pool, sets);
        }
        Ok(DescriptorSetHandle(index))
    }

    /// Returns a set to the pool. The pool never shrinks.
    pub fn release(&mut self, handle: DescriptorSetHandle) {
        self.slots.release(handle.0);
    }

    /// Rebuilds the pool with room for `max(size, 1)` sets.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if `size` is below the number of
    /// sets already handed out, or an error if the rebuild fails. The pool
    /// is unchanged in either case.
    pub fn set_size(&mut self, size: usize) -> RhiResult<()> {
        let (device, layout, sizes) = (&self.device, self.layout, &self.sizes_per_set);
        let (pool, sets) = self
            .slots
            .resize_with(size, |capacity| Self::regrow(device, layout, sizes, capacity))?;
        self.install(pool, sets);
        Ok(())
    }

    /// The set named by `handle`.
    #[inline]
    pub fn get(&self, handle: DescriptorSetHandle) -> vk::DescriptorSet {
        self.sets[handle.0]
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    #[inline]
    pub fn acquired_count(&self) -> usize {
        self.slots.acquired()
    }

    #[inline]
    pub fn is_out_of_date(&self) -> bool {
        self.slots.is_out_of_date()
    }

    /// Returns whether sets were reallocated since the last call and clears
    /// the flag. Every live set must be rewritten when this returns `true`.
    pub fn take_out_of_date(&mut self) -> bool {
        self.slots.take_out_of_date()
    }

    /// Builds the replacement pool while the current one stays intact.
    fn regrow(
        device: &Arc<Device>,
        layout: vk::DescriptorSetLayout,
        sizes_per_set: &[vk::DescriptorPoolSize],
        capacity: usize,
    ) -> RhiResult<(DescriptorPool, Vec<vk::DescriptorSet>)> {
        // The old sets may still be bound by in-flight frames.
        device.wait_idle()?;
        Self::build(device, layout, sizes_per_set, capacity)
    }

    fn install(&mut self, pool: DescriptorPool, sets: Vec<vk::DescriptorSet>) {
        self.sets = sets;
        // Frees the old sets along with their pool.
        self.pool = pool;
        info!("Descriptor pool regrown to {} sets", self.sets.len());
    }

    fn build(
        device: &Arc<Device>,
        layout: vk::DescriptorSetLayout,
        sizes_per_set: &[vk::DescriptorPoolSize],
        capacity: usize,
    ) -> RhiResult<(DescriptorPool, Vec<vk::DescriptorSet>)> {
        let count = u32::try_from(capacity).map_err(|_| {
            RhiError::InvalidState(format!("descriptor pool size {} too large", capacity))
        })?;
        let pool_sizes = scale_pool_sizes(sizes_per_set, count);
        let pool = DescriptorPool::new(device.clone(), count, &pool_sizes)?;
        let sets = pool.allocate(&vec![layout; capacity])?;
        Ok((pool, sets))
    }
}

/// Multiplies each per-set descriptor count by `sets`.
pub fn scale_pool_sizes(
    sizes_per_set: &[vk::DescriptorPoolSize],
    sets: u32,
) -> Vec<vk::DescriptorPoolSize> {
    sizes_per_set
        .iter()
        .map(|size| {
            vk::DescriptorPoolSize::default()
                .ty(size.ty)
                .descriptor_count(size.descriptor_count.saturating_mul(sets))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariant(slots: &DescriptorSlots) {
        assert!(slots.acquired() + slots.free_len() <= slots.capacity());
    }

    #[test]
    fn test_first_request_fits_second_grows() {
        let mut slots = DescriptorSlots::new(1);
        assert_eq!(slots.request(), (0, None));
        assert_eq!(slots.request(), (1, Some(2)));
        assert_eq!(slots.capacity(), 2);
        assert_invariant(&slots);
    }

    #[test]
    fn test_released_handle_is_reused_first() {
        let mut slots = DescriptorSlots::new(4);
        let (a, _) = slots.request();
        let (b, _) = slots.request();
        slots.release(a);
        assert_eq!(slots.acquired(), 1);
        assert_eq!(slots.request(), (a, None));
        assert_ne!(a, b);
        assert_invariant(&slots);
    }

    #[test]
    fn test_invariant_holds_under_churn() {
        let mut slots = DescriptorSlots::new(1);
        let mut held = Vec::new();
        for round in 0..50 {
            if round % 3 == 2 {
                if let Some(index) = held.pop() {
                    slots.release(index);
                }
            } else {
                let (index, _) = slots.request();
                assert!(!held.contains(&index));
                held.push(index);
            }
            assert_invariant(&slots);
            assert_eq!(slots.acquired(), held.len());
        }
        assert!(slots.capacity().is_power_of_two());
    }

    #[test]
    fn test_growth_marks_sets_out_of_date() {
        let mut slots = DescriptorSlots::new(1);
        slots.request();
        assert!(!slots.is_out_of_date());

        let (index, grown) = slots.request_with(|capacity| Ok(capacity)).unwrap();
        assert_eq!((index, grown), (1, Some(2)));
        assert!(slots.take_out_of_date());
        assert!(!slots.take_out_of_date());

        // Reusing a released slot does not reallocate.
        slots.release(0);
        let (_, grown) = slots.request_with(|capacity| Ok(capacity)).unwrap();
        assert_eq!(grown, None);
        assert!(!slots.is_out_of_date());
    }

    #[test]
    fn test_failed_growth_leaves_slots_unchanged() {
        let mut slots = DescriptorSlots::new(1);
        slots.request();
        let before = slots.clone();

        let result = slots.request_with(|_| -> RhiResult<()> {
            Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
        });

        assert!(result.is_err());
        assert_eq!(slots, before);
        assert_eq!(slots.capacity(), 1);
        assert_eq!(slots.acquired(), 1);
        assert!(!slots.is_out_of_date());

        // The next attempt grows as if the failure never happened.
        let (index, grown) = slots.request_with(|capacity| Ok(capacity)).unwrap();
        assert_eq!((index, grown), (1, Some(2)));
    }

    #[test]
    fn test_failed_resize_leaves_slots_unchanged() {
        let mut slots = DescriptorSlots::new(2);
        slots.request();
        let before = slots.clone();

        let result = slots.resize_with(8, |_| -> RhiResult<()> {
            Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
        });
        assert!(result.is_err());
        assert_eq!(slots, before);

        let shrink = slots.resize_with(0, |_| -> RhiResult<()> { Ok(()) });
        assert!(matches!(shrink, Ok(())));
        assert_eq!(slots.capacity(), 1);
        assert!(slots.take_out_of_date());

        slots.request();
        let before = slots.clone();
        let mut rebuilt = false;
        let below = slots.resize_with(1, |_| -> RhiResult<()> {
            rebuilt = true;
            Ok(())
        });
        assert!(matches!(below, Err(RhiError::InvalidState(_))));
        assert!(!rebuilt);
        assert_eq!(slots, before);
    }

    #[test]
    fn test_zero_size_means_one() {
        let slots = DescriptorSlots::new(0);
        assert_eq!(slots.capacity(), 1);
    }

    #[test]
    fn test_resize_never_drops_issued_slots() {
        let mut slots = DescriptorSlots::new(4);
        slots.request();
        slots.request();
        assert_eq!(slots.resize(1), None);
        assert_eq!(slots.resize(0), None);
        assert_eq!(slots.resize(8), Some(8));
        assert_eq!(slots.capacity(), 8);
    }

    #[test]
    fn test_scale_pool_sizes() {
        let sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(2),
        ];
        let scaled = scale_pool_sizes(&sizes, 4);
        assert_eq!(scaled[0].descriptor_count, 4);
        assert_eq!(scaled[1].descriptor_count, 8);
        assert_eq!(scaled[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
    }

    #[test]
    fn test_binding_builder() {
        let binding = DescriptorBindingBuilder::combined_image_sampler(2, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(binding.binding, 2);
        assert_eq!(binding.descriptor_count, 1);
        assert_eq!(
            binding.descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }
}
