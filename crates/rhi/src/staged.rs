//! Growable device-local arrays mirrored by a host-visible staging copy.
//!
//! # Overview
//!
//! [`StagedDeviceBuffer`] keeps a staging buffer and a device-local buffer
//! of the same capacity. The host edits elements through the staging
//! mapping; [`StagedDeviceBuffer::flush`] copies a range to the device
//! buffer and makes it visible to the first stage that reads it.
//!
//! Capacity follows [`capacity_for`]: it grows to the next power of two on
//! overflow, never shrinks, and drops to zero when the size does.
//!
//! Reallocation frees buffers the GPU may still read, so every resize takes
//! a wait barrier that is called before the old pair is released. Pass a
//! device-wide idle wait or a frame graph scoped wait, whichever is cheaper
//! for the caller.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use tracing::debug;

use crate::buffer::{Buffer, BufferUsage};
use crate::command::{CommandExecutor, PendingCommands};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// How a staged buffer is consumed on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagedBufferTraits {
    /// Usage of the device-local buffer, e.g. `VERTEX_BUFFER`.
    pub usage: vk::BufferUsageFlags,
    /// First pipeline stage reading the flushed data.
    pub first_stage: vk::PipelineStageFlags,
    /// Access performed by that stage.
    pub first_access: vk::AccessFlags,
}

impl StagedBufferTraits {
    /// Traits of a per-instance vertex buffer.
    pub const INSTANCE: Self = Self {
        usage: vk::BufferUsageFlags::VERTEX_BUFFER,
        first_stage: vk::PipelineStageFlags::VERTEX_INPUT,
        first_access: vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
    };
}

/// Capacity after resizing a buffer of `capacity` elements to `size`.
///
/// Zero releases everything, overflow rounds up to a power of two, and
/// anything that fits keeps the current capacity.
pub fn capacity_for(capacity: usize, size: usize) -> usize {
    if size == 0 {
        0
    } else if size > capacity {
        size.next_power_of_two()
    } else {
        capacity
    }
}

/// Copies the elements of `old` that survive a resize to `size` into
/// `new`, returning how many were kept.
fn carry_over<T: Pod>(old: &[T], new: &mut [T], size: usize) -> usize {
    let kept = old.len().min(size).min(new.len());
    new[..kept].copy_from_slice(&old[..kept]);
    kept
}

struct Storage {
    staging: Buffer,
    device: Buffer,
}

/// Device-local array of `T` with a host-visible staging mirror.
pub struct StagedDeviceBuffer<T: Pod> {
    device: Arc<Device>,
    traits: StagedBufferTraits,
    storage: Option<Storage>,
    size: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> StagedDeviceBuffer<T> {
    /// Creates an empty buffer; nothing is allocated until the first resize.
    pub fn new(device: Arc<Device>, traits: StagedBufferTraits) -> Self {
        Self {
            device,
            traits,
            storage: None,
            size: 0,
            capacity: 0,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn traits(&self) -> StagedBufferTraits {
        self.traits
    }

    /// Device-local buffer handle, or null while nothing is allocated.
    pub fn device_buffer(&self) -> vk::Buffer {
        self.storage
            .as_ref()
            .map_or(vk::Buffer::null(), |storage| storage.device.handle())
    }

    /// Resizes to `size` elements, growing capacity as [`capacity_for`]
    /// dictates.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation or the wait barrier fails.
    pub fn resize<W>(&mut self, size: usize, wait: W) -> RhiResult<()>
    where
        W: FnOnce() -> RhiResult<()>,
    {
        self.resize_exact(size, capacity_for(self.capacity, size), wait)
    }

    /// Resizes to `size` elements with exactly `capacity` slots.
    ///
    /// Existing elements up to the new size are preserved. `wait` runs
    /// before the previous buffers are freed and only if they exist.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if `capacity < size`, or an error
    /// if allocation or the wait barrier fails.
    pub fn resize_exact<W>(&mut self, size: usize, capacity: usize, wait: W) -> RhiResult<()>
    where
        W: FnOnce() -> RhiResult<()>,
    {
        if capacity < size {
            return Err(RhiError::InvalidState(format!(
                "staged buffer capacity {} below size {}",
                capacity, size
            )));
        }

        if capacity != self.capacity {
            let replacement = if capacity == 0 {
                None
            } else {
                let storage = self.allocate(capacity)?;
                if let Some(old) = &self.storage {
                    let src = old.staging.mapped_ptr()?.cast::<T>();
                    let dst = storage.staging.mapped_ptr()?.cast::<T>();
                    // SAFETY: both mappings are live and distinct, and hold at
                    // least `self.size` and `capacity` elements respectively.
                    let (old, new) = unsafe {
                        (
                            std::slice::from_raw_parts(src, self.size),
                            std::slice::from_raw_parts_mut(dst, capacity),
                        )
                    };
                    carry_over(old, new, size);
                }
                Some(storage)
            };

            if self.storage.is_some() {
                wait()?;
            }
            self.storage = replacement;
            debug!(
                "Staged buffer of {}B elements: capacity {} -> {}",
                size_of::<T>(),
                self.capacity,
                capacity
            );
            self.capacity = capacity;
        }

        self.size = size;
        Ok(())
    }

    /// Appends `value`, growing if needed.
    ///
    /// # Errors
    ///
    /// See [`resize`](Self::resize).
    pub fn push<W>(&mut self, value: T, wait: W) -> RhiResult<()>
    where
        W: FnOnce() -> RhiResult<()>,
    {
        self.resize(self.size + 1, wait)?;
        let last = self.size - 1;
        self.as_mut_slice()[last] = value;
        Ok(())
    }

    /// Staging contents as a slice.
    pub fn as_slice(&self) -> &[T] {
        match self.staging_ptr() {
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr, self.size) },
            None => &[],
        }
    }

    /// Staging contents as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self.staging_ptr() {
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr, self.size) },
            None => &mut [],
        }
    }

    /// Records the copy of elements `[begin, end)` into `cmd`, for callers
    /// that submit it themselves.
    ///
    /// The staging range must not be written until that submission
    /// completes. Returns `false` when the range is empty.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] for a range outside the buffer.
    pub fn record_flush(
        &self,
        cmd: &crate::command::CommandBuffer<'_>,
        begin: usize,
        end: usize,
    ) -> RhiResult<bool> {
        let Some((storage, region)) = self.flush_region(begin, end)? else {
            return Ok(false);
        };
        record_copy(cmd, storage, region, self.traits);
        Ok(true)
    }

    /// Copies elements `[begin, end)` to the device buffer, signaling
    /// `fence` on completion.
    ///
    /// Returns `None` when the range is empty and nothing was submitted.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] for a range outside the buffer, or
    /// the submission error.
    pub fn flush_async<'e>(
        &self,
        executor: &'e CommandExecutor,
        queue: vk::Queue,
        fence: vk::Fence,
        begin: usize,
        end: usize,
    ) -> RhiResult<Option<PendingCommands<'e>>> {
        let Some((storage, region)) = self.flush_region(begin, end)? else {
            return Ok(None);
        };
        let traits = self.traits;
        let pending = executor.run_cmds_async(
            queue,
            |cmd| {
                record_copy(cmd, storage, region, traits);
                Ok(())
            },
            fence,
        )?;
        Ok(Some(pending))
    }

    /// Copies elements `[begin, end)` to the device buffer and waits.
    ///
    /// # Errors
    ///
    /// See [`flush_async`](Self::flush_async).
    pub fn flush(
        &self,
        executor: &mut CommandExecutor,
        queue: vk::Queue,
        begin: usize,
        end: usize,
    ) -> RhiResult<()> {
        let Some((storage, region)) = self.flush_region(begin, end)? else {
            return Ok(());
        };
        let traits = self.traits;
        executor.run_cmds(queue, |cmd| {
            record_copy(cmd, storage, region, traits);
            Ok(())
        })
    }

    /// Flushes every element and waits.
    ///
    /// # Errors
    ///
    /// See [`flush_async`](Self::flush_async).
    pub fn flush_all(&self, executor: &mut CommandExecutor, queue: vk::Queue) -> RhiResult<()> {
        self.flush(executor, queue, 0, self.size)
    }

    fn flush_region(
        &self,
        begin: usize,
        end: usize,
    ) -> RhiResult<Option<(&Storage, vk::BufferCopy)>> {
        if begin > end || end > self.size {
            return Err(RhiError::InvalidState(format!(
                "flush range {}..{} outside staged buffer of {} elements",
                begin, end, self.size
            )));
        }
        let Some(storage) = self.storage.as_ref().filter(|_| begin < end) else {
            return Ok(None);
        };
        let stride = size_of::<T>() as vk::DeviceSize;
        let offset = begin as vk::DeviceSize * stride;
        let region = vk::BufferCopy {
            src_offset: offset,
            dst_offset: offset,
            size: (end - begin) as vk::DeviceSize * stride,
        };
        Ok(Some((storage, region)))
    }

    fn allocate(&self, capacity: usize) -> RhiResult<Storage> {
        let bytes = (capacity * size_of::<T>()) as vk::DeviceSize;
        let staging = Buffer::new(self.device.clone(), BufferUsage::Staging, bytes)?;
        let ptr = staging.mapped_ptr()?;
        if !(ptr as usize).is_multiple_of(align_of::<T>()) {
            return Err(RhiError::InvalidState(format!(
                "staging mapping misaligned for {}-byte alignment",
                align_of::<T>()
            )));
        }
        let device = Buffer::new(
            self.device.clone(),
            BufferUsage::DeviceLocal(self.traits.usage),
            bytes,
        )?;
        Ok(Storage { staging, device })
    }

    fn staging_ptr(&self) -> Option<*mut T> {
        let storage = self.storage.as_ref()?;
        storage.staging.mapped_ptr().ok().map(|ptr| ptr.cast::<T>())
    }
}

impl<T: Pod> Index<usize> for StagedDeviceBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T: Pod> IndexMut<usize> for StagedDeviceBuffer<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

fn record_copy(
    cmd: &crate::command::CommandBuffer<'_>,
    storage: &Storage,
    region: vk::BufferCopy,
    traits: StagedBufferTraits,
) {
    // Earlier submissions may still be reading the range.
    let before = vk::BufferMemoryBarrier::default()
        .src_access_mask(traits.first_access)
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(storage.device.handle())
        .offset(region.dst_offset)
        .size(region.size);
    cmd.buffer_barrier(traits.first_stage, vk::PipelineStageFlags::TRANSFER, &[before]);
    cmd.copy_buffer(storage.staging.handle(), storage.device.handle(), &[region]);
    let barrier = vk::BufferMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(traits.first_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(storage.device.handle())
        .offset(region.dst_offset)
        .size(region.size);
    cmd.buffer_barrier(vk::PipelineStageFlags::TRANSFER, traits.first_stage, &[barrier]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_scenario() {
        let capacity = capacity_for(0, 1);
        assert_eq!(capacity, 1);
        let capacity = capacity_for(capacity, 3);
        assert_eq!(capacity, 4);
        let capacity = capacity_for(capacity, 0);
        assert_eq!(capacity, 0);
    }

    #[test]
    fn test_growth_preserves_existing_element() {
        let capacity = capacity_for(1, 3);
        assert_eq!(capacity, 4);

        let old = [7u32];
        let mut new = vec![0u32; capacity];
        assert_eq!(carry_over(&old, &mut new, 3), 1);
        assert_eq!(new, vec![7, 0, 0, 0]);
    }

    #[test]
    fn test_exact_shrink_keeps_prefix() {
        let old = [1u32, 2, 3, 4];
        let mut new = vec![0u32; 2];
        assert_eq!(carry_over(&old, &mut new, 2), 2);
        assert_eq!(new, vec![1, 2]);

        let mut empty = vec![9u32; 2];
        assert_eq!(carry_over(&old, &mut empty, 0), 0);
        assert_eq!(empty, vec![9, 9]);
    }

    #[test]
    fn test_shrinking_keeps_capacity() {
        assert_eq!(capacity_for(16, 5), 16);
        assert_eq!(capacity_for(16, 16), 16);
        assert_eq!(capacity_for(16, 17), 32);
    }

    #[test]
    fn test_capacity_is_smallest_power_of_two_of_max_size() {
        let sizes = [3, 9, 2, 7, 33, 1];
        let mut capacity = 0;
        let mut max_size = 0;
        for size in sizes {
            capacity = capacity_for(capacity, size);
            max_size = max_size.max(size);
            assert_eq!(capacity, max_size.next_power_of_two());
            assert!(capacity >= size);
        }
    }

    #[test]
    fn test_instance_traits() {
        assert_eq!(
            StagedBufferTraits::INSTANCE.first_stage,
            vk::PipelineStageFlags::VERTEX_INPUT
        );
        assert!(
            StagedBufferTraits::INSTANCE
                .usage
                .contains(vk::BufferUsageFlags::VERTEX_BUFFER)
        );
    }
}
