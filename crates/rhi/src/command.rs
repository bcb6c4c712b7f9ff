//! Command pools, command buffer recording and one-shot submission.
//!
//! # Overview
//!
//! - [`CommandPool`] manages a VkCommandPool and allocates buffers from it
//! - [`CommandBuffer`] is a borrowed view over a VkCommandBuffer with
//!   recording helpers
//! - [`CommandExecutor`] records and submits one-shot work, either waiting on
//!   a shared fence ([`CommandExecutor::run_cmds`]) or handing back a
//!   [`PendingCommands`] guard tied to a caller fence
//!   ([`CommandExecutor::run_cmds_async`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderer_rhi::device::Device;
//! use renderer_rhi::command::CommandExecutor;
//!
//! # fn example(device: Arc<Device>, src: ash::vk::Buffer, dst: ash::vk::Buffer) -> Result<(), renderer_rhi::RhiError> {
//! let mut executor = CommandExecutor::new(device.clone(), device.graphics_family())?;
//! executor.run_cmds(device.graphics_queue(), |cmd| {
//!     cmd.copy_buffer(src, dst, &[ash::vk::BufferCopy { src_offset: 0, dst_offset: 0, size: 64 }]);
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;
use crate::sync::{Fence, WAIT_FOREVER};

/// Vulkan command pool wrapper.
///
/// # Thread Safety
///
/// Command pools are externally synchronized: allocation, reset and free
/// must not race. Every pool in this crate is owned by a single thread.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
    queue_family_index: u32,
}

impl CommandPool {
    /// Creates a new command pool for the specified queue family.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `queue_family_index` - The queue family for command buffer submission
    /// * `flags` - Creation flags, e.g. `TRANSIENT` for one-shot pools
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(
        device: Arc<Device>,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(flags);

        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };
        debug!(
            "Command pool created for queue family {} ({:?})",
            queue_family_index, flags
        );

        Ok(Self {
            device,
            pool,
            queue_family_index,
        })
    }

    /// Returns the Vulkan command pool handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Allocates `count` command buffers of the given level.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn allocate(
        &self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(count);
        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        Ok(buffers)
    }

    /// Returns buffers to the pool.
    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        unsafe {
            self.device
                .handle()
                .free_command_buffers(self.pool, buffers);
        }
    }

    /// Resets every buffer allocated from this pool to the initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&self) -> RhiResult<()> {
        unsafe {
            self.device
                .handle()
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
        debug!(
            "Destroyed command pool for queue family {}",
            self.queue_family_index
        );
    }
}

/// Recording view over a command buffer.
///
/// The view borrows the device and does not own the buffer; the pool that
/// allocated it does.
#[derive(Clone, Copy)]
pub struct CommandBuffer<'a> {
    device: &'a Device,
    buffer: vk::CommandBuffer,
}

impl<'a> CommandBuffer<'a> {
    /// Wraps an existing command buffer handle.
    #[inline]
    pub fn new(device: &'a Device, buffer: vk::CommandBuffer) -> Self {
        Self { device, buffer }
    }

    /// Returns the raw Vulkan command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Returns the device the buffer records for.
    #[inline]
    pub fn device(&self) -> &'a Device {
        self.device
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins recording for a single submission.
    ///
    /// # Errors
    ///
    /// Returns an error if beginning fails (e.g., if already recording).
    pub fn begin(&self) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)?;
        }
        Ok(())
    }

    /// Begins recording a secondary buffer that continues `subpass` of
    /// `render_pass` inside `framebuffer`.
    ///
    /// # Errors
    ///
    /// Returns an error if beginning fails.
    pub fn begin_secondary(
        &self,
        render_pass: vk::RenderPass,
        subpass: u32,
        framebuffer: vk::Framebuffer,
    ) -> RhiResult<()> {
        let inheritance = vk::CommandBufferInheritanceInfo::default()
            .render_pass(render_pass)
            .subpass(subpass)
            .framebuffer(framebuffer)
            .occlusion_query_enable(false);
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                    | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            )
            .inheritance_info(&inheritance);
        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)?;
        }
        Ok(())
    }

    /// Ends recording.
    ///
    /// # Errors
    ///
    /// Returns an error if ending fails (e.g., if not recording).
    pub fn end(&self) -> RhiResult<()> {
        unsafe {
            self.device.handle().end_command_buffer(self.buffer)?;
        }
        Ok(())
    }

    // =========================================================================
    // Render Pass
    // =========================================================================

    /// Begins a render pass whose subpasses are recorded in secondary buffers.
    pub fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        unsafe {
            self.device.handle().cmd_begin_render_pass(
                self.buffer,
                &begin_info,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            );
        }
    }

    pub fn next_subpass(&self) {
        unsafe {
            self.device
                .handle()
                .cmd_next_subpass(self.buffer, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS);
        }
    }

    pub fn end_render_pass(&self) {
        unsafe {
            self.device.handle().cmd_end_render_pass(self.buffer);
        }
    }

    /// Executes secondary buffers inside the current subpass.
    pub fn execute_commands(&self, command_buffers: &[vk::CommandBuffer]) {
        unsafe {
            self.device
                .handle()
                .cmd_execute_commands(self.buffer, command_buffers);
        }
    }

    // =========================================================================
    // Binding and Drawing
    // =========================================================================

    pub fn bind_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.handle().cmd_bind_pipeline(
                self.buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            );
        }
    }

    /// Binds vertex buffers starting at `first_binding`, all at offset zero.
    pub fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[vk::Buffer]) {
        let offsets = vec![0; buffers.len()];
        unsafe {
            self.device.handle().cmd_bind_vertex_buffers(
                self.buffer,
                first_binding,
                buffers,
                &offsets,
            );
        }
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer, index_type: vk::IndexType) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_index_buffer(self.buffer, buffer, 0, index_type);
        }
    }

    /// Binds a single graphics descriptor set at index `set`.
    pub fn bind_descriptor_set(
        &self,
        layout: vk::PipelineLayout,
        set: u32,
        descriptor_set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                self.buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set,
                &[descriptor_set],
                &[],
            );
        }
    }

    pub fn set_line_width(&self, width: f32) {
        unsafe {
            self.device.handle().cmd_set_line_width(self.buffer, width);
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.handle().cmd_draw_indexed(
                self.buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Inserts a pipeline barrier made of image barriers only.
    pub fn image_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                self.buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                image_barriers,
            );
        }
    }

    /// Inserts a pipeline barrier made of buffer barriers only.
    pub fn buffer_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
    ) {
        unsafe {
            self.device.handle().cmd_pipeline_barrier(
                self.buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                &[],
            );
        }
    }

    // =========================================================================
    // Transfer
    // =========================================================================

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(self.buffer, src, dst, regions);
        }
    }

    /// Copies tightly packed buffer data into an image in
    /// `TRANSFER_DST_OPTIMAL` layout.
    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device.handle().cmd_copy_buffer_to_image(
                self.buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            );
        }
    }

    /// Blits the whole color subresource of `src` onto `dst`, scaling
    /// between the two extents.
    pub fn blit_color_image(
        &self,
        src: vk::Image,
        src_extent: vk::Extent2D,
        dst: vk::Image,
        dst_extent: vk::Extent2D,
        filter: vk::Filter,
    ) {
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: subresource,
            src_offsets: [vk::Offset3D::default(), extent_to_offset(src_extent)],
            dst_subresource: subresource,
            dst_offsets: [vk::Offset3D::default(), extent_to_offset(dst_extent)],
        };
        unsafe {
            self.device.handle().cmd_blit_image(
                self.buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                filter,
            );
        }
    }
}

/// Far corner of a 2D extent as a blit offset.
fn extent_to_offset(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

/// Records and submits one-shot command buffers.
///
/// Synchronous submissions share one internal fence, so
/// [`run_cmds`](Self::run_cmds) takes `&mut self`; the borrow checker
/// rules out reentrant use.
pub struct CommandExecutor {
    // Field order matters: buffers outstanding in a `PendingCommands` borrow
    // the pool, and the fence may be destroyed independently of it.
    pool: CommandPool,
    fence: Fence,
}

impl CommandExecutor {
    /// Creates an executor whose buffers are submitted to queues of
    /// `queue_family_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool or fence cannot be created.
    pub fn new(device: Arc<Device>, queue_family_index: u32) -> RhiResult<Self> {
        let pool = CommandPool::new(
            device.clone(),
            queue_family_index,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let fence = Fence::new(device, false)?;
        Ok(Self { pool, fence })
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        self.pool.device()
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.pool.queue_family_index()
    }

    /// Records `record` into a fresh buffer, submits it to `queue` and waits
    /// for completion.
    ///
    /// # Errors
    ///
    /// Returns the first recording, submission or wait error. The buffer is
    /// freed in every case.
    pub fn run_cmds<F>(&mut self, queue: vk::Queue, record: F) -> RhiResult<()>
    where
        F: FnOnce(&CommandBuffer<'_>) -> RhiResult<()>,
    {
        let buffer = self.record(record)?;
        let result = self.submit(queue, buffer, self.fence.handle()).and_then(|()| {
            self.fence.wait(WAIT_FOREVER)?;
            self.fence.reset()
        });
        self.pool.free(&[buffer]);
        result
    }

    /// Records `record` into a fresh buffer and submits it to `queue`,
    /// signaling `fence` on completion.
    ///
    /// The returned guard frees the buffer when dropped. It does not wait:
    /// the caller must make sure `fence` has signaled before dropping it.
    ///
    /// # Errors
    ///
    /// Returns the first recording or submission error.
    pub fn run_cmds_async<F>(
        &self,
        queue: vk::Queue,
        record: F,
        fence: vk::Fence,
    ) -> RhiResult<PendingCommands<'_>>
    where
        F: FnOnce(&CommandBuffer<'_>) -> RhiResult<()>,
    {
        let buffer = self.record(record)?;
        if let Err(e) = self.submit(queue, buffer, fence) {
            self.pool.free(&[buffer]);
            return Err(e);
        }
        Ok(PendingCommands {
            pool: &self.pool,
            buffer,
            fence,
        })
    }

    fn record<F>(&self, record: F) -> RhiResult<vk::CommandBuffer>
    where
        F: FnOnce(&CommandBuffer<'_>) -> RhiResult<()>,
    {
        let buffer = self.pool.allocate(vk::CommandBufferLevel::PRIMARY, 1)?[0];
        let cmd = CommandBuffer::new(self.pool.device(), buffer);
        let recorded = cmd.begin().and_then(|()| record(&cmd)).and_then(|()| cmd.end());
        if let Err(e) = recorded {
            self.pool.free(&[buffer]);
            return Err(e);
        }
        Ok(buffer)
    }

    fn submit(&self, queue: vk::Queue, buffer: vk::CommandBuffer, fence: vk::Fence) -> RhiResult<()> {
        let buffers = [buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&buffers);
        unsafe { self.pool.device().submit(queue, &[submit_info], fence) }
    }
}

/// A submitted one-shot command buffer.
///
/// Dropping the guard frees the buffer; call [`wait`](Self::wait) first
/// unless the fence is known to have signaled.
#[must_use = "dropping pending commands frees a buffer that may still be executing"]
pub struct PendingCommands<'a> {
    pool: &'a CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl PendingCommands<'_> {
    /// Fence signaled on completion.
    #[inline]
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks until the submission completes, then frees the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails or times out.
    pub fn wait(self, timeout: u64) -> RhiResult<()> {
        crate::sync::wait_for_fences(self.pool.device(), &[self.fence], timeout)
    }
}

impl Drop for PendingCommands<'_> {
    fn drop(&mut self) {
        self.pool.free(&[self.buffer]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_to_offset() {
        let offset = extent_to_offset(vk::Extent2D {
            width: 800,
            height: 600,
        });
        assert_eq!((offset.x, offset.y, offset.z), (800, 600, 1));
    }

    #[test]
    fn test_executor_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandExecutor>();
        assert_send::<CommandPool>();
    }
}
