//! The frame graph: per-image resources and the acquire, record, submit,
//! blit and present loop.
//!
//! # Overview
//!
//! A [`FrameGraph`] renders into offscreen targets at its own render extent
//! and blits the result onto the presentable image, scaling to the surface
//! extent. It owns:
//!
//! - the descriptor set layouts (static, model, frame) and the pipeline
//!   layout shared by every pipeline
//! - one [`FrameSync`] per frame slot
//! - while assigned to a surface: the depth buffer, the two-subpass render
//!   pass, a descriptor pool and one set of per-image resources for every
//!   surface image
//!
//! The surface itself belongs to the caller and is borrowed per call.
//!
//! # Frame Flow
//!
//! ```text
//! acquire (slot semaphore) ─► wait image fence ─► record render buffer
//!   ─► record blit buffer ─► submit render ─► submit blit (image fence)
//!   ─► present ─► next slot
//! ```
//!
//! When the surface goes stale the graph waits for the device and calls
//! [`SurfaceObserver::on_surface_invalidated`], which is expected to rebuild
//! the surface and [`reassign`](FrameGraph::reassign) the graph.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderer_rhi::command::CommandBuffer;
//! use renderer_rhi::device::Device;
//! use renderer_rhi::swapchain::PresentableSurface;
//! use renderer_rhi::RhiResult;
//! use renderer_renderer::frame_graph::{FrameGraph, FrameGraphDesc, FrameHandle, FrameRecorder, SurfaceObserver};
//! use renderer_renderer::ubo::FrameUbo;
//!
//! struct Clear;
//!
//! impl FrameRecorder for Clear {
//!     fn record_subpass(&mut self, _: &FrameHandle<'_>, _: u32, _: &CommandBuffer<'_>) -> RhiResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! struct Rebuild;
//!
//! impl SurfaceObserver for Rebuild {
//!     fn on_surface_invalidated(&mut self, surface: &mut PresentableSurface, graph: &mut FrameGraph) -> RhiResult<()> {
//!         graph.reassign(surface, None)
//!     }
//! }
//!
//! # fn example(device: Arc<Device>, mut surface: PresentableSurface, desc: FrameGraphDesc) -> RhiResult<()> {
//! let mut graph = FrameGraph::new(device, &surface, desc)?;
//! let frame_ubo = FrameUbo::default();
//! while graph.run_render_pass(&mut surface, &mut Rebuild, &frame_ubo, &mut Clear)? {}
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info};

use renderer_core::Options;
use renderer_rhi::buffer::{Buffer, BufferUsage};
use renderer_rhi::command::{CommandBuffer, CommandExecutor, CommandPool};
use renderer_rhi::descriptor::{
    DescriptorBindingBuilder, DescriptorPool, DescriptorSetLayout, update_descriptor_sets,
    write_combined_image_sampler, write_uniform_buffer,
};
use renderer_rhi::device::Device;
use renderer_rhi::image::{Image, ImageDesc, layout_barrier};
use renderer_rhi::pipeline::{GraphicsPipelineDesc, Pipeline, PipelineLayout};
use renderer_rhi::render_pass::{Framebuffer, RenderPass, SUBPASS_COUNT, clear_values};
use renderer_rhi::swapchain::PresentableSurface;
use renderer_rhi::sync::{Fence, FrameSync, WAIT_FOREVER, create_frame_slots, wait_for_fences};
use renderer_rhi::{RhiError, RhiResult};

use crate::frame::{FrameScheduler, FrameStep, StaticUboTracker};
use crate::ubo::{
    COLOR_MAP_BINDING, FRAME_SET, FrameUbo, MODEL_SET, NORMAL_MAP_BINDING, STATIC_SET, StaticUbo,
    UBO_BINDING,
};

/// Model sets the per-assignment descriptor pool leaves room for.
pub const MODEL_SET_RESERVATION: u32 = 128;

/// Render settings of a frame graph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameGraphDesc {
    /// Extent of the offscreen targets, independent of the surface.
    pub render_extent: vk::Extent2D,
    pub samples: vk::SampleCountFlags,
    pub clear_color: [f32; 4],
    /// Upscale with nearest filtering instead of linear.
    pub upscale_nearest_filter: bool,
}

impl FrameGraphDesc {
    /// Settings taken from `options` for the given extent and sample count.
    pub fn from_options(
        options: &Options,
        render_extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
    ) -> Self {
        Self {
            render_extent,
            samples,
            clear_color: options.world.clear_color,
            upscale_nearest_filter: options.view.upscale_nearest_filter,
        }
    }

    /// Filter of the blit onto the presentable image.
    pub fn blit_filter(&self) -> vk::Filter {
        if self.upscale_nearest_filter {
            vk::Filter::NEAREST
        } else {
            vk::Filter::LINEAR
        }
    }
}

/// Receives surface invalidation.
pub trait SurfaceObserver {
    /// Called with the device idle after the surface reported out of date or
    /// suboptimal. Must rebuild `surface` and reassign `frame_graph`,
    /// together with anything built against the old assignment.
    ///
    /// # Errors
    ///
    /// Errors are returned from [`FrameGraph::run_render_pass`] unchanged.
    fn on_surface_invalidated(
        &mut self,
        surface: &mut PresentableSurface,
        frame_graph: &mut FrameGraph,
    ) -> RhiResult<()>;
}

/// Draw callbacks of a frame.
///
/// `record_subpass` is called once per subpass, in order, with a secondary
/// buffer that already has the static and frame sets bound.
pub trait FrameRecorder {
    fn pre_render(&mut self, _frame: &FrameHandle<'_>) -> RhiResult<()> {
        Ok(())
    }

    fn record_subpass(
        &mut self,
        frame: &FrameHandle<'_>,
        subpass: u32,
        cmd: &CommandBuffer<'_>,
    ) -> RhiResult<()>;

    fn post_render(&mut self, _frame: &FrameHandle<'_>) -> RhiResult<()> {
        Ok(())
    }
}

/// The frame being recorded, as seen by a [`FrameRecorder`].
pub struct FrameHandle<'a> {
    device: &'a Device,
    layout: vk::PipelineLayout,
    image_index: usize,
    slot: usize,
}

impl FrameHandle<'_> {
    #[inline]
    pub fn image_index(&self) -> usize {
        self.image_index
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Points a model set at a model UBO and its color and normal maps.
    ///
    /// The set must not be in use by pending work.
    pub fn update_model_descriptors(
        &self,
        model_ubo: vk::DescriptorBufferInfo,
        color_map: vk::DescriptorImageInfo,
        normal_map: vk::DescriptorImageInfo,
        set: vk::DescriptorSet,
    ) {
        let ubo = [model_ubo];
        let color = [color_map];
        let normal = [normal_map];
        update_descriptor_sets(
            self.device,
            &[
                write_uniform_buffer(set, UBO_BINDING, &ubo),
                write_combined_image_sampler(set, COLOR_MAP_BINDING, &color),
                write_combined_image_sampler(set, NORMAL_MAP_BINDING, &normal),
            ],
        );
    }

    /// Binds a model set at its set index.
    pub fn bind_model_descriptor_set(&self, cmd: &CommandBuffer<'_>, set: vk::DescriptorSet) {
        cmd.bind_descriptor_set(self.layout, MODEL_SET, set);
    }
}

/// SPIR-V of a pipeline's two stages.
#[derive(Clone, Copy, Debug)]
pub struct ShaderSources<'a> {
    pub vertex: &'a [u8],
    pub fragment: &'a [u8],
    pub entry_point: &'a str,
}

pub fn static_set_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 1] {
    [DescriptorBindingBuilder::uniform_buffer(
        UBO_BINDING,
        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
    )]
}

pub fn model_set_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 3] {
    [
        DescriptorBindingBuilder::uniform_buffer(
            UBO_BINDING,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        ),
        DescriptorBindingBuilder::combined_image_sampler(
            COLOR_MAP_BINDING,
            vk::ShaderStageFlags::FRAGMENT,
        ),
        DescriptorBindingBuilder::combined_image_sampler(
            NORMAL_MAP_BINDING,
            vk::ShaderStageFlags::FRAGMENT,
        ),
    ]
}

pub fn frame_set_bindings() -> [vk::DescriptorSetLayoutBinding<'static>; 1] {
    [DescriptorBindingBuilder::uniform_buffer(
        UBO_BINDING,
        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
    )]
}

/// Descriptors one model set consumes, for pools of model sets.
pub fn model_set_pool_sizes() -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(2),
    ]
}

/// Maximum set count and descriptor sizes of the per-assignment pool:
/// a static and a frame set per image plus the model reservation.
pub fn frame_descriptor_pool_sizes(image_count: u32) -> (u32, [vk::DescriptorPoolSize; 2]) {
    let max_sets = 2 * image_count + MODEL_SET_RESERVATION;
    (
        max_sets,
        [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(max_sets),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(2 * MODEL_SET_RESERVATION),
        ],
    )
}

/// Resources of one presentable image.
struct PerImageResources {
    framebuffer: Framebuffer,
    resolve_target: Option<Image>,
    render_target: Image,
    command_pool: CommandPool,
    render_cmd: vk::CommandBuffer,
    blit_cmd: vk::CommandBuffer,
    subpass_cmds: [vk::CommandBuffer; SUBPASS_COUNT],
    static_ubo: Buffer,
    frame_ubo: Buffer,
    static_set: vk::DescriptorSet,
    frame_set: vk::DescriptorSet,
    static_copy_fence: Fence,
    /// Signaled when the image's last submission completed.
    available: Fence,
}

/// What per-image resources are built against.
struct ImageTargets<'a> {
    render_pass: &'a RenderPass,
    depth: &'a Image,
    descriptor_pool: &'a DescriptorPool,
    static_layout: vk::DescriptorSetLayout,
    frame_layout: vk::DescriptorSetLayout,
    color_format: vk::Format,
    extent: vk::Extent2D,
}

impl PerImageResources {
    fn new(device: &Arc<Device>, targets: &ImageTargets<'_>) -> RhiResult<Self> {
        let samples = targets.render_pass.samples();
        let render_target = Image::new(
            device.clone(),
            ImageDesc::render_target(targets.extent, targets.color_format, samples),
        )?;
        let resolve_target = if targets.render_pass.resolves() {
            Some(Image::new(
                device.clone(),
                ImageDesc::resolve_target(targets.extent, targets.color_format),
            )?)
        } else {
            None
        };

        let mut attachments = vec![render_target.view(), targets.depth.view()];
        attachments.extend(resolve_target.as_ref().map(Image::view));
        let framebuffer = Framebuffer::new(
            device.clone(),
            targets.render_pass,
            &attachments,
            targets.extent,
        )?;

        let command_pool = CommandPool::new(
            device.clone(),
            device.graphics_family(),
            vk::CommandPoolCreateFlags::empty(),
        )?;
        let primary = command_pool.allocate(vk::CommandBufferLevel::PRIMARY, 2)?;
        let secondary =
            command_pool.allocate(vk::CommandBufferLevel::SECONDARY, SUBPASS_COUNT as u32)?;
        let (&[render_cmd, blit_cmd], &[subpass0, subpass1]) =
            (primary.as_slice(), secondary.as_slice())
        else {
            return Err(RhiError::InvalidState(
                "unexpected command buffer count".to_string(),
            ));
        };

        let static_ubo = Buffer::new(
            device.clone(),
            BufferUsage::DeviceUniform,
            StaticUbo::SIZE as vk::DeviceSize,
        )?;
        let frame_ubo = Buffer::new(
            device.clone(),
            BufferUsage::Uniform,
            FrameUbo::SIZE as vk::DeviceSize,
        )?;

        let sets = targets
            .descriptor_pool
            .allocate(&[targets.static_layout, targets.frame_layout])?;
        let &[static_set, frame_set] = sets.as_slice() else {
            return Err(RhiError::InvalidState(
                "unexpected descriptor set count".to_string(),
            ));
        };

        Ok(Self {
            framebuffer,
            resolve_target,
            render_target,
            command_pool,
            render_cmd,
            blit_cmd,
            subpass_cmds: [subpass0, subpass1],
            static_ubo,
            frame_ubo,
            static_set,
            frame_set,
            static_copy_fence: Fence::new(device.clone(), false)?,
            available: Fence::new(device.clone(), true)?,
        })
    }

    /// Image the blit reads from.
    fn blit_source(&self) -> &Image {
        self.resolve_target.as_ref().unwrap_or(&self.render_target)
    }
}

/// Everything tied to one surface.
struct Assignment {
    // Declared in destruction order.
    images: Vec<PerImageResources>,
    descriptor_pool: DescriptorPool,
    render_pass: RenderPass,
    depth: Image,
}

/// Renders frames onto a [`PresentableSurface`].
///
/// # Thread Safety
///
/// Not thread-safe. Every method takes `&mut self` or is read-only, and the
/// graph is driven from the thread that owns the surface.
pub struct FrameGraph {
    // Declared in destruction order.
    assignment: Option<Assignment>,
    static_ubo_base: Buffer,
    executor: CommandExecutor,
    frame_slots: Vec<FrameSync>,
    pipeline_layout: PipelineLayout,
    set_layouts: [DescriptorSetLayout; 3],
    scheduler: FrameScheduler,
    static_ubo: StaticUboTracker,
    desc: FrameGraphDesc,
    device: Arc<Device>,
}

impl FrameGraph {
    /// Creates the graph and assigns it to `surface`.
    ///
    /// # Errors
    ///
    /// Returns an error if any Vulkan object cannot be created.
    pub fn new(
        device: Arc<Device>,
        surface: &PresentableSurface,
        desc: FrameGraphDesc,
    ) -> RhiResult<Self> {
        let set_layouts = [
            DescriptorSetLayout::new(device.clone(), &static_set_bindings())?,
            DescriptorSetLayout::new(device.clone(), &model_set_bindings())?,
            DescriptorSetLayout::new(device.clone(), &frame_set_bindings())?,
        ];
        let pipeline_layout =
            PipelineLayout::new(device.clone(), &set_layouts.each_ref().map(|l| l.handle()))?;
        let static_ubo_base = Buffer::new(
            device.clone(),
            BufferUsage::UniformSource,
            StaticUbo::SIZE as vk::DeviceSize,
        )?;
        let executor = CommandExecutor::new(device.clone(), device.graphics_family())?;
        let frame_slots = create_frame_slots(&device)?;

        let mut graph = Self {
            assignment: None,
            static_ubo_base,
            executor,
            scheduler: FrameScheduler::new(frame_slots.len()),
            frame_slots,
            pipeline_layout,
            set_layouts,
            static_ubo: StaticUboTracker::default(),
            desc,
            device,
        };
        graph.assign(surface)?;
        Ok(graph)
    }

    /// Builds the resources for every image of `surface`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the graph is already assigned,
    /// or an error if resource creation fails.
    pub fn assign(&mut self, surface: &PresentableSurface) -> RhiResult<()> {
        if self.assignment.is_some() {
            return Err(RhiError::InvalidState(
                "frame graph is already assigned".to_string(),
            ));
        }
        self.device.wait_idle()?;

        let extent = self.desc.render_extent;
        let depth = Image::new(
            self.device.clone(),
            ImageDesc::depth(extent, self.device.depth_format(), self.desc.samples),
        )?;
        let render_pass = RenderPass::new(
            self.device.clone(),
            surface.format(),
            self.device.depth_format(),
            self.desc.samples,
        )?;

        let image_count = u32::try_from(surface.image_count()).map_err(|_| {
            RhiError::InvalidState(format!("{} surface images", surface.image_count()))
        })?;
        let (max_sets, pool_sizes) = frame_descriptor_pool_sizes(image_count);
        let descriptor_pool = DescriptorPool::new(self.device.clone(), max_sets, &pool_sizes)?;

        let targets = ImageTargets {
            render_pass: &render_pass,
            depth: &depth,
            descriptor_pool: &descriptor_pool,
            static_layout: self.set_layouts[STATIC_SET as usize].handle(),
            frame_layout: self.set_layouts[FRAME_SET as usize].handle(),
            color_format: surface.format(),
            extent,
        };
        let images = (0..surface.image_count())
            .map(|_| PerImageResources::new(&self.device, &targets))
            .collect::<RhiResult<Vec<_>>>()?;

        self.static_ubo.reset_images(images.len());
        self.assignment = Some(Assignment {
            images,
            descriptor_pool,
            render_pass,
            depth,
        });

        let surface_extent = surface.extent();
        info!(
            "Frame graph assigned: {} images, render {}x{} onto {}x{}, {:?}",
            image_count,
            extent.width,
            extent.height,
            surface_extent.width,
            surface_extent.height,
            self.desc.samples
        );
        Ok(())
    }

    /// Releases everything built by [`assign`](Self::assign).
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the graph is not assigned, or an
    /// error if the device wait fails.
    pub fn unassign(&mut self) -> RhiResult<()> {
        if self.assignment.is_none() {
            return Err(RhiError::InvalidState(
                "frame graph is not assigned".to_string(),
            ));
        }
        self.device.wait_idle()?;
        self.assignment = None;
        debug!("Frame graph unassigned");
        Ok(())
    }

    /// Moves the graph onto a rebuilt surface, optionally at a new render
    /// extent. The next frame is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting or rebuilding fails.
    pub fn reassign(
        &mut self,
        surface: &PresentableSurface,
        render_extent: Option<vk::Extent2D>,
    ) -> RhiResult<()> {
        if self.assignment.is_some() {
            self.wait_idle(WAIT_FOREVER)?;
            self.unassign()?;
        }
        if let Some(extent) = render_extent {
            self.desc.render_extent = extent;
        }
        self.assign(surface)?;
        self.scheduler.skip_next_frame();
        Ok(())
    }

    /// Skips the next frame and waits until every image's last submission
    /// has completed.
    ///
    /// # Errors
    ///
    /// Returns `VK_TIMEOUT` as an error if `timeout` nanoseconds pass first.
    pub fn wait_idle(&mut self, timeout: u64) -> RhiResult<()> {
        self.scheduler.skip_next_frame();
        let Some(assignment) = &self.assignment else {
            return Ok(());
        };
        let fences: Vec<vk::Fence> = assignment
            .images
            .iter()
            .map(|image| image.available.handle())
            .collect();
        wait_for_fences(&self.device, &fences, timeout)
    }

    /// Uploads new static uniforms. Each image picks them up on its next
    /// frame; intermediate values are never copied.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging upload fails.
    pub fn set_static_ubo(&mut self, data: &StaticUbo) -> RhiResult<()> {
        self.static_ubo_base.stage_data(
            &mut self.executor,
            self.device.graphics_queue(),
            0,
            bytemuck::bytes_of(data),
        )?;
        self.static_ubo.bump();
        debug!("Static UBO written (revision {})", self.static_ubo.base_counter());
        Ok(())
    }

    /// Builds a pipeline for `subpass` against the current render pass.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the graph is not assigned, or an
    /// error if pipeline creation fails.
    pub fn build_pipeline(
        &self,
        shaders: &ShaderSources<'_>,
        subpass: u32,
        invert_culling: bool,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
    ) -> RhiResult<Pipeline> {
        if subpass as usize >= SUBPASS_COUNT {
            return Err(RhiError::PipelineError(format!(
                "subpass {} does not exist",
                subpass
            )));
        }
        let assignment = self.assigned()?;
        Pipeline::build(
            self.device.clone(),
            &GraphicsPipelineDesc {
                render_pass: assignment.render_pass.handle(),
                layout: self.pipeline_layout.handle(),
                vertex_spirv: shaders.vertex,
                fragment_spirv: shaders.fragment,
                entry_point: shaders.entry_point,
                subpass,
                invert_culling,
                extent,
                samples,
            },
        )
    }

    /// Renders and presents one frame.
    ///
    /// Returns `false` without rendering when the frame was skipped or the
    /// surface went stale; `observer` has been called in the latter case.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidState`] if the graph is not assigned to
    /// `surface`, or any non-recoverable Vulkan error.
    pub fn run_render_pass(
        &mut self,
        surface: &mut PresentableSurface,
        observer: &mut dyn SurfaceObserver,
        frame_ubo: &FrameUbo,
        recorder: &mut dyn FrameRecorder,
    ) -> RhiResult<bool> {
        let image_count = self.assigned()?.images.len();
        if surface.image_count() != image_count {
            return Err(RhiError::InvalidState(format!(
                "surface has {} images, frame graph was assigned {}",
                surface.image_count(),
                image_count
            )));
        }
        if !self.scheduler.begin_frame() {
            return Ok(false);
        }

        let slot = self.scheduler.current_slot();
        let acquired = surface.acquire(self.frame_slots[slot].image_acquired())?;
        let index = match self.scheduler.on_acquire(acquired, image_count)? {
            FrameStep::Render(index) => index,
            FrameStep::Presented | FrameStep::Invalidate => {
                info!("Surface out of date on acquire");
                self.invalidate(surface, observer)?;
                return Ok(false);
            }
        };

        let refresh_static = self.static_ubo.is_stale(index);
        self.record_and_submit(
            surface,
            index,
            slot,
            refresh_static,
            frame_ubo,
            recorder,
        )?;
        if refresh_static {
            self.static_ubo.mark_current(index);
        }

        let status = surface.present(
            self.device.present_queue(),
            index as u32,
            self.frame_slots[slot].blit_done(),
        )?;
        match self.scheduler.on_present(status) {
            FrameStep::Presented => Ok(true),
            FrameStep::Render(_) | FrameStep::Invalidate => {
                info!("Surface {:?} on present", status);
                self.invalidate(surface, observer)?;
                Ok(false)
            }
        }
    }

    fn invalidate(
        &mut self,
        surface: &mut PresentableSurface,
        observer: &mut dyn SurfaceObserver,
    ) -> RhiResult<()> {
        self.device.wait_idle()?;
        observer.on_surface_invalidated(surface, self)
    }

    fn record_and_submit(
        &self,
        surface: &PresentableSurface,
        index: usize,
        slot: usize,
        refresh_static: bool,
        frame_ubo: &FrameUbo,
        recorder: &mut dyn FrameRecorder,
    ) -> RhiResult<()> {
        let assignment = self.assigned()?;
        let image = &assignment.images[index];
        let sync = &self.frame_slots[slot];
        let presentable = surface.image(index);

        image.available.wait(WAIT_FOREVER)?;
        image.command_pool.reset()?;

        let cmd = CommandBuffer::new(&self.device, image.render_cmd);
        cmd.begin()?;
        cmd.image_barrier(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            &[layout_barrier(
                presentable,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::empty(),
                vk::AccessFlags::empty(),
            )],
        );
        cmd.begin_render_pass(
            assignment.render_pass.handle(),
            image.framebuffer.handle(),
            self.desc.render_extent,
            &clear_values(self.desc.clear_color),
        );

        if refresh_static {
            self.refresh_static_ubo(image)?;
        }
        let frame_info = [image.frame_ubo.descriptor_info()];
        update_descriptor_sets(
            &self.device,
            &[write_uniform_buffer(image.frame_set, UBO_BINDING, &frame_info)],
        );
        image.frame_ubo.write_pod(frame_ubo)?;

        let frame = FrameHandle {
            device: &self.device,
            layout: self.pipeline_layout.handle(),
            image_index: index,
            slot,
        };
        recorder.pre_render(&frame)?;
        for (subpass, &secondary) in image.subpass_cmds.iter().enumerate() {
            if subpass > 0 {
                cmd.next_subpass();
            }
            let subpass = subpass as u32;
            let sub = CommandBuffer::new(&self.device, secondary);
            sub.begin_secondary(
                assignment.render_pass.handle(),
                subpass,
                image.framebuffer.handle(),
            )?;
            sub.bind_descriptor_set(frame.layout, STATIC_SET, image.static_set);
            sub.bind_descriptor_set(frame.layout, FRAME_SET, image.frame_set);
            recorder.record_subpass(&frame, subpass, &sub)?;
            sub.end()?;
            cmd.execute_commands(&[secondary]);
        }
        recorder.post_render(&frame)?;
        cmd.end_render_pass();
        cmd.end()?;

        self.record_blit(image, presentable, surface.extent())?;

        let render_wait = [sync.image_acquired()];
        let render_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let render_cmds = [image.render_cmd];
        let render_signal = [sync.render_done()];
        let blit_wait = [sync.render_done()];
        let blit_stages = [vk::PipelineStageFlags::TRANSFER];
        let blit_cmds = [image.blit_cmd];
        let blit_signal = [sync.blit_done()];
        let submits = [
            vk::SubmitInfo::default()
                .wait_semaphores(&render_wait)
                .wait_dst_stage_mask(&render_stages)
                .command_buffers(&render_cmds)
                .signal_semaphores(&render_signal),
            vk::SubmitInfo::default()
                .wait_semaphores(&blit_wait)
                .wait_dst_stage_mask(&blit_stages)
                .command_buffers(&blit_cmds)
                .signal_semaphores(&blit_signal),
        ];
        // Unsignaled only once the work that signals it is about to be queued.
        image.available.reset()?;
        unsafe {
            self.device
                .submit(self.device.graphics_queue(), &submits, image.available.handle())
        }
    }

    /// Copies the base static UBO into the image's copy and rewrites the
    /// static set, waiting for the copy.
    fn refresh_static_ubo(&self, image: &PerImageResources) -> RhiResult<()> {
        image.static_copy_fence.reset()?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: StaticUbo::SIZE as vk::DeviceSize,
        };
        let pending = self.executor.run_cmds_async(
            self.device.graphics_queue(),
            |cmd| {
                cmd.copy_buffer(
                    self.static_ubo_base.handle(),
                    image.static_ubo.handle(),
                    &[region],
                );
                Ok(())
            },
            image.static_copy_fence.handle(),
        )?;
        pending.wait(WAIT_FOREVER)?;

        let static_info = [image.static_ubo.descriptor_info()];
        update_descriptor_sets(
            &self.device,
            &[write_uniform_buffer(image.static_set, UBO_BINDING, &static_info)],
        );
        Ok(())
    }

    fn record_blit(
        &self,
        image: &PerImageResources,
        presentable: vk::Image,
        surface_extent: vk::Extent2D,
    ) -> RhiResult<()> {
        let source = image.blit_source();
        let cmd = CommandBuffer::new(&self.device, image.blit_cmd);
        cmd.begin()?;
        cmd.image_barrier(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            &[
                layout_barrier(
                    source.handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                ),
                layout_barrier(
                    presentable,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                ),
            ],
        );
        cmd.blit_color_image(
            source.handle(),
            self.desc.render_extent,
            presentable,
            surface_extent,
            self.desc.blit_filter(),
        );
        cmd.image_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &[layout_barrier(
                presentable,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::empty(),
            )],
        );
        cmd.end()
    }

    fn assigned(&self) -> RhiResult<&Assignment> {
        self.assignment
            .as_ref()
            .ok_or_else(|| RhiError::InvalidState("frame graph is not assigned".to_string()))
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn is_assigned(&self) -> bool {
        self.assignment.is_some()
    }

    #[inline]
    pub fn desc(&self) -> &FrameGraphDesc {
        &self.desc
    }

    #[inline]
    pub fn render_extent(&self) -> vk::Extent2D {
        self.desc.render_extent
    }

    #[inline]
    pub fn samples(&self) -> vk::SampleCountFlags {
        self.desc.samples
    }

    #[inline]
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout.handle()
    }

    /// Layout of model sets, for pools the caller allocates them from.
    #[inline]
    pub fn model_set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layouts[MODEL_SET as usize].handle()
    }

    /// Number of assigned images, zero while unassigned.
    pub fn image_count(&self) -> usize {
        self.assignment.as_ref().map_or(0, |a| a.images.len())
    }

    #[inline]
    pub fn current_slot(&self) -> usize {
        self.scheduler.current_slot()
    }
}

impl Drop for FrameGraph {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle before destroying frame graph: {}", e);
        }
        self.assignment = None;
        debug!("Destroyed frame graph");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blit_filter() {
        let mut desc = FrameGraphDesc::from_options(
            &Options::default(),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
            vk::SampleCountFlags::TYPE_1,
        );
        assert!(desc.upscale_nearest_filter);
        assert_eq!(desc.blit_filter(), vk::Filter::NEAREST);
        desc.upscale_nearest_filter = false;
        assert_eq!(desc.blit_filter(), vk::Filter::LINEAR);
        assert_eq!(desc.clear_color, [0.2, 0.2, 0.7, 1.0]);
    }

    #[test]
    fn test_model_set_bindings() {
        let bindings = model_set_bindings();
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(bindings[1].binding, COLOR_MAP_BINDING);
        assert_eq!(bindings[2].binding, NORMAL_MAP_BINDING);
        assert!(
            bindings[1..]
                .iter()
                .all(|b| b.descriptor_type == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        );
    }

    #[test]
    fn test_static_and_frame_bindings() {
        assert_eq!(static_set_bindings()[0].binding, UBO_BINDING);
        assert_eq!(
            frame_set_bindings()[0].descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER
        );
    }

    #[test]
    fn test_frame_descriptor_pool_sizes() {
        let (max_sets, sizes) = frame_descriptor_pool_sizes(3);
        assert_eq!(max_sets, 6 + MODEL_SET_RESERVATION);
        assert_eq!(sizes[0].descriptor_count, max_sets);
        assert_eq!(sizes[1].descriptor_count, 2 * MODEL_SET_RESERVATION);
    }

    #[test]
    fn test_model_set_pool_sizes_match_bindings() {
        let sizes = model_set_pool_sizes();
        let samplers = model_set_bindings()
            .iter()
            .filter(|b| b.descriptor_type == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .count() as u32;
        assert_eq!(sizes[1].descriptor_count, samplers);
    }

    #[test]
    fn test_frame_graph_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<FrameGraph>();
    }
}
