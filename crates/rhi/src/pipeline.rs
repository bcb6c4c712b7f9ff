//! Graphics pipeline and pipeline layout management.
//!
//! # Overview
//!
//! - [`PipelineLayout`] wraps VkPipelineLayout, built from the ordered
//!   descriptor set layouts shared by every pipeline of a render pass
//! - [`Pipeline`] builds a graphics pipeline for one subpass from a pair of
//!   SPIR-V modules and the fixed state the frame graph draws with
//!
//! Fixed state:
//! - triangle lists over [`Vertex`](crate::vertex::Vertex) and
//!   [`Instance`](crate::vertex::Instance) bindings
//! - static viewport and scissor covering the render extent
//! - counter-clockwise front faces, back culling or front culling when
//!   inverted (outlines draw the inside of an extruded hull)
//! - depth test and write with `LESS_OR_EQUAL`
//! - line width as the only dynamic state
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use renderer_rhi::device::Device;
//! use renderer_rhi::pipeline::{GraphicsPipelineDesc, Pipeline};
//!
//! # fn example(device: Arc<Device>, render_pass: vk::RenderPass, layout: vk::PipelineLayout, vert: &[u8], frag: &[u8]) -> Result<(), renderer_rhi::RhiError> {
//! let pipeline = Pipeline::build(device, &GraphicsPipelineDesc {
//!     render_pass,
//!     layout,
//!     vertex_spirv: vert,
//!     fragment_spirv: frag,
//!     entry_point: "main",
//!     subpass: 0,
//!     invert_culling: false,
//!     extent: vk::Extent2D { width: 800, height: 600 },
//!     samples: vk::SampleCountFlags::TYPE_1,
//! })?;
//! let _handle = pipeline.handle();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info};

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::shader::{Shader, ShaderStage};
use crate::vertex::{vertex_input_attributes, vertex_input_bindings};

/// Line width pipelines are created with; outlines override it dynamically.
pub const LINE_WIDTH: f32 = 1.0;

/// Depth comparison of every pipeline.
pub const DEPTH_COMPARE_OP: vk::CompareOp = vk::CompareOp::LESS_OR_EQUAL;

/// Pipeline layout wrapper.
pub struct PipelineLayout {
    device: Arc<Device>,
    layout: vk::PipelineLayout,
}

impl PipelineLayout {
    /// Creates a pipeline layout from descriptor set layouts, in set order.
    ///
    /// # Errors
    ///
    /// Returns an error if pipeline layout creation fails.
    pub fn new(
        device: Arc<Device>,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> RhiResult<Self> {
        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        let layout = unsafe { device.handle().create_pipeline_layout(&create_info, None)? };

        debug!(
            "Created pipeline layout with {} descriptor set layout(s)",
            set_layouts.len()
        );

        Ok(Self { device, layout })
    }

    /// Returns the Vulkan pipeline layout handle.
    #[inline]
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_pipeline_layout(self.layout, None);
        }
        debug!("Destroyed pipeline layout");
    }
}

/// Everything a graphics pipeline is built from.
#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineDesc<'a> {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub vertex_spirv: &'a [u8],
    pub fragment_spirv: &'a [u8],
    /// Entry point of both modules.
    pub entry_point: &'a str,
    pub subpass: u32,
    /// Cull front faces instead of back faces.
    pub invert_culling: bool,
    pub extent: vk::Extent2D,
    pub samples: vk::SampleCountFlags,
}

/// Graphics pipeline together with its shader modules.
///
/// Dropping waits for the device to go idle first. Pipelines must be
/// dropped before the render pass and layout they were built against.
pub struct Pipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    subpass: u32,
    _shaders: [Shader; 2],
}

impl Pipeline {
    /// Builds a pipeline for `desc.subpass` of `desc.render_pass`.
    ///
    /// # Errors
    ///
    /// Returns an error if the SPIR-V is invalid or pipeline creation fails.
    pub fn build(device: Arc<Device>, desc: &GraphicsPipelineDesc<'_>) -> RhiResult<Self> {
        let vertex = Shader::from_spirv_bytes(
            device.clone(),
            desc.vertex_spirv,
            ShaderStage::Vertex,
            desc.entry_point,
        )?;
        let fragment = Shader::from_spirv_bytes(
            device.clone(),
            desc.fragment_spirv,
            ShaderStage::Fragment,
            desc.entry_point,
        )?;
        let stages = [vertex.stage_create_info(), fragment.stage_create_info()];

        let bindings = vertex_input_bindings();
        let attributes = vertex_input_attributes();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewports = [full_viewport(desc.extent)];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: desc.extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization = rasterization_state(desc.invert_culling);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(desc.samples)
            .min_sample_shading(1.0);
        let depth_stencil = depth_stencil_state();

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::LINE_WIDTH];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout)
            .render_pass(desc.render_pass)
            .subpass(desc.subpass);

        let pipelines = unsafe {
            device
                .handle()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, e)| {
            RhiError::PipelineError(format!(
                "failed to create pipeline for subpass {}: {:?}",
                desc.subpass, e
            ))
        })?;
        let pipeline = pipelines.into_iter().next().ok_or_else(|| {
            RhiError::PipelineError("driver returned no pipeline".to_string())
        })?;

        info!(
            "Created pipeline for subpass {} ({}x{}, {:?}, {} culling)",
            desc.subpass,
            desc.extent.width,
            desc.extent.height,
            desc.samples,
            if desc.invert_culling { "front" } else { "back" }
        );

        Ok(Self {
            device,
            pipeline,
            subpass: desc.subpass,
            _shaders: [vertex, fragment],
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn subpass(&self) -> u32 {
        self.subpass
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle before destroying pipeline: {}", e);
        }
        unsafe {
            self.device.handle().destroy_pipeline(self.pipeline, None);
        }
        debug!("Destroyed pipeline for subpass {}", self.subpass);
    }
}

/// Viewport covering `extent` with the full depth range.
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

pub fn rasterization_state(invert_culling: bool) -> vk::PipelineRasterizationStateCreateInfo<'static> {
    vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(if invert_culling {
            vk::CullModeFlags::FRONT
        } else {
            vk::CullModeFlags::BACK
        })
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(LINE_WIDTH)
}

pub fn depth_stencil_state() -> vk::PipelineDepthStencilStateCreateInfo<'static> {
    vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(DEPTH_COMPARE_OP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_culling_follows_inversion() {
        assert_eq!(rasterization_state(false).cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(rasterization_state(true).cull_mode, vk::CullModeFlags::FRONT);
        assert_eq!(
            rasterization_state(true).front_face,
            vk::FrontFace::COUNTER_CLOCKWISE
        );
        assert_eq!(rasterization_state(false).line_width, 1.0);
    }

    #[test]
    fn test_depth_state() {
        let state = depth_stencil_state();
        assert_eq!(state.depth_test_enable, vk::TRUE);
        assert_eq!(state.depth_write_enable, vk::TRUE);
        assert_eq!(state.depth_compare_op, vk::CompareOp::LESS_OR_EQUAL);
    }

    #[test]
    fn test_full_viewport() {
        let viewport = full_viewport(vk::Extent2D {
            width: 800,
            height: 600,
        });
        assert_eq!((viewport.width, viewport.height), (800.0, 600.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));
    }
}
