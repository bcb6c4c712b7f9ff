//! Pipelines, static uniforms and surface rebuilding.

use std::path::Path;

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use tracing::info;

use renderer_core::Options;
use renderer_renderer::{
    FrameGraph, ShaderSources, StaticUbo, SurfaceObserver, fit_extent_height,
};
use renderer_rhi::RhiResult;
use renderer_rhi::instance::Instance;
use renderer_rhi::pipeline::Pipeline;
use renderer_rhi::swapchain::PresentableSurface;
use renderer_rhi::sync::MAX_CONCURRENT_FRAMES;

const ENTRY_POINT: &str = "main";

/// Subpass drawing the shaded models.
pub const MAIN_SUBPASS: u32 = 0;

/// Subpass drawing the outlines over them.
pub const OUTLINE_SUBPASS: u32 = 1;

/// SPIR-V of both pipelines, read once at startup.
pub struct ShaderSet {
    main_vertex: Vec<u8>,
    main_fragment: Vec<u8>,
    outline_vertex: Vec<u8>,
    outline_fragment: Vec<u8>,
}

impl ShaderSet {
    /// Reads the four modules from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read(&path)
                .with_context(|| format!("Failed to read shader {}", path.display()))
        };
        info!("Reading shaders from {}", dir.display());
        Ok(Self {
            main_vertex: read("vertex.main.spv")?,
            main_fragment: read("fragment.main.spv")?,
            outline_vertex: read("vertex.outline.spv")?,
            outline_fragment: read("fragment.outline.spv")?,
        })
    }

    fn main(&self) -> ShaderSources<'_> {
        ShaderSources {
            vertex: &self.main_vertex,
            fragment: &self.main_fragment,
            entry_point: ENTRY_POINT,
        }
    }

    fn outline(&self) -> ShaderSources<'_> {
        ShaderSources {
            vertex: &self.outline_vertex,
            fragment: &self.outline_fragment,
            entry_point: ENTRY_POINT,
        }
    }
}

/// The two pipelines of the frame graph's render pass.
pub struct Pipelines {
    main: Pipeline,
    outline: Pipeline,
}

impl Pipelines {
    /// Builds both pipelines against the current assignment of `frame_graph`.
    pub fn build(frame_graph: &FrameGraph, shaders: &ShaderSet) -> RhiResult<Self> {
        let extent = frame_graph.render_extent();
        let samples = frame_graph.samples();
        let main = frame_graph.build_pipeline(&shaders.main(), MAIN_SUBPASS, false, extent, samples)?;
        let outline =
            frame_graph.build_pipeline(&shaders.outline(), OUTLINE_SUBPASS, true, extent, samples)?;
        Ok(Self { main, outline })
    }

    pub fn handles(&self) -> (vk::Pipeline, vk::Pipeline) {
        (self.main.handle(), self.outline.handle())
    }
}

/// Projection with the y axis pointing down, as Vulkan clip space expects.
pub fn projection(options: &Options, extent: vk::Extent2D) -> Mat4 {
    let aspect = extent.width as f32 / extent.height.max(1) as f32;
    let mut projection = Mat4::perspective_rh(
        options.view.fov.to_radians(),
        aspect,
        options.shader.z_near,
        options.shader.z_far,
    );
    projection.y_axis.y = -projection.y_axis.y;
    projection
}

/// Static uniforms for a surface of `extent`.
pub fn static_ubo(options: &Options, extent: vk::Extent2D) -> StaticUbo {
    let shader = &options.shader;
    StaticUbo::new(
        projection(options, extent),
        shader.outline_size,
        shader.z_near * shader.outline_depth,
        0.0,
    )
}

/// Rebuilds the surface and everything tied to the frame graph's
/// assignment when the surface goes stale.
pub struct SurfaceRebuilder<'a> {
    pub instance: &'a Instance,
    pub surface: vk::SurfaceKHR,
    pub window_extent: vk::Extent2D,
    pub options: &'a Options,
    pub shaders: &'a ShaderSet,
    pub pipelines: &'a mut Option<Pipelines>,
    /// Set once the model descriptor sets need repopulating.
    pub rebuilt: bool,
}

impl SurfaceObserver for SurfaceRebuilder<'_> {
    fn on_surface_invalidated(
        &mut self,
        surface: &mut PresentableSurface,
        frame_graph: &mut FrameGraph,
    ) -> RhiResult<()> {
        *self.pipelines = None;
        surface.rebuild(
            self.instance,
            self.surface,
            self.window_extent,
            MAX_CONCURRENT_FRAMES as u32,
            self.options.view.reuse_cached_swapchain,
        )?;
        let render_extent = fit_extent_height(
            self.options.window.max_vertical_resolution,
            surface.extent(),
        );
        frame_graph.reassign(surface, Some(render_extent))?;
        *self.pipelines = Some(Pipelines::build(frame_graph, self.shaders)?);
        frame_graph.set_static_ubo(&static_ubo(self.options, surface.extent()))?;
        self.rebuilt = true;
        info!(
            "Surface rebuilt at {}x{}",
            surface.extent().width,
            surface.extent().height
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_projection_flips_y() {
        let options = Options::default();
        let clip = projection(&options, extent(800, 800)) * Vec4::new(0.0, 1.0, -1.0, 1.0);
        assert!(clip.y < 0.0);
    }

    #[test]
    fn test_projection_depth_range() {
        let options = Options::default();
        let projection = projection(&options, extent(1200, 900));
        let near = projection * Vec4::new(0.0, 0.0, -options.shader.z_near, 1.0);
        let far = projection * Vec4::new(0.0, 0.0, -options.shader.z_far, 1.0);
        assert!((near.z / near.w).abs() < 1e-5);
        assert!((far.z / far.w - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_static_ubo_scales_outline_depth() {
        let options = Options::default();
        let ubo = static_ubo(&options, extent(1200, 900));
        assert_eq!(ubo.outline_size, options.shader.outline_size);
        assert!((ubo.outline_depth - options.shader.z_near * options.shader.outline_depth).abs() < 1e-9);
    }

    #[test]
    fn test_projection_degenerate_extent() {
        let options = Options::default();
        let projection = projection(&options, extent(100, 0));
        assert!(projection.is_finite());
    }
}
