//! vkframe - Main Entry Point
//!
//! Opens a window, builds a frame graph on its surface and renders a small
//! scene of outlined cubes until the window is closed.

mod render;
mod scene;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use renderer_core::{FrameLimiter, Options};
use renderer_platform::{Surface, Window, required_extensions};
use renderer_renderer::{FrameGraph, FrameGraphDesc, FrameUbo, SurfaceObserver, fit_extent_height};
use renderer_rhi::device::Device;
use renderer_rhi::instance::{Instance, InstanceDesc};
use renderer_rhi::physical_device::select_physical_device;
use renderer_rhi::swapchain::PresentableSurface;
use renderer_rhi::sync::MAX_CONCURRENT_FRAMES;

use render::{Pipelines, ShaderSet, SurfaceRebuilder, static_ubo};
use scene::Scene;

/// Everything that lives as long as the window.
struct RenderState {
    // Declared in destruction order.
    scene: Scene,
    pipelines: Option<Pipelines>,
    frame_graph: FrameGraph,
    surface: PresentableSurface,
    device: Arc<Device>,
    window_surface: Surface,
    instance: Instance,
    window: Window,
    shaders: ShaderSet,
    limiter: FrameLimiter,
    start: Instant,
    resized: bool,
}

impl RenderState {
    fn new(event_loop: &ActiveEventLoop, options: &Options) -> Result<Self> {
        let shaders = ShaderSet::load(&options.shader.shader_path)?;
        let window = Window::new(event_loop, &options.window)?;

        let extensions = required_extensions(event_loop)?;
        let instance = Instance::new(&InstanceDesc {
            application_name: c"vkframe",
            enable_validation: cfg!(debug_assertions),
            extensions: &extensions,
        })
        .context("Failed to create Vulkan instance")?;
        let window_surface = window.create_surface(instance.entry(), instance.handle())?;

        let gpu = select_physical_device(
            instance.handle(),
            window_surface.handle(),
            window_surface.loader(),
        )?;
        let samples = gpu.best_sample_count(options.view.use_multisampling);
        let device = Device::new(&instance, gpu).context("Failed to create logical device")?;

        let surface = PresentableSurface::create(
            &instance,
            device.clone(),
            window_surface.handle(),
            window.extent(),
            MAX_CONCURRENT_FRAMES as u32,
            None,
        )
        .context("Failed to create presentable surface")?;

        let render_extent =
            fit_extent_height(options.window.max_vertical_resolution, surface.extent());
        let mut frame_graph = FrameGraph::new(
            device.clone(),
            &surface,
            FrameGraphDesc::from_options(options, render_extent, samples),
        )
        .context("Failed to create frame graph")?;
        let pipelines = Pipelines::build(&frame_graph, &shaders)?;
        frame_graph.set_static_ubo(&static_ubo(options, surface.extent()))?;

        let scene = Scene::new(device.clone(), &frame_graph, options)?;

        info!("Initialization complete, entering main loop");
        Ok(Self {
            scene,
            pipelines: Some(pipelines),
            frame_graph,
            surface,
            device,
            window_surface,
            instance,
            window,
            shaders,
            limiter: FrameLimiter::new(options.view.frame_frequency),
            start: Instant::now(),
            resized: false,
        })
    }

    fn render_frame(&mut self, options: &Options) -> Result<()> {
        if self.window.is_minimized() {
            return Ok(());
        }
        let time = self.start.elapsed().as_secs_f32();

        let mut rebuilder = SurfaceRebuilder {
            instance: &self.instance,
            surface: self.window_surface.handle(),
            window_extent: self.window.extent(),
            options,
            shaders: &self.shaders,
            pipelines: &mut self.pipelines,
            rebuilt: false,
        };
        if std::mem::take(&mut self.resized) {
            rebuilder.on_surface_invalidated(&mut self.surface, &mut self.frame_graph)?;
        }

        self.scene.update(time)?;

        let (main, outline) = rebuilder
            .pipelines
            .as_ref()
            .map(Pipelines::handles)
            .context("Pipelines missing after a failed rebuild")?;
        let frame_ubo = frame_ubo(options, time);
        let mut recorder = self.scene.recorder(main, outline);
        self.frame_graph.run_render_pass(
            &mut self.surface,
            &mut rebuilder,
            &frame_ubo,
            &mut recorder,
        )?;

        if rebuilder.rebuilt {
            self.scene.mark_descriptors_stale();
        }
        self.limiter.wait();
        Ok(())
    }
}

/// Per-frame uniforms for a camera slowly orbiting the origin.
fn frame_ubo(options: &Options, time: f32) -> FrameUbo {
    let initial = Vec3::from_array(options.view.initial_position);
    let eye = Mat4::from_rotation_y(time * 0.1).transform_point3(initial);
    let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
    let light_direction = Vec3::from_array(options.world.light_direction).normalize_or_zero();
    let mut ubo = FrameUbo::new(view, eye, light_direction);
    ubo.rnd = time.fract();
    ubo
}

struct App {
    options: Options,
    state: Option<RenderState>,
    error: Option<anyhow::Error>,
}

impl App {
    fn new(options: Options) -> Self {
        Self {
            options,
            state: None,
            error: None,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        error!("{:#}", error);
        self.error = Some(error);
        // Release GPU state before the event loop winds down.
        self.state = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match RenderState::new(event_loop, &self.options) {
            Ok(state) => self.state = Some(state),
            Err(e) => self.fail(event_loop, e.context("Failed to initialize renderer")),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                self.state = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                info!("Window resized to {}x{}", size.width, size.height);
                if let Some(state) = &mut self.state {
                    state.resized = true;
                }
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.render_frame(&self.options) {
                    self.fail(event_loop, e.context("Render error"));
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    renderer_core::init_logging();
    info!("Starting vkframe");

    let options = Options::from_env().context("Failed to load options")?;

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(options);
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_ubo_starts_at_initial_position() {
        let options = Options::default();
        let ubo = frame_ubo(&options, 0.0);
        let initial = Vec3::from_array(options.view.initial_position);
        assert!(ubo.view_position.abs_diff_eq(initial, 1e-6));
        // The origin sits straight ahead of the camera.
        let origin = ubo.view.transform_point3(Vec3::ZERO);
        assert!(origin.x.abs() < 1e-5 && origin.y.abs() < 1e-5 && origin.z < 0.0);
    }

    #[test]
    fn test_frame_ubo_light_is_normalized() {
        let options = Options::default();
        let ubo = frame_ubo(&options, 1.0);
        assert!((ubo.light_direction.length() - 1.0).abs() < 1e-5);
    }
}
