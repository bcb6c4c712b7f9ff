//! Demo scene: a row of spinning cubes drawn by both subpasses.

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
use tracing::{debug, error, info};

use renderer_core::Options;
use renderer_renderer::frame_graph::model_set_pool_sizes;
use renderer_renderer::{FrameGraph, FrameHandle, FrameRecorder, FrameScheduler, ModelUbo};
use renderer_rhi::RhiResult;
use renderer_rhi::buffer::{Buffer, BufferUsage};
use renderer_rhi::command::{CommandBuffer, CommandExecutor, CommandPool};
use renderer_rhi::descriptor::{DescriptorSetHandle, DynamicDescriptorPool};
use renderer_rhi::device::Device;
use renderer_rhi::image::Texture;
use renderer_rhi::staged::{StagedBufferTraits, StagedDeviceBuffer};
use renderer_rhi::sync::{Fence, MAX_CONCURRENT_FRAMES, WAIT_FOREVER};
use renderer_rhi::vertex::{INDEX_TYPE, Instance, Vertex};

/// Number of cubes in the row.
pub const CUBE_COUNT: usize = 5;

/// Line width of the outline subpass.
const OUTLINE_LINE_WIDTH: f32 = 1.0;

/// Spin rate in radians per second.
const SPIN_RATE: f32 = 0.8;

/// Instance uploads that may be in flight at once.
const UPLOAD_SLOTS: usize = MAX_CONCURRENT_FRAMES;

/// Unit cube with one quad per face, so every face keeps its own normal.
pub fn cube_mesh() -> (Vec<Vertex>, Vec<u32>) {
    const FACES: [(Vec3, Vec3, Vec3); 6] = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
    ];
    const CORNERS: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

    let mut vertices = Vec::with_capacity(FACES.len() * CORNERS.len());
    let mut indices = Vec::with_capacity(FACES.len() * 6);
    for (normal, right, up) in FACES {
        let base = vertices.len() as u32;
        for (u, v) in CORNERS {
            let position = (normal + right * u + up * v) * 0.5;
            let tex_coord = Vec2::new((u + 1.0) * 0.5, (1.0 - v) * 0.5);
            vertices.push(Vertex::new(position, normal, tex_coord));
        }
        indices.extend([0, 1, 2, 2, 3, 0].map(|i| base + i));
    }
    (vertices, indices)
}

/// Per-instance data of cube `index` at `time` seconds.
pub fn cube_instance(index: usize, time: f32) -> Instance {
    let offset = index as f32 - (CUBE_COUNT as f32 - 1.0) * 0.5;
    let angle = time * SPIN_RATE + index as f32;
    let transform = Mat4::from_scale_rotation_translation(
        Vec3::splat(0.6),
        Quat::from_euler(glam::EulerRot::YXZ, angle, angle * 0.5, 0.0),
        Vec3::new(offset * 1.2, 0.0, 0.0),
    );
    let hue = index as f32 / CUBE_COUNT as f32;
    let color = Vec4::new(1.0 - hue * 0.5, 0.6 + hue * 0.4, 0.4 + hue * 0.6, 1.0);
    Instance::new(transform, color, hue)
}

/// Moves every cube of `instances` to `time`.
fn write_instances(instances: &mut [Instance], time: f32) {
    for (index, instance) in instances.iter_mut().enumerate() {
        *instance = cube_instance(index, time);
    }
}

/// Instance data of one upload slot, with its own staging memory so the
/// host never writes what a pending copy reads.
struct InstanceUpload {
    instances: StagedDeviceBuffer<Instance>,
    cmd: vk::CommandBuffer,
    pool: CommandPool,
    done: Fence,
}

impl InstanceUpload {
    fn new(device: &Arc<Device>, executor: &mut CommandExecutor) -> RhiResult<Self> {
        let mut instances = StagedDeviceBuffer::new(device.clone(), StagedBufferTraits::INSTANCE);
        let wait_device = device.clone();
        instances.resize(CUBE_COUNT, move || wait_device.wait_idle())?;
        write_instances(instances.as_mut_slice(), 0.0);
        instances.flush_all(executor, device.graphics_queue())?;

        let pool = CommandPool::new(
            device.clone(),
            device.graphics_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let cmd = pool.allocate(vk::CommandBufferLevel::PRIMARY, 1)?[0];
        Ok(Self {
            instances,
            cmd,
            pool,
            done: Fence::new(device.clone(), true)?,
        })
    }
}

/// GPU resources of the demo scene.
pub struct Scene {
    // Declared in destruction order.
    model_set: DescriptorSetHandle,
    descriptor_pool: DynamicDescriptorPool,
    uploads: Vec<InstanceUpload>,
    upload_ring: FrameScheduler,
    drawn: usize,
    model_ubo: Buffer,
    color_map: Texture,
    normal_map: Texture,
    vertices: Buffer,
    indices: Buffer,
    index_count: u32,
    descriptors_stale: bool,
    device: Arc<Device>,
}

impl Scene {
    /// Uploads the cube mesh, its maps and the initial instances.
    pub fn new(device: Arc<Device>, frame_graph: &FrameGraph, options: &Options) -> Result<Self> {
        let queue = device.graphics_queue();
        let mut executor = CommandExecutor::new(device.clone(), device.graphics_family())
            .context("Failed to create scene command executor")?;

        let (mesh_vertices, mesh_indices) = cube_mesh();
        let vertices = Buffer::new_with_data(
            device.clone(),
            BufferUsage::Vertex,
            bytemuck::cast_slice(&mesh_vertices),
        )?;
        let indices = Buffer::new_with_data(
            device.clone(),
            BufferUsage::Index,
            bytemuck::cast_slice(&mesh_indices),
        )?;

        let world = &options.world;
        let color_map = Texture::solid(
            device.clone(),
            &mut executor,
            queue,
            [255, 255, 255, 255],
            !world.color_nearest_filter,
        )
        .context("Failed to create color map")?;
        let normal_map = Texture::solid(
            device.clone(),
            &mut executor,
            queue,
            [128, 128, 255, 255],
            !world.normal_nearest_filter,
        )
        .context("Failed to create normal map")?;

        let model = ModelUbo {
            ambient: 0.15,
            diffuse: 0.8,
            specular: 0.4,
            shininess: 16.0,
            rnd: 0.5,
            cel_levels: options.shader.cel_light_levels,
            ..ModelUbo::default()
        };
        let model_ubo =
            Buffer::new_with_data(device.clone(), BufferUsage::Uniform, bytemuck::bytes_of(&model))?;

        let uploads = (0..UPLOAD_SLOTS)
            .map(|_| InstanceUpload::new(&device, &mut executor))
            .collect::<RhiResult<Vec<_>>>()
            .context("Failed to upload instances")?;

        let mut descriptor_pool = DynamicDescriptorPool::new(
            device.clone(),
            frame_graph.model_set_layout(),
            &model_set_pool_sizes(),
            1,
        )?;
        let model_set = descriptor_pool.request()?;

        info!(
            "Scene loaded: {} cubes, {} vertices, {} indices",
            CUBE_COUNT,
            mesh_vertices.len(),
            mesh_indices.len()
        );

        Ok(Self {
            model_set,
            descriptor_pool,
            uploads,
            upload_ring: FrameScheduler::new(UPLOAD_SLOTS),
            drawn: 0,
            model_ubo,
            color_map,
            normal_map,
            vertices,
            indices,
            index_count: mesh_indices.len() as u32,
            descriptors_stale: true,
            device,
        })
    }

    /// Requests a rewrite of the model sets before the next frame.
    pub fn mark_descriptors_stale(&mut self) {
        self.descriptors_stale = true;
    }

    /// Moves the cubes to `time` and queues the upload of their instance
    /// data ahead of the next frame.
    ///
    /// Only waits for the upload that last used the same slot.
    pub fn update(&mut self, time: f32) -> RhiResult<()> {
        let slot = self.upload_ring.current_slot();
        let upload = &mut self.uploads[slot];
        upload.done.wait(WAIT_FOREVER)?;
        write_instances(upload.instances.as_mut_slice(), time);

        upload.pool.reset()?;
        let cmd = CommandBuffer::new(&self.device, upload.cmd);
        cmd.begin()?;
        upload.instances.record_flush(&cmd, 0, upload.instances.len())?;
        cmd.end()?;

        let cmds = [upload.cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&cmds);
        upload.done.reset()?;
        unsafe {
            self.device
                .submit(self.device.graphics_queue(), &[submit], upload.done.handle())?;
        }
        self.drawn = slot;
        self.upload_ring.advance();
        Ok(())
    }

    /// Recorder drawing the scene with the given pipelines.
    pub fn recorder(&mut self, main: vk::Pipeline, outline: vk::Pipeline) -> SceneRecorder<'_> {
        SceneRecorder {
            scene: self,
            pipelines: [main, outline],
        }
    }

    fn refresh_descriptors(&mut self, frame: &FrameHandle<'_>) {
        if !(self.descriptor_pool.take_out_of_date() || self.descriptors_stale) {
            return;
        }
        frame.update_model_descriptors(
            self.model_ubo.descriptor_info(),
            self.color_map.descriptor_info(),
            self.normal_map.descriptor_info(),
            self.descriptor_pool.get(self.model_set),
        );
        self.descriptors_stale = false;
        debug!("Model descriptor sets populated");
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        // In-flight frames and uploads still read the instance buffers.
        if let Err(e) = self.device.wait_idle() {
            error!("Failed to wait for device idle before destroying scene: {}", e);
        }
    }
}

/// Records the scene into both subpasses of a frame.
pub struct SceneRecorder<'a> {
    scene: &'a mut Scene,
    pipelines: [vk::Pipeline; 2],
}

impl FrameRecorder for SceneRecorder<'_> {
    fn pre_render(&mut self, frame: &FrameHandle<'_>) -> RhiResult<()> {
        self.scene.refresh_descriptors(frame);
        Ok(())
    }

    fn record_subpass(
        &mut self,
        frame: &FrameHandle<'_>,
        subpass: u32,
        cmd: &CommandBuffer<'_>,
    ) -> RhiResult<()> {
        let Some(&pipeline) = self.pipelines.get(subpass as usize) else {
            return Ok(());
        };
        let scene = &*self.scene;
        let instances = &scene.uploads[scene.drawn].instances;
        cmd.bind_pipeline(pipeline);
        cmd.set_line_width(OUTLINE_LINE_WIDTH);
        frame.bind_model_descriptor_set(cmd, scene.descriptor_pool.get(scene.model_set));
        cmd.bind_vertex_buffers(
            Vertex::BINDING,
            &[scene.vertices.handle(), instances.device_buffer()],
        );
        cmd.bind_index_buffer(scene.indices.handle(), INDEX_TYPE);
        cmd.draw_indexed(scene.index_count, instances.len() as u32, 0, 0, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_mesh_counts() {
        let (vertices, indices) = cube_mesh();
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
    }

    #[test]
    fn test_cube_faces_point_outward() {
        let (vertices, _) = cube_mesh();
        for vertex in &vertices {
            assert!(vertex.position.dot(vertex.normal) > 0.0);
            assert!((vertex.position.abs().max_element() - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_cube_winding_is_counter_clockwise() {
        let (vertices, indices) = cube_mesh();
        for triangle in indices.chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|i| vertices[triangle[i] as usize]);
            let face = (b.position - a.position).cross(c.position - a.position);
            assert!(face.dot(a.normal) > 0.0);
        }
    }

    #[test]
    fn test_write_instances_follows_time() {
        let mut instances = [cube_instance(0, 0.0); CUBE_COUNT];
        write_instances(&mut instances, 2.5);
        for (index, instance) in instances.iter().enumerate() {
            assert_eq!(*instance, cube_instance(index, 2.5));
        }
    }

    #[test]
    fn test_upload_slot_reused_only_after_full_round() {
        let mut ring = FrameScheduler::new(UPLOAD_SLOTS);
        let mut last_use = vec![None; UPLOAD_SLOTS];
        for update in 0..10usize {
            let slot = ring.current_slot();
            if let Some(previous) = last_use[slot] {
                assert_eq!(update - previous, UPLOAD_SLOTS);
            }
            last_use[slot] = Some(update);
            ring.advance();
        }
        assert!(UPLOAD_SLOTS > 1, "the drawn slot would be rewritten next");
    }

    #[test]
    fn test_cube_instances_are_spread() {
        let first = cube_instance(0, 0.0);
        let last = cube_instance(CUBE_COUNT - 1, 0.0);
        let x = |instance: &Instance| instance.model_transform.w_axis.x;
        assert!(x(&first) < 0.0);
        assert!(x(&last) > 0.0);
        assert!((x(&first) + x(&last)).abs() < 1e-5);
    }
}
