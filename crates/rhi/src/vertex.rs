//! Vertex data structures and input descriptions.
//!
//! # Vertex Types
//!
//! - [`Vertex`] - Per-vertex attributes read from binding 0
//! - [`Instance`] - Per-instance attributes read from binding 1
//!
//! Both pipelines of the frame graph consume the same two bindings, so
//! [`vertex_input_bindings`] and [`vertex_input_attributes`] describe them
//! together.

use std::mem::offset_of;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

/// Index type of every index buffer.
pub const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;

/// Mesh vertex.
///
/// # Memory Layout
///
/// - Offset 0: position (12 bytes)
/// - Offset 12: normal (12 bytes)
/// - Offset 24: smooth_normal (12 bytes)
/// - Offset 36: tangent (12 bytes)
/// - Offset 48: bitangent (12 bytes)
/// - Offset 60: tex_coord (8 bytes)
/// - Total size: 68 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    /// Face normal.
    pub normal: Vec3,
    /// Normal averaged over adjacent faces, used to extrude outlines.
    pub smooth_normal: Vec3,
    pub tangent: Vec3,
    pub bitangent: Vec3,
    pub tex_coord: Vec2,
}

impl Vertex {
    /// Binding of per-vertex data.
    pub const BINDING: u32 = 0;

    /// Creates a vertex whose smoothed normal equals its face normal.
    pub fn new(position: Vec3, normal: Vec3, tex_coord: Vec2) -> Self {
        let (tangent, bitangent) = normal.any_orthonormal_pair();
        Self {
            position,
            normal,
            smooth_normal: normal,
            tangent,
            bitangent,
            tex_coord,
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: Self::BINDING,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Locations 0 to 5.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 6] {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            binding: Self::BINDING,
            location,
            format,
            offset: offset as u32,
        };
        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, smooth_normal)),
            attribute(3, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, tangent)),
            attribute(4, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, bitangent)),
            attribute(5, vk::Format::R32G32_SFLOAT, offset_of!(Self, tex_coord)),
        ]
    }
}

/// Per-instance data.
///
/// # Memory Layout
///
/// - Offset 0: model transform, four columns (64 bytes)
/// - Offset 64: color multiplier (16 bytes)
/// - Offset 80: random value (4 bytes)
/// - Total size: 96 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Instance {
    pub model_transform: Mat4,
    pub color_mul: Vec4,
    /// Per-instance noise seed.
    pub rnd: f32,
    pub _pad: [f32; 3],
}

impl Default for Instance {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Vec4::ONE, 0.0)
    }
}

impl Instance {
    /// Binding of per-instance data.
    pub const BINDING: u32 = 1;

    pub fn new(model_transform: Mat4, color_mul: Vec4, rnd: f32) -> Self {
        Self {
            model_transform,
            color_mul,
            rnd,
            _pad: [0.0; 3],
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: Self::BINDING,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::INSTANCE,
        }
    }

    /// Locations 6 to 11: the transform columns, the color multiplier and
    /// the random value.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 6] {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            binding: Self::BINDING,
            location,
            format,
            offset: offset as u32,
        };
        let column = size_of::<Vec4>();
        let transform = offset_of!(Self, model_transform);
        [
            attribute(6, vk::Format::R32G32B32A32_SFLOAT, transform),
            attribute(7, vk::Format::R32G32B32A32_SFLOAT, transform + column),
            attribute(8, vk::Format::R32G32B32A32_SFLOAT, transform + 2 * column),
            attribute(9, vk::Format::R32G32B32A32_SFLOAT, transform + 3 * column),
            attribute(10, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, color_mul)),
            attribute(11, vk::Format::R32_SFLOAT, offset_of!(Self, rnd)),
        ]
    }
}

/// Both input bindings, vertex first.
pub fn vertex_input_bindings() -> [vk::VertexInputBindingDescription; 2] {
    [Vertex::binding_description(), Instance::binding_description()]
}

/// Attributes of both bindings, ordered by location.
pub fn vertex_input_attributes() -> [vk::VertexInputAttributeDescription; 12] {
    let mut attributes = [vk::VertexInputAttributeDescription::default(); 12];
    let (vertex, instance) = attributes.split_at_mut(6);
    vertex.copy_from_slice(&Vertex::attribute_descriptions());
    instance.copy_from_slice(&Instance::attribute_descriptions());
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_size() {
        assert_eq!(size_of::<Vertex>(), 68);
    }

    #[test]
    fn test_vertex_offsets() {
        let offsets: Vec<u32> = Vertex::attribute_descriptions()
            .iter()
            .map(|a| a.offset)
            .collect();
        assert_eq!(offsets, vec![0, 12, 24, 36, 48, 60]);
    }

    #[test]
    fn test_instance_layout() {
        assert_eq!(size_of::<Instance>(), 96);
        let attributes = Instance::attribute_descriptions();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 16, 32, 48, 64, 80]);
        assert_eq!(attributes[5].format, vk::Format::R32_SFLOAT);
    }

    #[test]
    fn test_binding_descriptions() {
        let [vertex, instance] = vertex_input_bindings();
        assert_eq!(vertex.binding, 0);
        assert_eq!(vertex.stride, 68);
        assert_eq!(vertex.input_rate, vk::VertexInputRate::VERTEX);
        assert_eq!(instance.binding, 1);
        assert_eq!(instance.stride, 96);
        assert_eq!(instance.input_rate, vk::VertexInputRate::INSTANCE);
    }

    #[test]
    fn test_attribute_locations_are_contiguous() {
        let attributes = vertex_input_attributes();
        for (i, attribute) in attributes.iter().enumerate() {
            assert_eq!(attribute.location, i as u32);
        }
        assert!(attributes[..6].iter().all(|a| a.binding == 0));
        assert!(attributes[6..].iter().all(|a| a.binding == 1));
    }

    #[test]
    fn test_vertex_new_builds_tangent_frame() {
        let vertex = Vertex::new(Vec3::ZERO, Vec3::Z, Vec2::ZERO);
        assert_eq!(vertex.smooth_normal, Vec3::Z);
        assert!(vertex.tangent.dot(Vec3::Z).abs() < 1e-6);
        assert!(vertex.bitangent.dot(vertex.tangent).abs() < 1e-6);
    }

    #[test]
    fn test_instance_pod() {
        let instance = Instance::default();
        let bytes = bytemuck::bytes_of(&instance);
        assert_eq!(bytes.len(), 96);
        assert_eq!(instance.model_transform, Mat4::IDENTITY);
    }
}
