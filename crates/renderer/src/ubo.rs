//! Uniform buffer object definitions for shaders.
//!
//! These structures must match the GLSL `std140` uniform blocks exactly.
//! All structures use `#[repr(C)]` with explicit padding so that every byte
//! is accounted for, and implement `Pod` and `Zeroable` for byte casting.
//!
//! | struct | set | binding | update rate |
//! |--------|-----|---------|-------------|
//! | [`StaticUbo`] | 0 | 0 | on projection change, copied lazily per image |
//! | [`ModelUbo`] | 1 | 0 | once per model load |
//! | [`FrameUbo`] | 2 | 0 | every frame, written straight to mapped memory |

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Descriptor set index of the static UBO.
pub const STATIC_SET: u32 = 0;
/// Descriptor set index of the model UBO and textures.
pub const MODEL_SET: u32 = 1;
/// Descriptor set index of the frame UBO.
pub const FRAME_SET: u32 = 2;

/// Binding of the uniform buffer within each set.
pub const UBO_BINDING: u32 = 0;
/// Binding of the color map in the model set.
pub const COLOR_MAP_BINDING: u32 = 1;
/// Binding of the normal map in the model set.
pub const NORMAL_MAP_BINDING: u32 = 2;

/// Rarely changing uniform data.
///
/// # Memory Layout
///
/// - Offset 0: projection matrix (64 bytes)
/// - Offset 64: outline size (4 bytes)
/// - Offset 68: outline depth (4 bytes)
/// - Offset 72: outline randomness (4 bytes)
/// - Offset 76: padding (4 bytes)
/// - Total size: 80 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct StaticUbo {
    pub projection: Mat4,
    /// Outline thickness in world units.
    pub outline_size: f32,
    /// Depth bias of outlines, scaled with the near plane.
    pub outline_depth: f32,
    /// Random displacement of outline vertices.
    pub outline_rnd: f32,
    pub _padding: f32,
}

impl StaticUbo {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(projection: Mat4, outline_size: f32, outline_depth: f32, outline_rnd: f32) -> Self {
        Self {
            projection,
            outline_size,
            outline_depth,
            outline_rnd,
            _padding: 0.0,
        }
    }
}

/// Per-model material parameters.
///
/// # Memory Layout
///
/// - Offset 0: ambient, diffuse, specular, shininess (16 bytes)
/// - Offset 16: random value (4 bytes)
/// - Offset 20: cel shading levels (4 bytes)
/// - Offset 24: padding (8 bytes)
/// - Total size: 32 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ModelUbo {
    pub ambient: f32,
    pub diffuse: f32,
    pub specular: f32,
    pub shininess: f32,
    /// Different for every model.
    pub rnd: f32,
    pub cel_levels: u32,
    pub _padding: [u32; 2],
}

impl ModelUbo {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Per-frame uniform data.
///
/// # Memory Layout
///
/// - Offset 0: view matrix (64 bytes)
/// - Offset 64: view position (12 bytes) + padding (4 bytes)
/// - Offset 80: point light, position and intensity (16 bytes)
/// - Offset 96: light direction (12 bytes)
/// - Offset 108: random value (4 bytes)
/// - Offset 112: shader selector (4 bytes)
/// - Offset 116: padding (12 bytes)
/// - Total size: 128 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FrameUbo {
    pub view: Mat4,
    /// Camera position, consistent with `view` for specular lighting.
    pub view_position: Vec3,
    pub _padding0: f32,
    /// Position in `xyz`, intensity in `w`.
    pub point_light: Vec4,
    pub light_direction: Vec3,
    /// Different for every frame.
    pub rnd: f32,
    /// Debug switch read by the fragment shader.
    pub shader_selector: u32,
    pub _padding1: [u32; 3],
}

impl FrameUbo {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(view: Mat4, view_position: Vec3, light_direction: Vec3) -> Self {
        Self {
            view,
            view_position,
            light_direction,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use super::*;

    #[test]
    fn test_static_ubo_layout() {
        assert_eq!(StaticUbo::SIZE, 80);
        assert_eq!(offset_of!(StaticUbo, outline_size), 64);
        assert_eq!(offset_of!(StaticUbo, outline_rnd), 72);
    }

    #[test]
    fn test_model_ubo_layout() {
        assert_eq!(ModelUbo::SIZE, 32);
        assert_eq!(offset_of!(ModelUbo, rnd), 16);
        assert_eq!(offset_of!(ModelUbo, cel_levels), 20);
    }

    #[test]
    fn test_frame_ubo_layout() {
        assert_eq!(FrameUbo::SIZE, 128);
        assert_eq!(offset_of!(FrameUbo, view_position), 64);
        assert_eq!(offset_of!(FrameUbo, point_light), 80);
        assert_eq!(offset_of!(FrameUbo, light_direction), 96);
        assert_eq!(offset_of!(FrameUbo, rnd), 108);
        assert_eq!(offset_of!(FrameUbo, shader_selector), 112);
    }

    #[test]
    fn test_frame_ubo_new() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, -3.0), Vec3::ZERO, Vec3::Y);
        let ubo = FrameUbo::new(view, Vec3::new(0.0, 0.0, -3.0), Vec3::new(1.0, -1.0, 1.0));
        assert_eq!(ubo.view, view);
        assert_eq!(ubo.point_light, Vec4::ZERO);
        assert_eq!(ubo.shader_selector, 0);
        assert_eq!(bytemuck::bytes_of(&ubo).len(), FrameUbo::SIZE);
    }

    #[test]
    fn test_set_indices_are_ordered() {
        assert!(STATIC_SET < MODEL_SET && MODEL_SET < FRAME_SET);
    }
}
