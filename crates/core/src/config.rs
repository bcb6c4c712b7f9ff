//! Runtime options.
//!
//! Options are read from an optional TOML file and grouped in sections
//! mirroring what consumes them. Every field has a default, so an empty or
//! missing file is valid.
//!
//! ```toml
//! [shader]
//! shader_path = "assets/shaders"
//! z_far = 500.0
//!
//! [view]
//! use_multisampling = true
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Environment variable naming the TOML options file.
pub const CONFIG_PATH_ENV: &str = "VKFRAME_CONFIG";

/// Environment variable overriding [`ShaderOptions::shader_path`].
pub const SHADER_PATH_ENV: &str = "VKFRAME_SHADER_PATH";

/// All runtime options.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct Options {
    pub shader: ShaderOptions,
    pub world: WorldOptions,
    pub window: WindowOptions,
    pub view: ViewOptions,
}

/// Shader-facing parameters, most of which end up in the static UBO.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ShaderOptions {
    /// Directory containing the compiled SPIR-V modules.
    pub shader_path: PathBuf,
    pub z_near: f32,
    pub z_far: f32,
    /// Outline thickness in world units.
    pub outline_size: f32,
    /// Outline depth offset, scaled by `z_near`.
    pub outline_depth: f32,
    pub cel_light_levels: u32,
}

/// Scene-wide parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorldOptions {
    pub clear_color: [f32; 4],
    pub light_direction: [f32; 3],
    /// Use nearest filtering for color textures.
    pub color_nearest_filter: bool,
    /// Use nearest filtering for normal maps.
    pub normal_nearest_filter: bool,
}

/// Window parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WindowOptions {
    /// Initial inner size of the window.
    pub extent: [u32; 2],
    /// Vertical resolution cap of the offscreen render target.
    pub max_vertical_resolution: u32,
    pub title: String,
}

/// Camera and presentation parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ViewOptions {
    pub initial_position: [f32; 3],
    /// Vertical field of view, in degrees.
    pub fov: f32,
    /// Target frames per second; zero disables pacing.
    pub frame_frequency: f32,
    /// Upscale the render target with nearest filtering instead of linear.
    pub upscale_nearest_filter: bool,
    pub use_multisampling: bool,
    /// Let the swapchain rebuild reuse the previous chain handle.
    pub reuse_cached_swapchain: bool,
}

impl Default for ShaderOptions {
    fn default() -> Self {
        Self {
            shader_path: PathBuf::from("shaders"),
            z_near: 0.05,
            z_far: 200.0,
            outline_size: 1.0 / 30.0,
            outline_depth: 1.0 / 20.0,
            cel_light_levels: 6,
        }
    }
}

impl Default for WorldOptions {
    fn default() -> Self {
        Self {
            clear_color: [0.2, 0.2, 0.7, 1.0],
            light_direction: [1.0, -1.0, 1.0],
            color_nearest_filter: false,
            normal_nearest_filter: false,
        }
    }
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            extent: [1200, 900],
            max_vertical_resolution: u32::from(u16::MAX),
            title: "vkframe".to_string(),
        }
    }
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            initial_position: [0.0, 0.0, -3.0],
            fov: 100.0,
            frame_frequency: 61.0,
            upscale_nearest_filter: true,
            use_multisampling: false,
            reuse_cached_swapchain: false,
        }
    }
}

impl Options {
    /// Parse options from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let options: Self = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from `path`, or defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Options file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let source = std::fs::read_to_string(path)?;
        let options = Self::from_toml_str(&source)?;
        info!("Loaded options from {:?}", path);
        Ok(options)
    }

    /// Load options as directed by the process environment.
    ///
    /// Reads the file named by [`CONFIG_PATH_ENV`] (if set), then applies
    /// [`SHADER_PATH_ENV`] on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the options file is unreadable or invalid.
    pub fn from_env() -> Result<Self> {
        let mut options = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };
        options.apply_shader_path_override(std::env::var_os(SHADER_PATH_ENV).map(PathBuf::from));
        Ok(options)
    }

    /// Replace the shader path if an override is given.
    pub fn apply_shader_path_override(&mut self, shader_path: Option<PathBuf>) {
        if let Some(path) = shader_path {
            debug!("Shader path overridden to {:?}", path);
            self.shader.shader_path = path;
        }
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if !(self.shader.z_near > 0.0 && self.shader.z_near < self.shader.z_far) {
            return Err(Error::Config(format!(
                "expected 0 < z_near < z_far, got z_near={} z_far={}",
                self.shader.z_near, self.shader.z_far
            )));
        }
        if self.window.extent.contains(&0) {
            return Err(Error::Config(format!(
                "window extent must be non-zero, got {:?}",
                self.window.extent
            )));
        }
        if self.window.max_vertical_resolution == 0 {
            return Err(Error::Config(
                "max_vertical_resolution must be non-zero".to_string(),
            ));
        }
        if !(self.view.fov > 0.0 && self.view.fov < 180.0) {
            return Err(Error::Config(format!(
                "fov must lie in (0, 180) degrees, got {}",
                self.view.fov
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.shader.shader_path, PathBuf::from("shaders"));
        assert_eq!(options.window.extent, [1200, 900]);
        assert_eq!(options.world.clear_color, [0.2, 0.2, 0.7, 1.0]);
        assert!(options.view.upscale_nearest_filter);
        assert!(!options.view.use_multisampling);
        assert!(!options.view.reuse_cached_swapchain);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_empty_document_is_default() {
        let options = Options::from_toml_str("").unwrap();
        assert_eq!(options, Options::default());
    }

    #[test]
    fn test_partial_section() {
        let options = Options::from_toml_str(
            r#"
            [view]
            use_multisampling = true
            fov = 75.0
            "#,
        )
        .unwrap();
        assert!(options.view.use_multisampling);
        assert_eq!(options.view.fov, 75.0);
        // Untouched fields keep their defaults
        assert_eq!(options.view.frame_frequency, 61.0);
        assert_eq!(options.shader, ShaderOptions::default());
    }

    #[test]
    fn test_malformed_document() {
        let result = Options::from_toml_str("[view\nfov = ");
        assert!(matches!(result, Err(Error::ConfigParse(_))));
    }

    #[test]
    fn test_invalid_depth_range() {
        let result = Options::from_toml_str(
            r#"
            [shader]
            z_near = 10.0
            z_far = 1.0
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_extent_rejected() {
        let mut options = Options::default();
        options.window.extent = [0, 600];
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_shader_path_override() {
        let mut options = Options::default();
        options.apply_shader_path_override(None);
        assert_eq!(options.shader.shader_path, PathBuf::from("shaders"));

        options.apply_shader_path_override(Some(PathBuf::from("/tmp/spv")));
        assert_eq!(options.shader.shader_path, PathBuf::from("/tmp/spv"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let options = Options::load(Path::new("/definitely/not/here/vkframe.toml")).unwrap();
        assert_eq!(options, Options::default());
    }
}
