//! Core utilities shared by every vkframe crate.
//!
//! This crate provides foundational types used across the renderer:
//! - Error types and result aliases
//! - Logging initialization
//! - Runtime options loaded from TOML
//! - Frame pacing

mod config;
mod error;
mod logging;
mod timer;

pub use config::{
    CONFIG_PATH_ENV, Options, SHADER_PATH_ENV, ShaderOptions, ViewOptions, WindowOptions,
    WorldOptions,
};
pub use error::{Error, Result};
pub use logging::{default_filter, init_logging};
pub use timer::FrameLimiter;
