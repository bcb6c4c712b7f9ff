//! Frame rendering on top of the RHI.
//!
//! This crate orchestrates the rendering process:
//! - [`FrameGraph`]: per-image resources and the acquire, record, submit,
//!   blit and present loop
//! - Frame slot scheduling and lazy static UBO propagation
//! - Uniform buffer layouts shared with the shaders

pub mod frame;
pub mod frame_graph;
pub mod ubo;

pub use frame::{FrameScheduler, FrameStep, StaticUboTracker, fit_extent_height};
pub use frame_graph::{
    FrameGraph, FrameGraphDesc, FrameHandle, FrameRecorder, ShaderSources, SurfaceObserver,
};
pub use ubo::{FrameUbo, ModelUbo, StaticUbo};
