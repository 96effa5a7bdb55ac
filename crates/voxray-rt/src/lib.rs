//! Hardware ray tracing for the Voxray renderer.
//!
//! This crate provides:
//! - The voxel acceleration structure manager (one procedural BLAS, full TLAS rebuilds)
//! - Shader binding table layout and upload
//! - The ray tracing pipeline and its camera uniforms
//!
//! # Example
//!
//! ```ignore
//! use glam::{Quat, Vec3};
//! use voxray_rt::AccelerationStructureManager;
//!
//! let mut accel = AccelerationStructureManager::new();
//! accel.add_voxel(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE);
//! if accel.is_rebuild_needed() {
//!     accel.rebuild(&gpu)?;
//! }
//! ```

pub mod acceleration;
pub mod camera;
pub mod pipeline;
pub mod sbt;

pub use acceleration::{
    AabbPositions, AccelerationStructureManager, InstanceStaging, VoxelInstance, VoxelScene,
};
pub use camera::{Camera, CameraUniforms};
pub use pipeline::{RayTracePipeline, ShaderSet};
pub use sbt::{SbtLayout, SbtRegion, SbtRegions, ShaderBindingTable};
