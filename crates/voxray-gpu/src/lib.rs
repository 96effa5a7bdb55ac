//! Vulkan device, allocation and presentation layer for the Voxray renderer.
//!
//! This crate provides:
//! - Vulkan instance and ray tracing device setup
//! - GPU capability detection
//! - Buffer and image allocation via gpu-allocator
//! - Command buffer and synchronization helpers
//! - The swapchain frame synchronization manager

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod present;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod mock_backend;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use command::{execute_one_time_commands, CommandPool};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{write_descriptors, DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWrite};
pub use error::{GpuError, Result};
pub use frame::{AcquireOutcome, Frame, FrameHooks, FrameStatus, NoFrameHooks, SwapchainFrame};
pub use memory::{align_up, GpuAllocator, GpuBuffer, GpuImage};
pub use present::{PresentBackend, SwapchainConfig, VulkanPresentBackend};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{SwapchainManager, SwapchainSettings};
pub use sync::FrameFailure;

/// Swapchain manager over a real window surface.
pub type VulkanSwapchain = SwapchainManager<VulkanPresentBackend>;
