//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Required device feature not supported.
    #[error("Required device feature not supported: {0}")]
    FeatureNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader module creation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Raw Vulkan result code, if this error wraps one.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Vulkan(code) => Some(*code),
            _ => None,
        }
    }

    /// The swapchain no longer matches the surface and must be recreated.
    pub fn is_out_of_date(&self) -> bool {
        matches!(
            self.vk_result(),
            Some(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR)
        )
    }

    /// The logical device is gone; nothing created from it is usable anymore.
    pub fn is_device_lost(&self) -> bool {
        self.vk_result() == Some(vk::Result::ERROR_DEVICE_LOST)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_classification() {
        assert!(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR).is_out_of_date());
        assert!(GpuError::Vulkan(vk::Result::SUBOPTIMAL_KHR).is_out_of_date());
        assert!(!GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_out_of_date());
        assert!(!GpuError::InvalidState("x".into()).is_out_of_date());
    }

    #[test]
    fn device_lost_classification() {
        assert!(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        assert!(!GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY).is_device_lost());
        assert!(!GpuError::NoSuitableDevice.is_device_lost());
    }
}
