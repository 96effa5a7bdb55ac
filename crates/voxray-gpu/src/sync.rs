//! Synchronization primitives and per-frame failure classification.

use crate::error::{GpuError, Result};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    // SAFETY: Caller guarantees the device is valid
    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

/// Create a fence, optionally already signaled.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    // SAFETY: Caller guarantees the device is valid
    let fence = unsafe { device.create_fence(&create_info, None)? };
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    // SAFETY: Caller guarantees handles are valid
    unsafe { device.wait_for_fences(&[fence], true, timeout_ns)? };
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    // SAFETY: Caller guarantees handles are valid
    unsafe { device.reset_fences(&[fence])? };
    Ok(())
}

/// How a failed acquire, submit or present affects the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFailure {
    /// Surface changed; drop the frame and recreate the swapchain.
    Invalidated,
    /// Device is gone; nothing can continue.
    DeviceLost,
    /// Anything else; log it, drop the frame and keep going.
    Transient,
}

impl FrameFailure {
    /// Classify an error raised during steady-state presentation.
    pub fn classify(error: &GpuError) -> Self {
        if error.is_device_lost() {
            Self::DeviceLost
        } else if error.is_out_of_date() {
            Self::Invalidated
        } else {
            Self::Transient
        }
    }

    /// Whether the render loop must stop.
    pub fn is_fatal(self) -> bool {
        self == Self::DeviceLost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_surface_invalidation() {
        for code in [vk::Result::ERROR_OUT_OF_DATE_KHR, vk::Result::SUBOPTIMAL_KHR] {
            assert_eq!(
                FrameFailure::classify(&GpuError::Vulkan(code)),
                FrameFailure::Invalidated
            );
        }
    }

    #[test]
    fn classify_device_lost_is_fatal() {
        let failure = FrameFailure::classify(&GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(failure, FrameFailure::DeviceLost);
        assert!(failure.is_fatal());
    }

    #[test]
    fn classify_other_errors_as_transient() {
        let failure =
            FrameFailure::classify(&GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert_eq!(failure, FrameFailure::Transient);
        assert!(!failure.is_fatal());
        assert_eq!(
            FrameFailure::classify(&GpuError::InvalidState("x".into())),
            FrameFailure::Transient
        );
    }
}
