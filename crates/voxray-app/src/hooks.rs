//! Swapchain image layout transitions around each frame.

use std::sync::Arc;

use ash::vk;
use voxray_gpu::{Frame, FrameHooks};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Layout transition recorded at one end of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

/// Swapchain image becomes a transfer destination for the ray traced blit.
///
/// Starts at the stage the acquire semaphore is waited on, so the transition
/// happens after the presentation engine released the image.
pub(crate) const BEGIN_TRANSITION: LayoutTransition = LayoutTransition {
    old_layout: vk::ImageLayout::UNDEFINED,
    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    src_access: vk::AccessFlags2::NONE,
    dst_stage: vk::PipelineStageFlags2::ALL_TRANSFER,
    dst_access: vk::AccessFlags2::TRANSFER_WRITE,
};

/// Swapchain image is handed to the presentation engine.
pub(crate) const END_TRANSITION: LayoutTransition = LayoutTransition {
    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    src_stage: vk::PipelineStageFlags2::ALL_TRANSFER,
    src_access: vk::AccessFlags2::TRANSFER_WRITE,
    dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
    dst_access: vk::AccessFlags2::NONE,
};

/// Frame hooks that move the swapchain image into `TRANSFER_DST_OPTIMAL`
/// before the caller records and into `PRESENT_SRC_KHR` afterwards.
pub struct PresentLayoutHooks {
    device: Arc<ash::Device>,
}

impl PresentLayoutHooks {
    pub fn new(device: Arc<ash::Device>) -> Self {
        Self { device }
    }

    fn transition(&self, frame: &Frame, transition: LayoutTransition) {
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(transition.src_stage)
            .src_access_mask(transition.src_access)
            .dst_stage_mask(transition.dst_stage)
            .dst_access_mask(transition.dst_access)
            .old_layout(transition.old_layout)
            .new_layout(transition.new_layout)
            .image(frame.image)
            .subresource_range(COLOR_RANGE);
        let dependency = vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        // SAFETY: The swapchain manager only runs hooks while the command buffer records
        unsafe { self.device.cmd_pipeline_barrier2(frame.command_buffer, &dependency) };
    }
}

impl FrameHooks for PresentLayoutHooks {
    fn begin_frame(&mut self, frame: &Frame) -> voxray_gpu::Result<()> {
        self.transition(frame, BEGIN_TRANSITION);
        Ok(())
    }

    fn end_frame(&mut self, frame: &Frame) -> voxray_gpu::Result<()> {
        self.transition(frame, END_TRANSITION);
        Ok(())
    }

    fn swapchain_rebuilt(&mut self, format: vk::Format, extent: vk::Extent2D, image_count: usize) {
        tracing::trace!(?format, width = extent.width, height = extent.height, image_count, "Present hooks rebound");
    }
}

/// Fill a `TRANSFER_DST_OPTIMAL` image with a solid color.
///
/// # Safety
/// `cmd` must be recording.
pub unsafe fn record_clear(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image, color: [f32; 4]) {
    let clear = vk::ClearColorValue { float32: color };
    // SAFETY: Caller guarantees cmd is recording
    unsafe {
        device.cmd_clear_color_image(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear,
            &[COLOR_RANGE],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_chain() {
        assert_eq!(BEGIN_TRANSITION.new_layout, END_TRANSITION.old_layout);
        assert_eq!(BEGIN_TRANSITION.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(END_TRANSITION.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn begin_transition_chains_with_acquire_wait() {
        assert_eq!(
            BEGIN_TRANSITION.src_stage,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
    }

    #[test]
    fn end_transition_waits_for_transfer_writes() {
        assert!(END_TRANSITION
            .src_access
            .contains(vk::AccessFlags2::TRANSFER_WRITE));
        assert!(BEGIN_TRANSITION
            .dst_access
            .contains(vk::AccessFlags2::TRANSFER_WRITE));
    }
}
