//! Per-image frame resources and the frame lifecycle hooks.

use crate::error::Result;
use ash::vk;

/// Resources tied to one presentable image.
///
/// Frame `k` also provides the acquire semaphore and fence for in-flight
/// slot `k`; the render-finished semaphore and command buffer always belong
/// to the image that was acquired.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainFrame {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub command_buffer: vk::CommandBuffer,
    pub acquire_semaphore: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub fence: vk::Fence,
    /// Slot fence covering this image's most recent submission.
    pub(crate) last_fence: Option<vk::Fence>,
}

impl SwapchainFrame {
    pub(crate) fn empty(image: vk::Image, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            image,
            view: vk::ImageView::null(),
            command_buffer,
            acquire_semaphore: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            fence: vk::Fence::null(),
            last_fence: None,
        }
    }
}

/// An acquired image ready for recording.
///
/// The command buffer is already in the recording state when the caller
/// receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Index of the acquired presentable image.
    pub image_index: u32,
    /// In-flight slot whose fence and acquire semaphore guard this frame.
    pub slot: usize,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub command_buffer: vk::CommandBuffer,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Result of a submit or present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The step completed.
    Presented,
    /// Swapchain is stale; call `resize` before the next acquire.
    Invalidated,
    /// A transient failure dropped this frame; the loop may continue.
    Skipped,
}

/// Result of acquiring the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Record into this frame, then submit and present it.
    Ready(Frame),
    /// Swapchain is stale; call `resize` and try again.
    Invalidated,
    /// A transient failure; nothing was acquired.
    Skipped,
}

impl From<FrameStatus> for AcquireOutcome {
    fn from(status: FrameStatus) -> Self {
        match status {
            FrameStatus::Invalidated => Self::Invalidated,
            FrameStatus::Presented | FrameStatus::Skipped => Self::Skipped,
        }
    }
}

/// Extra per-frame steps run by the swapchain manager.
///
/// `begin_frame` runs right after the command buffer begins recording and
/// `end_frame` right before it ends, so hooks can add layout transitions or
/// overlay passes around the caller's commands.
pub trait FrameHooks {
    fn begin_frame(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }

    fn end_frame(&mut self, _frame: &Frame) -> Result<()> {
        Ok(())
    }

    /// Called after the swapchain was (re)built.
    fn swapchain_rebuilt(&mut self, _format: vk::Format, _extent: vk::Extent2D, _image_count: usize) {}

    /// Called once while the manager is torn down, with the device idle.
    fn destroy(&mut self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFrameHooks;

impl FrameHooks for NoFrameHooks {}
