//! Swapchain frame synchronization.
//!
//! [`SwapchainManager`] owns the ring of presentable images and drives the
//! acquire → submit → present protocol. Two counters are kept apart: the
//! acquired image index (whatever the presentation engine hands back) and the
//! in-flight slot index (which fence and acquire semaphore the CPU uses next).
//! There is one frame per image and between one and `frame_count` slots.

use crate::error::{GpuError, Result};
use crate::frame::{AcquireOutcome, Frame, FrameHooks, FrameStatus, NoFrameHooks, SwapchainFrame};
use crate::present::{PresentBackend, SwapchainConfig};
use crate::surface::SurfaceCapabilities;
use crate::sync::FrameFailure;
use ash::vk;

/// Preferred format when the surface offers it.
const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Swapchain creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainSettings {
    /// Present mode used when the surface supports it, FIFO otherwise.
    pub present_mode: vk::PresentModeKHR,
    /// Requested width, used when the surface does not dictate one.
    pub width: u32,
    /// Requested height, used when the surface does not dictate one.
    pub height: u32,
    /// In-flight slot count, clamped to `[1, frame_count]`. `None` means one
    /// slot per image.
    pub frames_in_flight: Option<usize>,
}

impl SwapchainSettings {
    /// Settings for a window of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            present_mode: vk::PresentModeKHR::MAILBOX,
            width,
            height,
            frames_in_flight: None,
        }
    }

    /// Prefer FIFO (vsync) or MAILBOX.
    #[must_use]
    pub fn vsync(mut self, vsync: bool) -> Self {
        self.present_mode = if vsync {
            vk::PresentModeKHR::FIFO
        } else {
            vk::PresentModeKHR::MAILBOX
        };
        self
    }

    /// Set the preferred present mode.
    #[must_use]
    pub fn present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.present_mode = mode;
        self
    }

    /// Limit the number of in-flight slots.
    #[must_use]
    pub fn frames_in_flight(mut self, count: usize) -> Self {
        self.frames_in_flight = Some(count);
        self
    }
}

/// Pick the surface format: B8G8R8A8 sRGB if offered, else the first one.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .copied()
        .find(|f| f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space)
        .or_else(|| available.first().copied())
        .ok_or_else(|| GpuError::SwapchainCreation("Surface reports no formats".to_string()))
}

/// Pick `preferred` if supported, else FIFO, which every surface supports.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Use the surface's extent when it reports one, else clamp the request.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        let min = capabilities.min_image_extent;
        let max = capabilities.max_image_extent;
        vk::Extent2D {
            width: desired_width.clamp(min.width, max.width.max(min.width)),
            height: desired_height.clamp(min.height, max.height.max(min.height)),
        }
    }
}

/// `min_image_count + 1`, capped at `max_image_count` when the surface has a cap.
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Decide the swapchain configuration for the current surface state.
pub fn choose_config(
    surface: &SurfaceCapabilities,
    present_mode: vk::PresentModeKHR,
    width: u32,
    height: u32,
) -> Result<SwapchainConfig> {
    Ok(SwapchainConfig {
        surface_format: select_surface_format(&surface.formats)?,
        present_mode: select_present_mode(&surface.present_modes, present_mode),
        extent: calculate_extent(&surface.capabilities, width, height),
        image_count: image_count(&surface.capabilities),
        pre_transform: surface.capabilities.current_transform,
    })
}

#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    frame: Frame,
    submitted: bool,
}

/// Owns the swapchain, its frames and the per-frame synchronization.
pub struct SwapchainManager<B: PresentBackend> {
    backend: B,
    hooks: Box<dyn FrameHooks>,
    settings: SwapchainSettings,

    swapchain: vk::SwapchainKHR,
    config: SwapchainConfig,
    frames: Vec<SwapchainFrame>,
    slot_count: usize,

    acquired_index: u32,
    in_flight_index: usize,
    pending: Option<PendingFrame>,
    needs_rebuild: bool,
}

impl<B: PresentBackend> SwapchainManager<B> {
    /// Create the swapchain and one frame per presentable image.
    ///
    /// Any failure here is fatal.
    pub fn new(backend: B, settings: SwapchainSettings) -> Result<Self> {
        let surface = backend.surface_capabilities()?;
        let config = choose_config(&surface, settings.present_mode, settings.width, settings.height)?;
        if config.extent.width == 0 || config.extent.height == 0 {
            return Err(GpuError::SwapchainCreation(
                "Surface has a zero-sized extent".to_string(),
            ));
        }

        let mut manager = Self {
            backend,
            hooks: Box::new(NoFrameHooks),
            settings,
            swapchain: vk::SwapchainKHR::null(),
            config,
            frames: Vec::new(),
            slot_count: 0,
            acquired_index: 0,
            in_flight_index: 0,
            pending: None,
            needs_rebuild: false,
        };
        manager.build(config, Vec::new())?;
        Ok(manager)
    }

    /// Install hooks that run at the start and end of every frame.
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl FrameHooks + 'static) -> Self {
        self.set_hooks(hooks);
        self
    }

    /// Replace the frame hooks.
    pub fn set_hooks(&mut self, hooks: impl FrameHooks + 'static) {
        self.hooks.destroy();
        self.hooks = Box::new(hooks);
        self.hooks
            .swapchain_rebuilt(self.format(), self.extent(), self.frames.len());
    }

    /// Current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    /// Swapchain image format.
    pub fn format(&self) -> vk::Format {
        self.config.surface_format.format
    }

    /// Chosen surface format and color space.
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.config.surface_format
    }

    /// Present mode in use.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.config.present_mode
    }

    /// Number of presentable images, and of frames.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of in-flight synchronization slots.
    pub fn frames_in_flight(&self) -> usize {
        self.slot_count
    }

    /// Frame resources for image `index`.
    pub fn frame(&self, index: usize) -> Option<&SwapchainFrame> {
        self.frames.get(index)
    }

    /// Image views in image order.
    pub fn image_views(&self) -> Vec<vk::ImageView> {
        self.frames.iter().map(|f| f.view).collect()
    }

    /// Index of the most recently acquired image.
    pub fn current_image_index(&self) -> u32 {
        self.acquired_index
    }

    /// Slot the next acquire will use.
    pub fn in_flight_index(&self) -> usize {
        self.in_flight_index
    }

    /// Whether acquire will report `Invalidated` until `resize` succeeds.
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// Mark the swapchain stale, for example after a window resize event.
    pub fn invalidate(&mut self) {
        self.needs_rebuild = true;
    }

    /// Presentation backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable presentation backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Wait for the slot's fence, acquire an image and begin its command buffer.
    ///
    /// The returned frame's command buffer has no pending submission.
    /// Suboptimal and out-of-date results drop the frame and report
    /// [`AcquireOutcome::Invalidated`]; device loss is returned as `Err`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn acquire_next_frame(&mut self) -> Result<AcquireOutcome> {
        if self.pending.is_some() {
            return Err(GpuError::InvalidState(
                "Previous frame was acquired but not presented".to_string(),
            ));
        }
        if self.needs_rebuild || self.frames.is_empty() || self.slot_count == 0 {
            self.needs_rebuild = true;
            return Ok(AcquireOutcome::Invalidated);
        }

        let slot = self.in_flight_index;
        let slot_fence = self.frames[slot].fence;
        let acquire_semaphore = self.frames[slot].acquire_semaphore;

        if let Err(e) = self.backend.wait_for_fence(slot_fence) {
            return self.fail("wait for in-flight fence", e, false).map(Into::into);
        }

        let image_index = match self.backend.acquire_next_image(self.swapchain, acquire_semaphore) {
            Ok((_, true)) => {
                tracing::debug!("Swapchain suboptimal on acquire");
                self.needs_rebuild = true;
                return Ok(AcquireOutcome::Invalidated);
            }
            Ok((index, false)) => index,
            Err(e) => return self.fail("acquire", e, false).map(Into::into),
        };

        let index = image_index as usize;
        if index >= self.frames.len() {
            return Err(GpuError::InvalidState(format!(
                "Acquired image {index} but only {} frames exist",
                self.frames.len()
            )));
        }

        // The image may still be rendering under another slot's fence
        if let Some(previous) = self.frames[index].last_fence {
            if previous != slot_fence {
                if let Err(e) = self.backend.wait_for_fence(previous) {
                    return self.fail("wait for image fence", e, true).map(Into::into);
                }
            }
        }

        // Reset only once an image is in hand, so an out-of-date acquire
        // leaves the fence signaled for the next attempt.
        if let Err(e) = self.backend.reset_fence(slot_fence) {
            return self.fail("reset fence", e, true).map(Into::into);
        }
        self.frames[index].last_fence = Some(slot_fence);

        let target = self.frames[index];
        if let Err(e) = self.backend.begin_command_buffer(target.command_buffer) {
            return self.fail("begin command buffer", e, true).map(Into::into);
        }

        let frame = Frame {
            image_index,
            slot,
            image: target.image,
            view: target.view,
            command_buffer: target.command_buffer,
            format: self.format(),
            extent: self.extent(),
        };

        if let Err(e) = self.hooks.begin_frame(&frame) {
            return self.fail("begin frame hooks", e, true).map(Into::into);
        }

        self.acquired_index = image_index;
        self.pending = Some(PendingFrame {
            frame,
            submitted: false,
        });
        tracing::trace!(image_index, slot, "Frame acquired");
        Ok(AcquireOutcome::Ready(frame))
    }

    /// End the frame's command buffer and submit it.
    ///
    /// Waits on the slot's acquire semaphore at the color attachment output
    /// stage and signals the image's render-finished semaphore and the slot
    /// fence.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit(&mut self, frame: &Frame) -> Result<FrameStatus> {
        let pending = match self.pending {
            Some(pending) if pending.frame == *frame && !pending.submitted => pending,
            _ => {
                return Err(GpuError::InvalidState(
                    "Submitted frame is not the acquired one".to_string(),
                ))
            }
        };

        let slot = &self.frames[pending.frame.slot];
        let (wait, fence) = (slot.acquire_semaphore, slot.fence);
        let signal = self.frames[pending.frame.image_index as usize].render_finished;

        let submitted = self
            .hooks
            .end_frame(frame)
            .and_then(|()| self.backend.end_command_buffer(frame.command_buffer))
            .and_then(|()| self.backend.submit(frame.command_buffer, wait, signal, fence));

        match submitted {
            Ok(()) => {
                self.pending = Some(PendingFrame {
                    submitted: true,
                    ..pending
                });
                Ok(FrameStatus::Presented)
            }
            // The slot fence was reset and will never signal now
            Err(e) => self.fail("submit", e, true),
        }
    }

    /// Present the submitted frame and advance the in-flight slot.
    ///
    /// Suboptimal and out-of-date results report [`FrameStatus::Invalidated`];
    /// device loss is returned as `Err`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn present_frame(&mut self) -> Result<FrameStatus> {
        let Some(pending) = self.pending.take() else {
            tracing::debug!("Present without an acquired frame");
            return Ok(FrameStatus::Skipped);
        };
        if !pending.submitted {
            return Err(GpuError::InvalidState(
                "Frame presented before it was submitted".to_string(),
            ));
        }

        let index = pending.frame.image_index;
        let wait = self.frames[index as usize].render_finished;
        let presented = self.backend.present(self.swapchain, index, wait);
        self.in_flight_index = (self.in_flight_index + 1) % self.slot_count;

        match presented {
            Ok(false) => {
                tracing::trace!(image_index = index, "Frame presented");
                Ok(FrameStatus::Presented)
            }
            Ok(true) => {
                tracing::debug!("Swapchain suboptimal on present");
                self.needs_rebuild = true;
                Ok(FrameStatus::Invalidated)
            }
            // The render-finished semaphore may still be signaled
            Err(e) => self.fail("present", e, true),
        }
    }

    /// Recreate the swapchain for a new window size.
    ///
    /// Returns `false` without touching anything when the surface extent is
    /// zero (minimized window); the manager stays invalidated until a later
    /// call succeeds. Existing frame slots are reused up to the new image
    /// count. Both frame counters restart at zero.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<bool> {
        self.settings.width = width;
        self.settings.height = height;

        if width == 0 || height == 0 {
            tracing::debug!(width, height, "Deferring resize of minimized surface");
            self.needs_rebuild = true;
            return Ok(false);
        }

        self.backend.wait_idle()?;

        let surface = self.backend.surface_capabilities()?;
        let config = choose_config(&surface, self.settings.present_mode, width, height)?;
        if config.extent.width == 0 || config.extent.height == 0 {
            tracing::debug!("Deferring resize, surface reports a zero extent");
            self.needs_rebuild = true;
            return Ok(false);
        }

        // Stays set if the rebuild fails, so acquire keeps off the torn down frames
        self.needs_rebuild = true;
        let command_buffers = self.teardown_frames();
        if self.swapchain != vk::SwapchainKHR::null() {
            self.backend.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }

        self.pending = None;
        self.acquired_index = 0;
        self.in_flight_index = 0;
        self.config = config;
        self.build(config, command_buffers)?;
        self.needs_rebuild = false;
        Ok(true)
    }

    /// Route a per-frame failure: device loss propagates, anything else drops
    /// the frame. `poisoned` marks failures after the slot fence was reset.
    fn fail(&mut self, stage: &str, error: GpuError, poisoned: bool) -> Result<FrameStatus> {
        self.pending = None;
        match FrameFailure::classify(&error) {
            FrameFailure::DeviceLost => {
                tracing::error!("Device lost during {stage}");
                Err(error)
            }
            FrameFailure::Invalidated => {
                tracing::debug!("Swapchain out of date during {stage}");
                self.needs_rebuild = true;
                Ok(FrameStatus::Invalidated)
            }
            FrameFailure::Transient => {
                tracing::warn!("Dropping frame, {stage} failed: {error}");
                if poisoned {
                    self.needs_rebuild = true;
                }
                Ok(FrameStatus::Skipped)
            }
        }
    }

    /// Create the swapchain and frames, reusing `command_buffers` for the
    /// leading frames.
    fn build(&mut self, config: SwapchainConfig, mut command_buffers: Vec<vk::CommandBuffer>) -> Result<()> {
        let swapchain = match self.backend.create_swapchain(&config, vk::SwapchainKHR::null()) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                self.backend.free_command_buffers(&command_buffers);
                return Err(e);
            }
        };
        self.swapchain = swapchain;

        let images = match self.backend.swapchain_images(swapchain) {
            Ok(images) if !images.is_empty() => images,
            Ok(_) => {
                self.backend.free_command_buffers(&command_buffers);
                return Err(GpuError::SwapchainCreation(
                    "Swapchain returned no images".to_string(),
                ));
            }
            Err(e) => {
                self.backend.free_command_buffers(&command_buffers);
                return Err(e);
            }
        };

        if command_buffers.len() > images.len() {
            let excess = command_buffers.split_off(images.len());
            self.backend.free_command_buffers(&excess);
        } else if command_buffers.len() < images.len() {
            let missing = u32::try_from(images.len() - command_buffers.len())
                .map_err(|_| GpuError::SwapchainCreation("Too many swapchain images".to_string()))?;
            match self.backend.allocate_command_buffers(missing) {
                Ok(buffers) => command_buffers.extend(buffers),
                Err(e) => {
                    self.backend.free_command_buffers(&command_buffers);
                    return Err(e);
                }
            }
        }

        // Frames join the list as soon as they exist so a failure part way
        // is cleaned up by the normal teardown.
        for (image, cmd) in images.into_iter().zip(command_buffers) {
            self.frames.push(SwapchainFrame::empty(image, cmd));
            let frame = self.frames.len() - 1;
            self.create_frame_objects(frame, config.surface_format.format)?;
        }

        let frame_count = self.frames.len();
        self.slot_count = self
            .settings
            .frames_in_flight
            .map_or(frame_count, |n| n.clamp(1, frame_count));

        tracing::info!(
            "Swapchain built: {}x{} {:?} {:?}, {} images, {} in flight",
            config.extent.width,
            config.extent.height,
            config.surface_format.format,
            config.present_mode,
            frame_count,
            self.slot_count
        );
        self.hooks
            .swapchain_rebuilt(config.surface_format.format, config.extent, frame_count);
        Ok(())
    }

    fn create_frame_objects(&mut self, index: usize, format: vk::Format) -> Result<()> {
        let image = self.frames[index].image;
        self.frames[index].view = self.backend.create_image_view(image, format)?;
        self.frames[index].acquire_semaphore = self.backend.create_semaphore()?;
        self.frames[index].render_finished = self.backend.create_semaphore()?;
        self.frames[index].fence = self.backend.create_fence(true)?;
        Ok(())
    }

    /// Destroy every frame's view and sync objects, handing back the command
    /// buffers. The device must be idle.
    fn teardown_frames(&mut self) -> Vec<vk::CommandBuffer> {
        self.slot_count = 0;
        let mut command_buffers = Vec::with_capacity(self.frames.len());
        for frame in self.frames.drain(..) {
            if frame.view != vk::ImageView::null() {
                self.backend.destroy_image_view(frame.view);
            }
            if frame.acquire_semaphore != vk::Semaphore::null() {
                self.backend.destroy_semaphore(frame.acquire_semaphore);
            }
            if frame.render_finished != vk::Semaphore::null() {
                self.backend.destroy_semaphore(frame.render_finished);
            }
            if frame.fence != vk::Fence::null() {
                self.backend.destroy_fence(frame.fence);
            }
            command_buffers.push(frame.command_buffer);
        }
        command_buffers
    }
}

impl<B: PresentBackend> Drop for SwapchainManager<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            tracing::error!("Wait idle before swapchain teardown failed: {e}");
        }
        self.hooks.destroy();

        let command_buffers = self.teardown_frames();
        self.backend.free_command_buffers(&command_buffers);
        if self.swapchain != vk::SwapchainKHR::null() {
            self.backend.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
        tracing::debug!("Swapchain destroyed");
    }
}
