//! Presentation backend seam.
//!
//! [`SwapchainManager`](crate::SwapchainManager) talks to the device only
//! through [`PresentBackend`], so its synchronization protocol can run
//! against the real Vulkan implementation or a recording fake.

use crate::command::{self, CommandPool};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::surface::{SurfaceCapabilities, SurfaceContext};
use crate::sync;
use ash::vk;
use std::sync::Arc;

/// Everything needed to create a swapchain, decided from surface capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// Device operations used by the swapchain frame protocol.
///
/// Errors are reported as [`GpuError`]; out-of-date and suboptimal results
/// from acquire and present come back as `Err(GpuError::Vulkan(..))` or as
/// the `suboptimal` flag and are classified by the caller.
pub trait PresentBackend {
    fn surface_capabilities(&self) -> Result<SurfaceCapabilities>;

    /// Create a swapchain, retiring `old` if it is not null.
    fn create_swapchain(
        &mut self,
        config: &SwapchainConfig,
        old: vk::SwapchainKHR,
    ) -> Result<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR);

    fn create_image_view(&mut self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn destroy_image_view(&mut self, view: vk::ImageView);

    fn create_semaphore(&mut self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&mut self, fence: vk::Fence);
    /// Block until the fence is signaled. No timeout.
    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;

    fn allocate_command_buffers(&mut self, count: u32) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&mut self, buffers: &[vk::CommandBuffer]);
    /// Reset and begin recording. The buffer must not be pending.
    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> Result<(u32, bool)>;

    /// Submit `cmd` on the present-capable queue, waiting on `wait` at the
    /// color attachment output stage.
    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()>;

    /// Returns whether the swapchain is suboptimal.
    fn present(
        &mut self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool>;

    fn wait_idle(&mut self) -> Result<()>;
}

/// [`PresentBackend`] over a live device and window surface.
///
/// Owns the surface and the pool that per-frame command buffers come from;
/// both are destroyed on drop. The [`GpuContext`] must outlive it.
pub struct VulkanPresentBackend {
    device: Arc<ash::Device>,
    queue: vk::Queue,
    surface: SurfaceContext,
    swapchain_loader: ash::khr::swapchain::Device,
    command_pool: CommandPool,
}

impl VulkanPresentBackend {
    /// Take ownership of `surface` and create the frame command pool.
    pub fn new(gpu: &GpuContext, surface: SurfaceContext) -> Result<Self> {
        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());

        // SAFETY: Device and queue family come from the live context
        let command_pool = unsafe {
            CommandPool::new(
                gpu.device(),
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        };
        let command_pool = match command_pool {
            Ok(pool) => pool,
            Err(e) => {
                // SAFETY: Nothing references the surface yet
                unsafe { surface.destroy() };
                return Err(e);
            }
        };

        Ok(Self {
            device: gpu.device_handle(),
            queue: gpu.graphics_queue(),
            surface,
            swapchain_loader,
            command_pool,
        })
    }

    /// Device the backend records and submits on.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }
}

impl PresentBackend for VulkanPresentBackend {
    fn surface_capabilities(&self) -> Result<SurfaceCapabilities> {
        self.surface.capabilities()
    }

    fn create_swapchain(
        &mut self,
        config: &SwapchainConfig,
        old: vk::SwapchainKHR,
    ) -> Result<vk::SwapchainKHR> {
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.surface)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(config.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old);

        // SAFETY: Surface is owned by self and the create info is complete
        unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        // SAFETY: Swapchain was created by this backend
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? })
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        // SAFETY: Caller guarantees the swapchain is idle
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn create_image_view(&mut self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        // SAFETY: Image belongs to a live swapchain
        Ok(unsafe { self.device.create_image_view(&view_info, None)? })
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        // SAFETY: Caller guarantees the view is unused
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        // SAFETY: Device is valid
        unsafe { sync::create_semaphore(&self.device) }
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        // SAFETY: Caller guarantees the semaphore is unused
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        // SAFETY: Device is valid
        unsafe { sync::create_fence(&self.device, signaled) }
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        // SAFETY: Caller guarantees the fence is unused
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
        // SAFETY: Fence was created by this backend
        unsafe { sync::wait_for_fence(&self.device, fence, u64::MAX) }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        // SAFETY: Fence was created by this backend and is not pending
        unsafe { sync::reset_fence(&self.device, fence) }
    }

    fn allocate_command_buffers(&mut self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        // SAFETY: Pool belongs to this device
        unsafe { self.command_pool.allocate(&self.device, count) }
    }

    fn free_command_buffers(&mut self, buffers: &[vk::CommandBuffer]) {
        // SAFETY: Caller guarantees the buffers are idle
        unsafe { self.command_pool.free(&self.device, buffers) };
    }

    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        // SAFETY: Caller guarantees the buffer is not pending
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            command::begin_command_buffer(
                &self.device,
                cmd,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )
        }
    }

    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        // SAFETY: Buffer is in the recording state
        unsafe { command::end_command_buffer(&self.device, cmd) }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> Result<(u32, bool)> {
        // SAFETY: Swapchain and semaphore were created by this backend
        let acquired = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
        };
        Ok(acquired?)
    }

    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        // SAFETY: All handles were created by this backend
        unsafe {
            command::submit_command_buffer(
                &self.device,
                self.queue,
                cmd,
                Some((wait, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)),
                Some(signal),
                fence,
            )
        }
    }

    fn present(
        &mut self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: Image was acquired from this swapchain and its work submitted
        let presented = unsafe { self.swapchain_loader.queue_present(self.queue, &present_info) };
        Ok(presented?)
    }

    fn wait_idle(&mut self) -> Result<()> {
        // SAFETY: Device is valid
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanPresentBackend {
    fn drop(&mut self) {
        // SAFETY: The swapchain manager destroyed its swapchain and idled the device first
        unsafe {
            self.command_pool.destroy(&self.device);
            self.surface.destroy();
        }
    }
}
