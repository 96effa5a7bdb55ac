//! Command buffer management.

use crate::context::GpuContext;
use crate::error::Result;
use crate::sync::{create_fence, wait_for_fence};
use ash::vk;

/// Command pool for allocating command buffers.
///
/// Destruction is explicit: the owner calls [`CommandPool::destroy`] once no
/// buffer from the pool is pending.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        // SAFETY: Caller guarantees the device is valid
        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(&self, device: &ash::Device, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        // SAFETY: Caller guarantees the device is valid
        let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        Ok(buffers)
    }

    /// Return command buffers to the pool.
    ///
    /// # Safety
    /// None of the buffers may be pending execution.
    pub unsafe fn free(&self, device: &ash::Device, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            // SAFETY: Caller guarantees the buffers are idle
            unsafe { device.free_command_buffers(self.pool, buffers) };
        }
    }

    /// Destroy the command pool and every buffer allocated from it.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        // SAFETY: Caller guarantees the pool is idle
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid, and the buffer not pending.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    // SAFETY: Caller guarantees handles are valid
    unsafe { device.begin_command_buffer(cmd, &begin_info)? };
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    // SAFETY: Caller guarantees handles are valid
    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}

/// Submit one command buffer with a single wait and signal semaphore.
///
/// Null semaphores are left out of the submission.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffer(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    signal: Option<vk::Semaphore>,
    fence: vk::Fence,
) -> Result<()> {
    let command_buffers = [cmd];
    let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = wait.into_iter().unzip();
    let signal_semaphores: Vec<_> = signal.into_iter().collect();

    let submit_info = vk::SubmitInfo::default()
        .command_buffers(&command_buffers)
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .signal_semaphores(&signal_semaphores);

    // SAFETY: Caller guarantees handles are valid
    unsafe { device.queue_submit(queue, std::slice::from_ref(&submit_info), fence)? };
    Ok(())
}

/// Record and run a one-time command buffer on the graphics queue, blocking
/// until the GPU has finished it.
///
/// A transient pool and fence are created for the call and destroyed after
/// the wait, so resources referenced by the recording may be freed as soon as
/// this returns.
pub fn execute_one_time_commands<F>(gpu: &GpuContext, record: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    let device = gpu.device();

    // SAFETY: Device and queue family come from the live context
    let pool = unsafe {
        CommandPool::new(
            device,
            gpu.graphics_queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?
    };

    let result = (|| {
        // SAFETY: Pool was just created from this device
        let cmd = unsafe { pool.allocate(device, 1)? }
            .first()
            .copied()
            .ok_or_else(|| crate::GpuError::InvalidState("No command buffer allocated".into()))?;

        // SAFETY: Freshly allocated buffer
        unsafe {
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        }
        record(cmd)?;
        // SAFETY: Recording was begun above
        unsafe { end_command_buffer(device, cmd)? };

        // SAFETY: Device is valid
        let fence = unsafe { create_fence(device, false)? };
        // SAFETY: Buffer is fully recorded, fence is unsignaled
        let submitted = unsafe {
            submit_command_buffer(device, gpu.graphics_queue(), cmd, None, None, fence)
                .and_then(|()| wait_for_fence(device, fence, u64::MAX))
        };
        // SAFETY: Either the wait completed or the submission never happened
        unsafe { device.destroy_fence(fence, None) };
        submitted
    })();

    // SAFETY: The one-time buffer is no longer pending
    unsafe { pool.destroy(device) };
    result
}
