//! GPU buffer and image allocation.
//!
//! Every buffer is created with `SHADER_DEVICE_ADDRESS` usage so acceleration
//! structure inputs, scratch space and shader binding tables can be addressed
//! from the device.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Round `value` up to the next multiple of `alignment`.
///
/// An alignment of zero or one leaves the value unchanged. Non power of two
/// alignments are handled too.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Allocator owned by the GPU context, shared behind a mutex.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator with buffer device addresses enabled.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
    }

    fn release(&mut self, allocation: Allocation) -> Result<()> {
        self.inner()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Create a buffer of `size` bytes.
    ///
    /// `SHADER_DEVICE_ADDRESS` is always added to `usage`. Host visible
    /// buffers come back persistently mapped and zero filled.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        if size == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "{name}: zero-sized buffer"
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: Device is valid while the allocator lives
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        // SAFETY: Buffer was just created
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: Buffer is unbound and unused
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        // SAFETY: Allocation satisfies the buffer requirements
        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            // SAFETY: Buffer is unused
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.release(allocation)?;
            return Err(e.into());
        }

        let mut gpu_buffer = GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        };
        if let Some(bytes) = gpu_buffer.mapped_slice_mut() {
            bytes.fill(0);
        }

        tracing::trace!(name, size, ?location, "Buffer created");
        Ok(gpu_buffer)
    }

    /// Free a buffer and its memory. Freeing twice is a no-op.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.release(allocation)?;
        }
        if buffer.buffer != vk::Buffer::null() {
            // SAFETY: Caller guarantees the GPU is done with the buffer
            unsafe { self.device.destroy_buffer(buffer.buffer, None) };
            buffer.buffer = vk::Buffer::null();
        }
        Ok(())
    }

    /// Create an image bound to freshly allocated memory.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        // SAFETY: Device is valid while the allocator lives
        let image = unsafe { self.device.create_image(create_info, None)? };
        // SAFETY: Image was just created
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let linear = create_info.tiling == vk::ImageTiling::LINEAR;
        let allocation = match self.allocate(name, requirements, location, linear) {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: Image is unbound and unused
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        // SAFETY: Allocation satisfies the image requirements
        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            // SAFETY: Image is unused
            unsafe { self.device.destroy_image(image, None) };
            self.release(allocation)?;
            return Err(e.into());
        }

        tracing::trace!(name, ?create_info.extent, ?create_info.format, "Image created");
        Ok(GpuImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
        })
    }

    /// Free an image and its memory. Freeing twice is a no-op.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.release(allocation)?;
        }
        if image.image != vk::Image::null() {
            // SAFETY: Caller guarantees the GPU is done with the image
            unsafe { self.device.destroy_image(image.image, None) };
            image.image = vk::Image::null();
        }
        Ok(())
    }

    /// Drop the inner allocator, releasing every device memory block.
    ///
    /// Must run before the device is destroyed. Outstanding allocations are
    /// reported as leaks.
    pub fn shutdown(&mut self) {
        if self.allocator.take().is_some() {
            tracing::debug!("GPU allocator shut down");
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A buffer together with its memory.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    /// Device address of the start of this buffer.
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        // SAFETY: Buffer was created with SHADER_DEVICE_ADDRESS usage
        unsafe { device.get_buffer_device_address(&info) }
    }

    /// Device address rounded up to `alignment`.
    ///
    /// Callers that need an aligned start over-allocate by `alignment` bytes.
    pub fn aligned_device_address(&self, device: &ash::Device, alignment: u64) -> vk::DeviceAddress {
        align_up(self.device_address(device), alignment)
    }

    /// Host view of the buffer memory, if it is mapped.
    pub fn mapped_slice(&self) -> Option<&[u8]> {
        self.allocation.as_ref().and_then(Allocation::mapped_slice)
    }

    /// Mutable host view of the buffer memory, if it is mapped.
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.allocation.as_mut().and_then(Allocation::mapped_slice_mut)
    }

    /// Copy `data` into the buffer at `offset` bytes.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let size = self.size;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= size)
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "Write of {} bytes at {offset} overruns {size}-byte buffer",
                    data.len()
                ))
            })?;

        let bytes = self
            .mapped_slice_mut()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        let start = usize::try_from(offset)
            .map_err(|_| GpuError::InvalidState("Offset exceeds address space".to_string()))?;
        let end = usize::try_from(end)
            .map_err(|_| GpuError::InvalidState("Offset exceeds address space".to_string()))?;
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy plain-old-data values into the buffer at `offset` bytes.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }
}

/// An image together with its memory.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(33, 32), 64);
    }

    #[test]
    fn align_up_trivial_alignments() {
        assert_eq!(align_up(17, 0), 17);
        assert_eq!(align_up(17, 1), 17);
    }

    #[test]
    fn align_up_non_power_of_two() {
        assert_eq!(align_up(10, 12), 12);
        assert_eq!(align_up(25, 12), 36);
    }

    #[test]
    fn freed_buffer_reports_unmapped() {
        let buffer = GpuBuffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 16,
        };
        assert!(buffer.mapped_slice().is_none());
    }

    #[test]
    fn write_past_end_is_rejected() {
        let mut buffer = GpuBuffer {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 16,
        };
        let err = buffer.write_bytes(12, &[0; 8]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
    }
}
