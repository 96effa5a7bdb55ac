//! Shader binding table layout and upload.
//!
//! Regions are laid out back to back in one host-visible buffer:
//! - Ray generation: 1 handle
//! - Miss: `miss_count` handles
//! - Hit groups: `hit_count` handles (intersection + closest-hit)
//! - Callable: empty

use ash::vk;
use gpu_allocator::MemoryLocation;
use voxray_gpu::{align_up, GpuBuffer, GpuContext, GpuError, RayTracingCapabilities, Result};

/// Byte offset and size of one region inside the SBT buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtRegion {
    pub offset: u64,
    pub size: u64,
}

/// Strided device address regions passed to `vkCmdTraceRaysKHR`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Host-side SBT layout computed from the device's handle properties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtLayout {
    handle_size: u64,
    base_alignment: u64,
    stride: u64,
    miss_count: u32,
    hit_count: u32,
    raygen: SbtRegion,
    miss: SbtRegion,
    hit: SbtRegion,
}

impl SbtLayout {
    /// Compute the layout for one raygen shader plus the given miss and hit groups.
    pub fn new(caps: &RayTracingCapabilities, miss_count: u32, hit_count: u32) -> Self {
        let handle_size = u64::from(caps.shader_group_handle_size);
        let base_alignment = u64::from(caps.shader_group_base_alignment);
        let stride = align_up(handle_size, u64::from(caps.shader_group_handle_alignment));

        // The raygen region size must equal its stride; the next region still
        // starts on a base-aligned boundary
        let raygen = SbtRegion {
            offset: 0,
            size: stride,
        };
        let miss = SbtRegion {
            offset: align_up(stride, base_alignment),
            size: align_up(u64::from(miss_count) * stride, base_alignment),
        };
        let hit = SbtRegion {
            offset: miss.offset + miss.size,
            size: align_up(u64::from(hit_count) * stride, base_alignment),
        };

        Self {
            handle_size,
            base_alignment,
            stride,
            miss_count,
            hit_count,
            raygen,
            miss,
            hit,
        }
    }

    /// Handle stride shared by every region.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn raygen(&self) -> SbtRegion {
        self.raygen
    }

    pub fn miss(&self) -> SbtRegion {
        self.miss
    }

    pub fn hit(&self) -> SbtRegion {
        self.hit
    }

    /// Number of shader groups the pipeline must expose.
    pub fn group_count(&self) -> u32 {
        1 + self.miss_count + self.hit_count
    }

    /// Bytes of packed table data.
    pub fn total_size(&self) -> u64 {
        self.hit.offset + self.hit.size
    }

    /// Pack group handles, in program order, into their region offsets.
    ///
    /// Padding between handles stays zeroed.
    pub fn pack(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let expected = handle_size * self.group_count() as usize;
        if handles.len() < expected {
            return Err(GpuError::InvalidState(format!(
                "Expected {expected} bytes of shader group handles, got {}",
                handles.len()
            )));
        }

        let mut table = vec![0_u8; self.total_size() as usize];
        let slots = std::iter::once(self.raygen.offset)
            .chain((0..u64::from(self.miss_count)).map(|i| self.miss.offset + i * self.stride))
            .chain((0..u64::from(self.hit_count)).map(|i| self.hit.offset + i * self.stride));

        for (handle, offset) in handles.chunks_exact(handle_size).zip(slots) {
            let offset = offset as usize;
            table[offset..offset + handle_size].copy_from_slice(handle);
        }
        Ok(table)
    }

    /// Regions relative to a base-aligned buffer address.
    pub fn regions(&self, base_address: vk::DeviceAddress) -> SbtRegions {
        let region = |r: SbtRegion| vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + r.offset,
            stride: self.stride,
            size: r.size,
        };
        SbtRegions {
            raygen: region(self.raygen),
            miss: region(self.miss),
            hit: region(self.hit),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        }
    }
}

/// Shader binding table uploaded for one ray tracing pipeline.
pub struct ShaderBindingTable {
    buffer: GpuBuffer,
    layout: SbtLayout,
    regions: SbtRegions,
}

impl ShaderBindingTable {
    /// Fetch the pipeline's group handles and upload them.
    ///
    /// Failure here is fatal for pipeline creation.
    pub fn new(gpu: &GpuContext, pipeline: vk::Pipeline, layout: SbtLayout) -> Result<Self> {
        let data_size = layout.handle_size as usize * layout.group_count() as usize;
        // SAFETY: Pipeline was created with exactly `group_count` groups
        let handles = unsafe {
            gpu.ray_tracing_pipeline_fn().get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                layout.group_count(),
                data_size,
            )?
        };
        let table = layout.pack(&handles)?;

        // Room to slide the table onto a base-aligned address
        let mut buffer = gpu.allocator().lock().create_buffer(
            layout.total_size() + layout.base_alignment,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
            MemoryLocation::CpuToGpu,
            "shader_binding_table",
        )?;

        let address = buffer.device_address(gpu.device());
        let base_address = buffer.aligned_device_address(gpu.device(), layout.base_alignment);
        if let Err(e) = buffer.write_bytes(base_address - address, &table) {
            gpu.allocator().lock().free_buffer(&mut buffer)?;
            return Err(e);
        }

        let regions = layout.regions(base_address);
        tracing::debug!(
            stride = layout.stride,
            raygen = regions.raygen.size,
            miss = regions.miss.size,
            hit = regions.hit.size,
            "Shader binding table uploaded"
        );

        Ok(Self {
            buffer,
            layout,
            regions,
        })
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    /// Regions to pass to `vkCmdTraceRaysKHR`.
    pub fn regions(&self) -> &SbtRegions {
        &self.regions
    }

    /// Free the table buffer. The pipeline must no longer be traced with it.
    pub fn destroy(mut self, gpu: &GpuContext) -> Result<()> {
        gpu.allocator().lock().free_buffer(&mut self.buffer)
    }
}
