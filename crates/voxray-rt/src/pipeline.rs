//! Hardware ray tracing pipeline for procedural voxel cubes.
//!
//! Stages: raygen, miss, intersection, closest-hit. Groups: raygen, miss and
//! one procedural hit group. The raygen shader writes into an output storage
//! image which is blitted into the swapchain image afterwards.

use ash::vk;
use gpu_allocator::MemoryLocation;
use voxray_gpu::{
    write_descriptors, DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWrite, GpuBuffer,
    GpuContext, GpuError, GpuImage, Result,
};

use crate::camera::CameraUniforms;
use crate::sbt::{SbtLayout, ShaderBindingTable};

const OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

const COLOR_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// SPIR-V words for the four ray tracing stages.
#[derive(Debug, Clone, Default)]
pub struct ShaderSet {
    pub raygen: Vec<u32>,
    pub miss: Vec<u32>,
    pub closest_hit: Vec<u32>,
    pub intersection: Vec<u32>,
}

fn create_shader_module(device: &ash::Device, code: &[u32], stage: &str) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    // SAFETY: Code is caller-provided SPIR-V
    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(|e| GpuError::ShaderCompilation(format!("{stage} shader module: {e}")))
}

/// Output image the raygen shader writes into.
struct OutputImage {
    image: GpuImage,
    view: vk::ImageView,
}

impl OutputImage {
    fn new(gpu: &GpuContext, extent: vk::Extent2D) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(OUTPUT_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut image = gpu
            .allocator()
            .lock()
            .create_image(&image_info, MemoryLocation::GpuOnly, "rt_output")?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(OUTPUT_FORMAT)
            .subresource_range(COLOR_RANGE);

        // SAFETY: Image was just created with a compatible format
        match unsafe { gpu.device().create_image_view(&view_info, None) } {
            Ok(view) => Ok(Self { image, view }),
            Err(e) => {
                gpu.allocator().lock().free_image(&mut image)?;
                Err(e.into())
            }
        }
    }

    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.image.extent.width,
            height: self.image.extent.height,
        }
    }

    fn destroy(mut self, gpu: &GpuContext) -> Result<()> {
        // SAFETY: Caller guarantees the GPU is idle
        unsafe { gpu.device().destroy_image_view(self.view, None) };
        gpu.allocator().lock().free_image(&mut self.image)
    }
}

/// Ray tracing pipeline with its SBT, descriptors and output image.
///
/// Each in-flight slot owns one descriptor set and one camera buffer so the
/// host never writes uniforms a pending frame is reading.
pub struct RayTracePipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    camera_buffers: Vec<GpuBuffer>,
    sbt: ShaderBindingTable,
    output: OutputImage,
    tlas_bound: bool,
}

impl RayTracePipeline {
    /// Build the pipeline, its SBT and per-slot resources.
    ///
    /// Shader module, pipeline and SBT failures are fatal.
    pub fn new(gpu: &GpuContext, shaders: &ShaderSet, extent: vk::Extent2D, slots: usize) -> Result<Self> {
        let device = gpu.device();
        let slots = slots.max(1);
        let set_count = u32::try_from(slots)
            .map_err(|_| GpuError::InvalidState(format!("{slots} descriptor sets requested")))?;

        let bindings = DescriptorSetLayoutBuilder::new()
            .storage_image(0, vk::ShaderStageFlags::RAYGEN_KHR)
            .acceleration_structure(1, vk::ShaderStageFlags::RAYGEN_KHR)
            .uniform_buffer(2, vk::ShaderStageFlags::RAYGEN_KHR);
        // SAFETY: Device is valid
        let descriptor_set_layout = unsafe { bindings.build(device)? };

        let set_layouts = [descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        // SAFETY: Set layout was just created
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

        let pipeline = match Self::create_pipeline(gpu, shaders, layout) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                // SAFETY: Nothing references the layouts yet
                unsafe {
                    device.destroy_pipeline_layout(layout, None);
                    device.destroy_descriptor_set_layout(descriptor_set_layout, None);
                }
                return Err(e);
            }
        };

        let sbt_layout = SbtLayout::new(&gpu.capabilities().ray_tracing, 1, 1);
        let sbt = ShaderBindingTable::new(gpu, pipeline, sbt_layout)
            .map_err(|e| GpuError::PipelineCreation(format!("Shader binding table: {e}")))?;

        // SAFETY: Device is valid
        let descriptor_pool =
            unsafe { DescriptorPool::new(device, set_count, &bindings.pool_sizes(set_count))? };
        let layouts = vec![descriptor_set_layout; slots];
        // SAFETY: Pool was sized for exactly `slots` sets of this layout
        let descriptor_sets = unsafe { descriptor_pool.allocate(device, &layouts)? };

        let output = OutputImage::new(gpu, extent)?;

        let mut camera_buffers = Vec::with_capacity(slots);
        for (slot, &set) in descriptor_sets.iter().enumerate() {
            let buffer = gpu.allocator().lock().create_buffer(
                CameraUniforms::SIZE,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("rt_camera_{slot}"),
            )?;
            // SAFETY: Set is fresh and unused
            unsafe {
                write_descriptors(
                    device,
                    set,
                    &[
                        DescriptorWrite::StorageImage {
                            binding: 0,
                            view: output.view,
                        },
                        DescriptorWrite::UniformBuffer {
                            binding: 2,
                            buffer: buffer.buffer,
                            range: CameraUniforms::SIZE,
                        },
                    ],
                );
            }
            camera_buffers.push(buffer);
        }

        tracing::info!(
            width = extent.width,
            height = extent.height,
            slots,
            "Ray tracing pipeline created"
        );

        Ok(Self {
            pipeline,
            layout,
            descriptor_set_layout,
            descriptor_pool,
            descriptor_sets,
            camera_buffers,
            sbt,
            output,
            tlas_bound: false,
        })
    }

    fn create_pipeline(gpu: &GpuContext, shaders: &ShaderSet, layout: vk::PipelineLayout) -> Result<vk::Pipeline> {
        let device = gpu.device();
        let sources = [
            (vk::ShaderStageFlags::RAYGEN_KHR, shaders.raygen.as_slice(), "raygen"),
            (vk::ShaderStageFlags::MISS_KHR, shaders.miss.as_slice(), "miss"),
            (vk::ShaderStageFlags::INTERSECTION_KHR, shaders.intersection.as_slice(), "intersection"),
            (vk::ShaderStageFlags::CLOSEST_HIT_KHR, shaders.closest_hit.as_slice(), "closest_hit"),
        ];

        let mut modules = Vec::with_capacity(sources.len());
        for (_, code, name) in &sources {
            match create_shader_module(device, code, name) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in modules {
                        // SAFETY: Module is unused
                        unsafe { device.destroy_shader_module(module, None) };
                    }
                    return Err(e);
                }
            }
        }

        let stages: Vec<_> = sources
            .iter()
            .zip(&modules)
            .map(|((stage, _, _), &module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(*stage)
                    .module(module)
                    .name(c"main")
            })
            .collect();

        let general = |shader: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(shader)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
        };
        let groups = [
            general(0),
            general(1),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(3)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(2),
        ];

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(layout);

        // SAFETY: Stages, groups and layout are valid for the duration of the call
        let created = unsafe {
            gpu.ray_tracing_pipeline_fn().create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&pipeline_info),
                None,
            )
        };

        for module in modules {
            // SAFETY: Modules are no longer needed once the pipeline exists
            unsafe { device.destroy_shader_module(module, None) };
        }

        let pipelines =
            created.map_err(|e| GpuError::PipelineCreation(format!("Ray tracing pipeline: {e:?}")))?;
        pipelines
            .first()
            .copied()
            .ok_or_else(|| GpuError::PipelineCreation("No pipeline returned".to_string()))
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.output.extent()
    }

    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }

    pub fn slot_count(&self) -> usize {
        self.descriptor_sets.len()
    }

    /// Point every slot's descriptor set at `tlas`.
    ///
    /// Call after a rebuild; rebuilds drain the queue, so no pending frame
    /// references the sets.
    pub fn bind_tlas(&mut self, gpu: &GpuContext, tlas: vk::AccelerationStructureKHR) {
        for &set in &self.descriptor_sets {
            // SAFETY: Queue is idle after a rebuild
            unsafe {
                write_descriptors(
                    gpu.device(),
                    set,
                    &[DescriptorWrite::AccelerationStructure {
                        binding: 1,
                        structure: tlas,
                    }],
                );
            }
        }
        self.tlas_bound = true;
    }

    /// Record the trace for in-flight `slot` and upload its camera.
    ///
    /// # Safety
    /// `cmd` must be recording and the slot's previous submission must have
    /// completed.
    pub unsafe fn record(
        &mut self,
        gpu: &GpuContext,
        cmd: vk::CommandBuffer,
        slot: usize,
        camera: &CameraUniforms,
    ) -> Result<()> {
        if !self.tlas_bound {
            return Err(GpuError::InvalidState("No TLAS bound to the ray tracing pipeline".to_string()));
        }
        let set = *self
            .descriptor_sets
            .get(slot)
            .ok_or_else(|| GpuError::InvalidState(format!("No descriptor set for slot {slot}")))?;
        self.camera_buffers[slot].write_pod(0, std::slice::from_ref(camera))?;

        let device = gpu.device();
        // Orders after the previous frame's blit read
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .src_access_mask(vk::AccessFlags2::NONE)
            .dst_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
            .dst_access_mask(vk::AccessFlags2::SHADER_STORAGE_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .image(self.output.image.image)
            .subresource_range(COLOR_RANGE);
        let dependency = vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));

        let extent = self.output.extent();
        let regions = self.sbt.regions();
        // SAFETY: Caller guarantees cmd is recording
        unsafe {
            device.cmd_pipeline_barrier2(cmd, &dependency);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.layout,
                0,
                &[set],
                &[],
            );
            gpu.ray_tracing_pipeline_fn().cmd_trace_rays(
                cmd,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                extent.width,
                extent.height,
                1,
            );
        }
        Ok(())
    }

    /// Blit the output image into `target`, which must be in
    /// `TRANSFER_DST_OPTIMAL`.
    ///
    /// # Safety
    /// `cmd` must be recording and follow [`record`](Self::record).
    pub unsafe fn record_blit(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        target: vk::Image,
        target_extent: vk::Extent2D,
    ) {
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
            .src_access_mask(vk::AccessFlags2::SHADER_STORAGE_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::BLIT)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .image(self.output.image.image)
            .subresource_range(COLOR_RANGE);
        let dependency = vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));

        let corner = |extent: vk::Extent2D| vk::Offset3D {
            x: i32::try_from(extent.width).unwrap_or(i32::MAX),
            y: i32::try_from(extent.height).unwrap_or(i32::MAX),
            z: 1,
        };
        let blit = vk::ImageBlit::default()
            .src_subresource(COLOR_LAYERS)
            .src_offsets([vk::Offset3D::default(), corner(self.output.extent())])
            .dst_subresource(COLOR_LAYERS)
            .dst_offsets([vk::Offset3D::default(), corner(target_extent)]);

        // SAFETY: Caller guarantees cmd is recording
        unsafe {
            device.cmd_pipeline_barrier2(cmd, &dependency);
            device.cmd_blit_image(
                cmd,
                self.output.image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                target,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }
    }

    /// Recreate the output image at `extent` and rewrite the storage bindings.
    pub fn resize(&mut self, gpu: &GpuContext, extent: vk::Extent2D) -> Result<()> {
        if extent == self.output.extent() || extent.width == 0 || extent.height == 0 {
            return Ok(());
        }
        gpu.wait_idle()?;

        let output = OutputImage::new(gpu, extent)?;
        let old = std::mem::replace(&mut self.output, output);
        old.destroy(gpu)?;

        for &set in &self.descriptor_sets {
            // SAFETY: Device is idle
            unsafe {
                write_descriptors(
                    gpu.device(),
                    set,
                    &[DescriptorWrite::StorageImage {
                        binding: 0,
                        view: self.output.view,
                    }],
                );
            }
        }

        tracing::debug!(width = extent.width, height = extent.height, "Ray tracing output resized");
        Ok(())
    }

    /// Release every pipeline resource. Waits for the device to go idle.
    pub fn destroy(self, gpu: &GpuContext) -> Result<()> {
        gpu.wait_idle()?;
        let device = gpu.device();

        self.sbt.destroy(gpu)?;
        self.output.destroy(gpu)?;
        {
            let mut allocator = gpu.allocator().lock();
            for mut buffer in self.camera_buffers {
                allocator.free_buffer(&mut buffer)?;
            }
        }

        // SAFETY: Device is idle
        unsafe {
            self.descriptor_pool.destroy(device);
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
        Ok(())
    }
}
