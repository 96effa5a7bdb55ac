//! Acceleration structure management for voxel instances.
//!
//! One bottom-level structure holds a single procedural unit-cube AABB; the
//! intersection shader turns it into a voxel. Every voxel is an instance of
//! that BLAS in the top-level structure. The TLAS is always rebuilt from
//! scratch; there is no refit path, which caps practical instance counts.

use ash::vk;
use glam::{Mat4, Quat, Vec3};
use gpu_allocator::MemoryLocation;
use voxray_gpu::{execute_one_time_commands, GpuBuffer, GpuContext, GpuError, Result};

/// Bytes per `VkAccelerationStructureInstanceKHR`.
pub const INSTANCE_DESCRIPTOR_SIZE: usize = 64;

/// Byte offset of the BLAS reference inside an instance descriptor.
pub const INSTANCE_REFERENCE_OFFSET: usize = 56;

/// AABB positions for procedural geometry (24 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AabbPositions {
    pub min_x: f32,
    pub min_y: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_y: f32,
    pub max_z: f32,
}

impl AabbPositions {
    /// Unit cube centered on the origin.
    pub const UNIT_CUBE: Self = Self {
        min_x: -0.5,
        min_y: -0.5,
        min_z: -0.5,
        max_x: 0.5,
        max_y: 0.5,
        max_z: 0.5,
    };
}

/// Placement of one voxel cube.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoxelInstance {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl VoxelInstance {
    pub fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// Object-to-world transform as the 3×4 row-major matrix the TLAS expects.
    pub fn transform(&self) -> vk::TransformMatrixKHR {
        let m = Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position);
        let mut matrix = [0.0_f32; 12];
        for (row, chunk) in matrix.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&m.row(row).to_array());
        }
        vk::TransformMatrixKHR { matrix }
    }

    /// Append this instance's descriptor to `out`.
    ///
    /// Layout: transform, custom index (24 bits) and mask (8), SBT record
    /// offset (24) and flags (8), then the BLAS device address.
    fn encode(&self, custom_index: u32, blas_address: vk::DeviceAddress, out: &mut Vec<u8>) {
        for value in self.transform().matrix {
            out.extend_from_slice(&value.to_ne_bytes());
        }
        let mask = 0xFF_u32;
        out.extend_from_slice(&((custom_index & 0x00FF_FFFF) | (mask << 24)).to_ne_bytes());
        let flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() & 0xFF;
        out.extend_from_slice(&(flags << 24).to_ne_bytes());
        out.extend_from_slice(&blas_address.to_ne_bytes());
    }
}

/// Instance descriptors ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStaging {
    pub bytes: Vec<u8>,
    pub count: u32,
}

impl InstanceStaging {
    /// BLAS reference stored in descriptor `index`.
    pub fn reference(&self, index: usize) -> Option<vk::DeviceAddress> {
        let start = index * INSTANCE_DESCRIPTOR_SIZE + INSTANCE_REFERENCE_OFFSET;
        let bytes = self.bytes.get(start..start + 8)?;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }
}

/// The flat instance list and its dirty flag.
#[derive(Debug, Default)]
pub struct VoxelScene {
    instances: Vec<VoxelInstance>,
    dirty: bool,
}

impl VoxelScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a voxel. Inputs are not validated.
    pub fn add_voxel(&mut self, position: Vec3, rotation: Quat, scale: Vec3) {
        self.instances
            .push(VoxelInstance::new(position, rotation, scale));
        self.dirty = true;
    }

    pub fn instances(&self) -> &[VoxelInstance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Whether instances were added since the last successful build.
    pub fn is_rebuild_needed(&self) -> bool {
        self.dirty
    }

    /// Encode every instance against the given BLAS address.
    pub fn stage(&self, blas_address: vk::DeviceAddress) -> Result<InstanceStaging> {
        let count = u32::try_from(self.instances.len())
            .map_err(|_| GpuError::InvalidState("Too many voxel instances".to_string()))?;
        let mut bytes = Vec::with_capacity(self.instances.len() * INSTANCE_DESCRIPTOR_SIZE);
        for (index, instance) in (0_u32..).zip(&self.instances) {
            instance.encode(index, blas_address, &mut bytes);
        }
        Ok(InstanceStaging { bytes, count })
    }

    pub fn mark_built(&mut self) {
        self.dirty = false;
    }
}

/// A built acceleration structure and its backing storage.
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: GpuBuffer,
    pub device_address: vk::DeviceAddress,
}

impl AccelerationStructure {
    /// Destroy the structure and free its buffer. The GPU must be done with it.
    fn destroy(mut self, gpu: &GpuContext) -> Result<()> {
        // SAFETY: Caller guarantees no pending work references the structure
        unsafe {
            gpu.acceleration_structure_fn()
                .destroy_acceleration_structure(self.handle, None);
        }
        gpu.allocator().lock().free_buffer(&mut self.buffer)
    }
}

fn aabb_geometry(address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::AABBS)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: address,
                })
                .stride(std::mem::size_of::<AabbPositions>() as u64),
        })
}

fn instance_geometry(address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: address,
                }),
        })
}

/// Create and synchronously build one acceleration structure.
///
/// Scratch memory is allocated for this build only and freed after the
/// build has completed on the GPU.
fn build_structure(
    gpu: &GpuContext,
    ty: vk::AccelerationStructureTypeKHR,
    geometry: &vk::AccelerationStructureGeometryKHR<'_>,
    primitive_count: u32,
    name: &str,
) -> Result<AccelerationStructure> {
    let as_fn = gpu.acceleration_structure_fn();
    let device = gpu.device();

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(ty)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(std::slice::from_ref(geometry));

    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    // SAFETY: Geometry addresses are valid device addresses
    unsafe {
        as_fn.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
            &mut sizes,
        );
    }

    let scratch_alignment = u64::from(gpu.capabilities().ray_tracing.min_scratch_offset_alignment);
    let (mut buffer, mut scratch) = {
        let mut allocator = gpu.allocator().lock();
        let buffer = allocator.create_buffer(
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
            MemoryLocation::GpuOnly,
            name,
        )?;
        let scratch = allocator.create_buffer(
            sizes.build_scratch_size.max(1) + scratch_alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
            &format!("{name}_scratch"),
        );
        match scratch {
            Ok(scratch) => (buffer, scratch),
            Err(e) => {
                let mut buffer = buffer;
                allocator.free_buffer(&mut buffer)?;
                return Err(e);
            }
        }
    };

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer.buffer)
        .size(sizes.acceleration_structure_size)
        .ty(ty);

    // SAFETY: Backing buffer has ACCELERATION_STRUCTURE_STORAGE usage and the reported size
    let created = unsafe { as_fn.create_acceleration_structure(&create_info, None) };
    let handle = match created {
        Ok(handle) => handle,
        Err(e) => {
            let mut allocator = gpu.allocator().lock();
            allocator.free_buffer(&mut scratch)?;
            allocator.free_buffer(&mut buffer)?;
            return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
        }
    };

    build_info = build_info
        .dst_acceleration_structure(handle)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch.aligned_device_address(device, scratch_alignment),
        });
    let range = vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(primitive_count);

    let built = execute_one_time_commands(gpu, |cmd| {
        // SAFETY: Inputs, scratch and destination stay alive until the submission completes
        unsafe {
            as_fn.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&range)],
            );
        }
        Ok(())
    });

    gpu.allocator().lock().free_buffer(&mut scratch)?;

    let mut structure = AccelerationStructure {
        handle,
        buffer,
        device_address: 0,
    };
    if let Err(e) = built {
        structure.destroy(gpu)?;
        return Err(e);
    }

    let address_info =
        vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
    // SAFETY: Structure was just built
    structure.device_address = unsafe { as_fn.get_acceleration_structure_device_address(&address_info) };

    tracing::debug!(
        name,
        primitive_count,
        size = sizes.acceleration_structure_size,
        scratch = sizes.build_scratch_size,
        "Acceleration structure built"
    );
    Ok(structure)
}

/// Owns the voxel BLAS, the TLAS and the instance list feeding it.
///
/// Call [`is_rebuild_needed`](Self::is_rebuild_needed) and
/// [`rebuild`](Self::rebuild) before recording any command buffer that reads
/// the TLAS. Resources are released by [`destroy`](Self::destroy).
pub struct AccelerationStructureManager {
    scene: VoxelScene,
    geometry: Option<GpuBuffer>,
    blas: Option<AccelerationStructure>,
    instance_buffer: Option<GpuBuffer>,
    tlas: Option<AccelerationStructure>,
    instance_count: u32,
}

impl Default for AccelerationStructureManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AccelerationStructureManager {
    /// An empty manager. Nothing is allocated until the first rebuild.
    pub fn new() -> Self {
        Self {
            scene: VoxelScene::new(),
            geometry: None,
            blas: None,
            instance_buffer: None,
            tlas: None,
            instance_count: 0,
        }
    }

    /// Queue a voxel for the next rebuild.
    pub fn add_voxel(&mut self, position: Vec3, rotation: Quat, scale: Vec3) {
        self.scene.add_voxel(position, rotation, scale);
    }

    /// Whether the TLAS is stale and must not be bound yet.
    pub fn is_rebuild_needed(&self) -> bool {
        self.scene.is_rebuild_needed()
    }

    pub fn scene(&self) -> &VoxelScene {
        &self.scene
    }

    /// TLAS handle, once built.
    pub fn tlas(&self) -> Option<vk::AccelerationStructureKHR> {
        self.tlas.as_ref().map(|tlas| tlas.handle)
    }

    /// BLAS device address, once built.
    pub fn blas_address(&self) -> Option<vk::DeviceAddress> {
        self.blas.as_ref().map(|blas| blas.device_address)
    }

    /// Instances in the current TLAS.
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Bytes of instance descriptors in the current TLAS.
    pub fn instance_buffer_size(&self) -> u64 {
        u64::from(self.instance_count) * INSTANCE_DESCRIPTOR_SIZE as u64
    }

    /// Host view of the instance descriptors of the current TLAS.
    pub fn instance_bytes(&self) -> Option<&[u8]> {
        let len = usize::try_from(self.instance_buffer_size()).ok()?;
        self.instance_buffer
            .as_ref()
            .and_then(GpuBuffer::mapped_slice)
            .and_then(|bytes| bytes.get(..len))
    }

    /// Rebuild the TLAS from every instance added so far.
    ///
    /// The BLAS is built on first use. Each build runs on the graphics queue
    /// and is waited on before returning. The previous TLAS is destroyed after
    /// the queue drains.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn rebuild(&mut self, gpu: &GpuContext) -> Result<()> {
        let max_instances = gpu.capabilities().ray_tracing.max_instance_count;
        if max_instances > 0 && self.scene.len() as u64 > max_instances {
            return Err(GpuError::InvalidState(format!(
                "{} voxel instances exceed the device limit of {max_instances}",
                self.scene.len()
            )));
        }

        if self.blas.is_none() {
            self.build_blas(gpu)?;
        }

        let blas_handle = self
            .blas
            .as_ref()
            .map(|blas| blas.handle)
            .ok_or_else(|| GpuError::InvalidState("BLAS missing after build".to_string()))?;
        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(blas_handle);
        // SAFETY: BLAS was built and is alive
        let blas_address = unsafe {
            gpu.acceleration_structure_fn()
                .get_acceleration_structure_device_address(&address_info)
        };

        let staging = self.scene.stage(blas_address)?;

        // In-flight frames may still trace against the old TLAS
        if self.tlas.is_some() || self.instance_buffer.is_some() {
            // SAFETY: Queue belongs to the live device
            unsafe { gpu.device().queue_wait_idle(gpu.graphics_queue())? };
            if let Some(old) = self.tlas.take() {
                old.destroy(gpu)?;
            }
            if let Some(mut old) = self.instance_buffer.take() {
                gpu.allocator().lock().free_buffer(&mut old)?;
            }
            self.instance_count = 0;
        }

        // Zero-sized buffers are invalid, keep one zeroed slot for an empty scene
        let size = staging.bytes.len().max(INSTANCE_DESCRIPTOR_SIZE) as u64;
        let mut instance_buffer = gpu.allocator().lock().create_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            MemoryLocation::CpuToGpu,
            "tlas_instances",
        )?;
        if let Err(e) = instance_buffer.write_bytes(0, &staging.bytes) {
            gpu.allocator().lock().free_buffer(&mut instance_buffer)?;
            return Err(e);
        }

        let geometry = instance_geometry(instance_buffer.device_address(gpu.device()));
        let tlas = build_structure(
            gpu,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &geometry,
            staging.count,
            "tlas",
        );
        let tlas = match tlas {
            Ok(tlas) => tlas,
            Err(e) => {
                gpu.allocator().lock().free_buffer(&mut instance_buffer)?;
                return Err(e);
            }
        };

        self.tlas = Some(tlas);
        self.instance_buffer = Some(instance_buffer);
        self.instance_count = staging.count;
        self.scene.mark_built();

        tracing::info!(instances = staging.count, "TLAS rebuilt");
        Ok(())
    }

    fn build_blas(&mut self, gpu: &GpuContext) -> Result<()> {
        let mut geometry_buffer = gpu.allocator().lock().create_buffer(
            std::mem::size_of::<AabbPositions>() as u64,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            MemoryLocation::CpuToGpu,
            "voxel_aabb",
        )?;

        let built = geometry_buffer
            .write_pod(0, &[AabbPositions::UNIT_CUBE])
            .and_then(|()| {
                let geometry = aabb_geometry(geometry_buffer.device_address(gpu.device()));
                build_structure(
                    gpu,
                    vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                    &geometry,
                    1,
                    "voxel_blas",
                )
            });

        match built {
            Ok(blas) => {
                self.blas = Some(blas);
                self.geometry = Some(geometry_buffer);
                Ok(())
            }
            Err(e) => {
                gpu.allocator().lock().free_buffer(&mut geometry_buffer)?;
                Err(e)
            }
        }
    }

    /// Destroy both structures and free the geometry, BLAS, instance and TLAS
    /// buffers. Waits for the device to go idle first.
    pub fn destroy(mut self, gpu: &GpuContext) -> Result<()> {
        gpu.wait_idle()?;

        if let Some(tlas) = self.tlas.take() {
            tlas.destroy(gpu)?;
        }
        if let Some(blas) = self.blas.take() {
            blas.destroy(gpu)?;
        }

        let mut allocator = gpu.allocator().lock();
        if let Some(mut buffer) = self.instance_buffer.take() {
            allocator.free_buffer(&mut buffer)?;
        }
        if let Some(mut buffer) = self.geometry.take() {
            allocator.free_buffer(&mut buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    fn assert_matrix_eq(actual: vk::TransformMatrixKHR, expected: [f32; 12]) {
        for (a, e) in actual.matrix.iter().zip(expected) {
            assert_relative_eq!(*a, e, epsilon = 1e-6);
        }
    }

    #[test]
    fn descriptor_layout_matches_vulkan() {
        assert_eq!(
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            INSTANCE_DESCRIPTOR_SIZE
        );
        assert_eq!(std::mem::size_of::<AabbPositions>(), 24);
    }

    #[test]
    fn identity_transform() {
        let instance = VoxelInstance::new(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE);
        assert_matrix_eq(
            instance.transform(),
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        );
    }

    #[test]
    fn translation_lands_in_last_column() {
        let instance = VoxelInstance::new(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY, Vec3::splat(2.0));
        assert_matrix_eq(
            instance.transform(),
            [2.0, 0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 2.0, 0.0, 0.0, 2.0, 3.0],
        );
    }

    #[test]
    fn rotation_is_row_major() {
        // +90° about Z maps +X to +Y
        let instance = VoxelInstance::new(Vec3::ZERO, Quat::from_rotation_z(FRAC_PI_2), Vec3::ONE);
        assert_matrix_eq(
            instance.transform(),
            [0.0, -1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        );
    }

    #[test]
    fn add_voxel_marks_dirty() {
        let mut scene = VoxelScene::new();
        assert!(!scene.is_rebuild_needed());
        scene.add_voxel(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE);
        assert!(scene.is_rebuild_needed());
        scene.mark_built();
        assert!(!scene.is_rebuild_needed());
    }

    #[test]
    fn staging_holds_one_descriptor_per_voxel() {
        let blas_address = 0xDEAD_BEEF_0000_1000;
        let mut scene = VoxelScene::new();
        for i in 0..5 {
            scene.add_voxel(Vec3::new(i as f32, 0.0, 0.0), Quat::IDENTITY, Vec3::ONE);
        }

        let staging = scene.stage(blas_address).unwrap();
        assert_eq!(staging.count, 5);
        assert_eq!(staging.bytes.len(), 5 * INSTANCE_DESCRIPTOR_SIZE);
        for i in 0..5 {
            assert_eq!(staging.reference(i), Some(blas_address));
        }
        assert_eq!(staging.reference(5), None);
    }

    #[test]
    fn descriptor_fields_are_packed() {
        let mut scene = VoxelScene::new();
        scene.add_voxel(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE);
        scene.add_voxel(Vec3::new(4.0, 5.0, 6.0), Quat::IDENTITY, Vec3::ONE);
        let staging = scene.stage(42).unwrap();

        let second = &staging.bytes[INSTANCE_DESCRIPTOR_SIZE..];
        let translation_x = f32::from_ne_bytes(second[12..16].try_into().unwrap());
        assert_relative_eq!(translation_x, 4.0);

        let index_and_mask = u32::from_ne_bytes(second[48..52].try_into().unwrap());
        assert_eq!(index_and_mask & 0x00FF_FFFF, 1);
        assert_eq!(index_and_mask >> 24, 0xFF);

        let offset_and_flags = u32::from_ne_bytes(second[52..56].try_into().unwrap());
        assert_eq!(offset_and_flags & 0x00FF_FFFF, 0);
        assert_eq!(
            offset_and_flags >> 24,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
    }

    #[test]
    fn empty_scene_stages_nothing() {
        let scene = VoxelScene::new();
        let staging = scene.stage(7).unwrap();
        assert_eq!(staging.count, 0);
        assert!(staging.bytes.is_empty());
    }

    #[test]
    fn encoding_matches_ash_struct() {
        let instance = VoxelInstance::new(Vec3::new(1.0, -2.0, 0.5), Quat::from_rotation_y(0.3), Vec3::ONE);
        let mut bytes = Vec::new();
        instance.encode(9, 0x1000, &mut bytes);

        let reference = vk::AccelerationStructureInstanceKHR {
            transform: instance.transform(),
            instance_custom_index_and_mask: vk::Packed24_8::new(9, 0xFF),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: 0x1000,
            },
        };
        // SAFETY: Plain repr(C) struct without padding
        let raw = unsafe {
            std::slice::from_raw_parts(
                std::ptr::addr_of!(reference).cast::<u8>(),
                INSTANCE_DESCRIPTOR_SIZE,
            )
        };
        assert_eq!(bytes.as_slice(), raw);
    }

    fn test_gpu() -> GpuContext {
        voxray_gpu::GpuContextBuilder::new()
            .app_name("voxray-rt-test")
            .validation(false)
            .build()
            .unwrap()
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn rebuild_uploads_every_instance() {
        let gpu = test_gpu();
        let mut manager = AccelerationStructureManager::new();
        for i in 0..7 {
            manager.add_voxel(Vec3::new(i as f32, 0.0, 0.0), Quat::IDENTITY, Vec3::ONE);
        }
        assert!(manager.is_rebuild_needed());

        manager.rebuild(&gpu).unwrap();
        assert!(!manager.is_rebuild_needed());
        assert_eq!(manager.instance_count(), 7);
        assert_eq!(manager.instance_buffer_size(), 7 * INSTANCE_DESCRIPTOR_SIZE as u64);

        let blas = manager.blas_address().unwrap();
        let bytes = manager.instance_bytes().unwrap();
        for chunk in bytes.chunks_exact(INSTANCE_DESCRIPTOR_SIZE) {
            let reference = u64::from_ne_bytes(
                chunk[INSTANCE_REFERENCE_OFFSET..].try_into().unwrap(),
            );
            assert_eq!(reference, blas);
        }

        manager.destroy(&gpu).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn rebuild_with_no_instances() {
        let gpu = test_gpu();
        let mut manager = AccelerationStructureManager::new();
        manager.rebuild(&gpu).unwrap();
        assert!(!manager.is_rebuild_needed());
        assert!(manager.tlas().is_some());
        assert_eq!(manager.instance_count(), 0);
        assert_eq!(manager.instance_bytes().map(<[u8]>::len), Some(0));
        manager.destroy(&gpu).unwrap();
    }
}
