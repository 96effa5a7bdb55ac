//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// Device extensions the renderer cannot run without.
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 4] = [
    ash::khr::swapchain::NAME,
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Ray tracing limits that drive SBT layout and acceleration structure sizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// Size in bytes of one shader group handle.
    pub shader_group_handle_size: u32,
    /// Required alignment of each SBT record.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each SBT region start address.
    pub shader_group_base_alignment: u32,
    /// Maximum trace recursion depth.
    pub max_ray_recursion_depth: u32,
    /// Required alignment of acceleration structure scratch addresses.
    pub min_scratch_offset_alignment: u32,
    /// Maximum number of instances in a top-level structure.
    pub max_instance_count: u64,
}

impl RayTracingCapabilities {
    /// Query ray tracing properties.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_properties)
            .push_next(&mut as_properties);
        // SAFETY: Caller guarantees the handles are valid
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };

        Self {
            shader_group_handle_size: rt_properties.shader_group_handle_size,
            shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
            shader_group_base_alignment: rt_properties.shader_group_base_alignment,
            max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
            min_scratch_offset_alignment: as_properties
                .min_acceleration_structure_scratch_offset_alignment,
            max_instance_count: as_properties.max_instance_count,
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Synchronization2 support (VK 1.3 core)
    pub supports_synchronization2: bool,
    /// Buffer device address support
    pub supports_buffer_device_address: bool,
    /// `accelerationStructure` feature
    pub supports_acceleration_structure: bool,
    /// `rayTracingPipeline` feature
    pub supports_ray_tracing_pipeline: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// Ray tracing limits (zeroed when the extension is absent)
    pub ray_tracing: RayTracingCapabilities,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        // SAFETY: Caller guarantees the handles are valid
        let (properties, memory_properties, extensions) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
                instance
                    .enumerate_device_extension_properties(physical_device)
                    .unwrap_or_default(),
            )
        };

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .filter_map(|name| name.to_str().ok().map(String::from))
            .collect();

        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let has_rt_extensions = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .all(|ext| ext.to_str().is_ok_and(|e| available_extensions.contains(e)));

        // Feature structs for extensions the device lacks must not be chained
        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default();
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut vulkan_1_2_features)
                .push_next(&mut vulkan_1_3_features);
            if has_rt_extensions {
                features2 = features2.push_next(&mut as_features).push_next(&mut rt_features);
            }
            // SAFETY: Caller guarantees the handles are valid
            unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        }

        let ray_tracing = if has_rt_extensions {
            // SAFETY: Caller guarantees the handles are valid
            unsafe { RayTracingCapabilities::query(instance, physical_device) }
        } else {
            RayTracingCapabilities {
                shader_group_handle_size: 0,
                shader_group_handle_alignment: 0,
                shader_group_base_alignment: 0,
                max_ray_recursion_depth: 0,
                min_scratch_offset_alignment: 0,
                max_instance_count: 0,
            }
        };

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            supports_synchronization2: vulkan_1_3_features.synchronization2 == vk::TRUE,
            supports_buffer_device_address: vulkan_1_2_features.buffer_device_address
                == vk::TRUE,
            supports_acceleration_structure: as_features.acceleration_structure == vk::TRUE,
            supports_ray_tracing_pipeline: rt_features.ray_tracing_pipeline == vk::TRUE,
            device_local_memory_mb,
            ray_tracing,
            available_extensions,
        }
    }

    /// Names of every requirement this device fails, empty when it is usable.
    pub fn missing_requirements(&self) -> Vec<String> {
        let mut missing = Vec::new();

        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);
        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            missing.push("Vulkan 1.3".to_string());
        }

        for ext in REQUIRED_DEVICE_EXTENSIONS {
            let name = ext.to_string_lossy();
            if !self.available_extensions.contains(name.as_ref()) {
                missing.push(name.into_owned());
            }
        }

        let features = [
            (self.supports_synchronization2, "synchronization2"),
            (self.supports_buffer_device_address, "bufferDeviceAddress"),
            (self.supports_acceleration_structure, "accelerationStructure"),
            (self.supports_ray_tracing_pipeline, "rayTracingPipeline"),
        ];
        missing.extend(
            features
                .iter()
                .filter(|(supported, _)| !supported)
                .map(|(_, name)| (*name).to_string()),
        );

        missing
    }

    /// Check if the GPU meets minimum requirements for the renderer.
    pub fn meets_requirements(&self) -> bool {
        self.missing_requirements().is_empty()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - SBT handle {}B/{}B align, base {}B",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.ray_tracing.shader_group_handle_size,
            self.ray_tracing.shader_group_handle_alignment,
            self.ray_tracing.shader_group_base_alignment,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtx_capabilities() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "Test RTX".to_string(),
            api_version: vk::API_VERSION_1_3,
            driver_version: 0,
            supports_synchronization2: true,
            supports_buffer_device_address: true,
            supports_acceleration_structure: true,
            supports_ray_tracing_pipeline: true,
            device_local_memory_mb: 8192,
            ray_tracing: RayTracingCapabilities {
                shader_group_handle_size: 32,
                shader_group_handle_alignment: 32,
                shader_group_base_alignment: 64,
                max_ray_recursion_depth: 31,
                min_scratch_offset_alignment: 128,
                max_instance_count: 1 << 24,
            },
            available_extensions: REQUIRED_DEVICE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string_lossy().into_owned())
                .collect(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn complete_device_meets_requirements() {
        let caps = rtx_capabilities();
        assert!(caps.missing_requirements().is_empty());
        assert!(caps.meets_requirements());
    }

    #[test]
    fn missing_deferred_host_operations_is_reported() {
        let mut caps = rtx_capabilities();
        caps.available_extensions.remove("VK_KHR_deferred_host_operations");

        assert_eq!(
            caps.missing_requirements(),
            vec!["VK_KHR_deferred_host_operations".to_string()]
        );
        assert!(!caps.meets_requirements());
    }

    #[test]
    fn missing_features_are_reported_by_name() {
        let mut caps = rtx_capabilities();
        caps.supports_ray_tracing_pipeline = false;
        caps.supports_buffer_device_address = false;

        let missing = caps.missing_requirements();
        assert!(missing.contains(&"rayTracingPipeline".to_string()));
        assert!(missing.contains(&"bufferDeviceAddress".to_string()));
        assert_eq!(missing.len(), 2);
    }

    #[test]
    fn old_api_version_is_rejected() {
        let mut caps = rtx_capabilities();
        caps.api_version = vk::API_VERSION_1_2;
        assert_eq!(caps.missing_requirements(), vec!["Vulkan 1.3".to_string()]);
    }
}
