//! Vulkan instance creation and physical device selection.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Required instance extensions for windowed rendering.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
    ]
}

/// Validation layer enabled when requested.
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Voxray")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names: Vec<*const std::ffi::c_char> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    // Only request the validation layer if the loader knows about it
    let mut layer_names = Vec::new();
    if enable_validation {
        // SAFETY: Caller guarantees entry is valid
        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let found = available_layers
            .iter()
            .any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        if found {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!(
                "Validation layer {} not available",
                VALIDATION_LAYER.to_string_lossy()
            );
        }
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names);

    // SAFETY: Caller guarantees entry is valid, create info outlives the call
    let instance = unsafe { entry.create_instance(&create_info, None)? };

    Ok(instance)
}

/// Select the best ray tracing capable physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    // SAFETY: Caller guarantees instance is valid
    let devices = unsafe { instance.enumerate_physical_devices()? };

    let mut best: Option<(vk::PhysicalDevice, i32)> = None;
    let mut rejected = Vec::new();

    for device in devices {
        // SAFETY: Device was enumerated from this instance
        let capabilities = unsafe { GpuCapabilities::query(instance, device) };
        let missing = capabilities.missing_requirements();
        if !missing.is_empty() {
            rejected.push(format!("{}: missing {}", capabilities.device_name, missing.join(", ")));
            continue;
        }

        // SAFETY: Device was enumerated from this instance
        let score = unsafe { score_physical_device(instance, device, &capabilities) };
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((device, score));
        }
    }

    match best {
        Some((device, _)) => Ok(device),
        None => {
            for reason in &rejected {
                tracing::error!("Rejected GPU {reason}");
            }
            match rejected.first() {
                Some(reason) => Err(GpuError::ExtensionNotSupported(reason.clone())),
                None => Err(GpuError::NoSuitableDevice),
            }
        }
    }
}

/// Score a physical device that already meets the requirements.
unsafe fn score_physical_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    capabilities: &GpuCapabilities,
) -> i32 {
    // SAFETY: Caller guarantees handles are valid
    let properties = unsafe { instance.get_physical_device_properties(device) };

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    // +1 per GB of VRAM
    score += i32::try_from(capabilities.device_local_memory_mb / 1024).unwrap_or(i32::MAX / 2);

    score
}
