//! Application configuration.

use std::path::PathBuf;
use std::time::Duration;

use ash::vk;
use voxray_gpu::SwapchainSettings;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title, also used as the Vulkan application name.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Prefer FIFO presentation over MAILBOX.
    pub vsync: bool,
    /// In-flight slot limit (None for one slot per swapchain image).
    pub frames_in_flight: Option<usize>,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Directory holding the compiled ray tracing shaders.
    pub shader_dir: PathBuf,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Voxray".to_string(),
            width: 1280,
            height: 720,
            vsync: false,
            frames_in_flight: None,
            validation: cfg!(debug_assertions),
            shader_dir: PathBuf::from("shaders"),
            target_fps: None,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    #[must_use]
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Cap the number of in-flight slots. Clamped to the swapchain image count.
    #[must_use]
    pub fn with_frames_in_flight(mut self, count: usize) -> Self {
        self.frames_in_flight = Some(count);
        self
    }

    #[must_use]
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    #[must_use]
    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Preferred present mode.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        if self.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            vk::PresentModeKHR::MAILBOX
        }
    }

    /// Swapchain settings for a window of the given size.
    pub fn swapchain_settings(&self, width: u32, height: u32) -> SwapchainSettings {
        let settings = SwapchainSettings::new(width, height).present_mode(self.present_mode());
        match self.frames_in_flight {
            Some(count) => settings.frames_in_flight(count),
            None => settings,
        }
    }

    /// Minimum frame duration for pacing. Zero targets mean unlimited.
    pub fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}
