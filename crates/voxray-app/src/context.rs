//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use voxray_gpu::{Frame, GpuContext, SurfaceContext, VulkanPresentBackend, VulkanSwapchain};
use voxray_rt::{AccelerationStructureManager, CameraUniforms, RayTracePipeline, ShaderSet};
use winit::window::Window;

use crate::config::AppConfig;
use crate::hooks::{record_clear, PresentLayoutHooks};
use crate::shaders::load_shader_set;

/// Background shown until the first TLAS exists.
const CLEAR_COLOR: [f32; 4] = [0.05, 0.05, 0.08, 1.0];

/// Application context shared across all app methods.
///
/// Field order matters: everything that holds device objects is declared
/// before `gpu` so it drops first.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// Swapchain and per-frame synchronization.
    pub swapchain: VulkanSwapchain,
    /// Voxel instances and the acceleration structures built from them.
    pub accel: AccelerationStructureManager,
    pipeline: RayTracePipeline,
    shaders: ShaderSet,
    /// Frames presented so far.
    pub frame_count: u64,
    pub(crate) last_frame_time: Instant,
    /// GPU context with device and queues.
    pub gpu: GpuContext,
}

impl AppContext {
    /// Create the surface, swapchain and ray tracing pipeline for `window`.
    ///
    /// # Safety
    /// The window must have valid handles and outlive the context.
    pub(crate) unsafe fn new(window: Arc<Window>, gpu: GpuContext, config: &AppConfig) -> anyhow::Result<Self> {
        // SAFETY: Caller guarantees the window has valid handles
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };
        let backend = VulkanPresentBackend::new(&gpu, surface)?;

        let size = window.inner_size();
        let settings = config.swapchain_settings(size.width.max(1), size.height.max(1));
        let swapchain = VulkanSwapchain::new(backend, settings)?
            .with_hooks(PresentLayoutHooks::new(gpu.device_handle()));

        let shaders = load_shader_set(&config.shader_dir)?;
        let pipeline = RayTracePipeline::new(
            &gpu,
            &shaders,
            swapchain.extent(),
            swapchain.frames_in_flight(),
        )?;

        tracing::info!(
            width = swapchain.extent().width,
            height = swapchain.extent().height,
            images = swapchain.frame_count(),
            frames_in_flight = swapchain.frames_in_flight(),
            present_mode = ?swapchain.present_mode(),
            "Swapchain ready"
        );

        Ok(Self {
            window,
            swapchain,
            accel: AccelerationStructureManager::new(),
            pipeline,
            shaders,
            frame_count: 0,
            last_frame_time: Instant::now(),
            gpu,
        })
    }

    /// Get the current swapchain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn width(&self) -> u32 {
        self.extent().width
    }

    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Get the number of in-flight slots.
    pub fn frames_in_flight(&self) -> usize {
        self.swapchain.frames_in_flight()
    }

    /// Rebuild the TLAS and point the pipeline at it.
    pub(crate) fn rebuild_scene(&mut self) -> anyhow::Result<()> {
        self.accel.rebuild(&self.gpu)?;
        if let Some(tlas) = self.accel.tlas() {
            self.pipeline.bind_tlas(&self.gpu, tlas);
        }
        Ok(())
    }

    /// Recreate the swapchain and the output image for a new window size.
    ///
    /// Returns `false` when the resize was deferred (minimized window).
    pub(crate) fn recreate_swapchain(&mut self, width: u32, height: u32) -> anyhow::Result<bool> {
        if !self.swapchain.resize(width, height)? {
            return Ok(false);
        }

        let extent = self.swapchain.extent();
        let slots = self.swapchain.frames_in_flight();
        if slots == self.pipeline.slot_count() {
            self.pipeline.resize(&self.gpu, extent)?;
        } else {
            let mut pipeline = RayTracePipeline::new(&self.gpu, &self.shaders, extent, slots)?;
            if let Some(tlas) = self.accel.tlas() {
                pipeline.bind_tlas(&self.gpu, tlas);
            }
            std::mem::replace(&mut self.pipeline, pipeline).destroy(&self.gpu)?;
        }

        tracing::info!(
            width = extent.width,
            height = extent.height,
            images = self.swapchain.frame_count(),
            "Swapchain recreated"
        );
        Ok(true)
    }

    /// Record the trace and blit for an acquired frame.
    ///
    /// Without a current TLAS the image is cleared instead.
    pub(crate) fn record_frame(&mut self, frame: &Frame, camera: &CameraUniforms) -> voxray_gpu::Result<()> {
        let device = self.gpu.device();
        if self.accel.tlas().is_none() || self.accel.is_rebuild_needed() {
            // SAFETY: Acquired frames are recording
            unsafe { record_clear(device, frame.command_buffer, frame.image, CLEAR_COLOR) };
            return Ok(());
        }

        // SAFETY: Acquired frames are recording and their slot's fence has signaled
        unsafe {
            self.pipeline
                .record(&self.gpu, frame.command_buffer, frame.slot, camera)?;
            self.pipeline
                .record_blit(self.gpu.device(), frame.command_buffer, frame.image, frame.extent);
        }
        Ok(())
    }

    /// Tear everything down in dependency order.
    pub(crate) fn destroy(self) -> anyhow::Result<()> {
        let Self {
            window,
            swapchain,
            accel,
            pipeline,
            gpu,
            ..
        } = self;

        let pipeline_result = pipeline.destroy(&gpu);
        let accel_result = accel.destroy(&gpu);
        drop(swapchain);
        drop(gpu);
        drop(window);

        pipeline_result?;
        accel_result?;
        Ok(())
    }
}
