//! `RayTraceApp` trait definition.

use crate::context::AppContext;
use voxray_rt::Camera;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

/// Trait for Voxray applications.
///
/// The framework owns the window, the GPU context, the swapchain, the
/// acceleration structures and the ray tracing pipeline. Applications add
/// voxels through [`AppContext::accel`] and provide a camera; the frame
/// driver rebuilds the TLAS, traces, blits and presents.
pub trait RayTraceApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the GPU context, swapchain and pipeline exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before acquiring. Voxels added here are visible
    /// in the same frame.
    fn update(&mut self, ctx: &mut AppContext, dt: f32) -> anyhow::Result<()>;

    /// Camera used for this frame's trace.
    fn camera(&self) -> &Camera;

    /// Handle window resize, after the swapchain and output image were
    /// recreated.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events. Return `true` to stop further processing.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle device events (raw input).
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Cleanup before shutdown. The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
