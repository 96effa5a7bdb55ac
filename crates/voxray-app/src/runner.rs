//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use voxray_gpu::{AcquireOutcome, FrameStatus, GpuContextBuilder};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::RayTraceApp;
use crate::config::AppConfig;
use crate::context::AppContext;

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        debug!("Global subscriber already installed");
    }
}

/// Run a `RayTraceApp` with the given configuration.
///
/// Initializes logging, creates the window and GPU context and runs the
/// event loop until the window closes or a fatal error occurs. Fatal errors
/// (device loss, failed initialization) are returned.
pub fn run_app<A: RayTraceApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();
    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        fatal: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Frame-time statistics reported at shutdown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
    samples: u64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
            samples: 0,
        }
    }
}

impl FrameStats {
    /// Record one frame's delta time in seconds. Non-positive deltas are ignored.
    pub fn record(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        let fps = 1.0 / f64::from(dt);
        self.min_fps = self.min_fps.min(fps);
        self.max_fps = self.max_fps.max(fps);
        self.fps_sum += fps;
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// `(min, max, avg)` frames per second, if any frame was recorded.
    pub fn summary(&self) -> Option<(f64, f64, f64)> {
        (self.samples > 0).then(|| {
            (
                self.min_fps,
                self.max_fps,
                self.fps_sum / self.samples as f64,
            )
        })
    }
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner<A: RayTraceApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    fatal: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: RayTraceApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
    stats: FrameStats,
}

impl<A: RayTraceApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");
        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.fatal = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame() {
                    Ok(()) => state.ctx.window.request_redraw(),
                    Err(e) => {
                        error!("Fatal render error: {e:#}");
                        self.fatal = Some(e);
                        self.shutdown(event_loop);
                    }
                }
            }
            WindowEvent::Resized(size) => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.handle_resize(size) {
                    error!("Resize failed: {e:#}");
                    self.fatal = Some(e);
                    self.shutdown(event_loop);
                }
            }
            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, device_id: DeviceId, event: DeviceEvent) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: RayTraceApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build()?;
        info!("GPU: {}", gpu.capabilities().summary());

        // SAFETY: The window is kept alive by the context
        let mut ctx = unsafe { AppContext::new(window, gpu, &self.config)? };
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            ctx,
            app,
            target_frame_time: self.config.target_frame_time(),
            stats: FrameStats::default(),
        })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(state) = self.state.take() {
            if let Err(e) = state.cleanup() {
                error!("Cleanup failed: {e:#}");
            }
        }
        event_loop.exit();
    }
}

impl<A: RayTraceApp> AppState<A> {
    /// One tick: update, rebuild the TLAS if needed, acquire, record,
    /// submit and present.
    ///
    /// Invalidated frames trigger a swapchain rebuild and skipped frames are
    /// dropped. Only fatal errors are returned.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();
        let dt = frame_start
            .duration_since(self.ctx.last_frame_time)
            .as_secs_f32();
        self.ctx.last_frame_time = frame_start;
        self.stats.record(dt);

        self.app.update(&mut self.ctx, dt)?;

        if self.ctx.accel.is_rebuild_needed() {
            self.ctx.rebuild_scene()?;
        }

        if self.ctx.swapchain.needs_rebuild() && !self.recreate_swapchain()? {
            return Ok(());
        }

        let frame = match self.ctx.swapchain.acquire_next_frame()? {
            AcquireOutcome::Ready(frame) => frame,
            AcquireOutcome::Invalidated => {
                debug!("Acquire invalidated the swapchain");
                self.recreate_swapchain()?;
                return Ok(());
            }
            AcquireOutcome::Skipped => {
                debug!("Acquire skipped");
                return Ok(());
            }
        };

        let camera = self.app.camera().uniforms();
        if let Err(e) = self.ctx.record_frame(&frame, &camera) {
            // The frame still goes through submit so its fence signals
            warn!("Recording failed, presenting an incomplete frame: {e}");
        }

        let status = match self.ctx.swapchain.submit(&frame)? {
            FrameStatus::Presented => self.ctx.swapchain.present_frame()?,
            status => status,
        };

        match status {
            FrameStatus::Presented => self.ctx.frame_count += 1,
            FrameStatus::Invalidated => {
                debug!("Present invalidated the swapchain");
                self.recreate_swapchain()?;
            }
            FrameStatus::Skipped => debug!("Frame dropped"),
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    fn recreate_swapchain(&mut self) -> anyhow::Result<bool> {
        let size = self.ctx.window.inner_size();
        self.resize_to(size.width, size.height)
    }

    fn handle_resize(&mut self, size: PhysicalSize<u32>) -> anyhow::Result<()> {
        let extent = self.ctx.extent();
        if size.width == extent.width && size.height == extent.height && !self.ctx.swapchain.needs_rebuild() {
            return Ok(());
        }
        self.resize_to(size.width, size.height)?;
        Ok(())
    }

    fn resize_to(&mut self, width: u32, height: u32) -> anyhow::Result<bool> {
        if !self.ctx.recreate_swapchain(width, height)? {
            debug!(width, height, "Resize deferred");
            return Ok(false);
        }
        self.app.on_resize(&mut self.ctx, width, height)?;
        info!("Resized to {}x{}", width, height);
        Ok(true)
    }

    fn cleanup(mut self) -> anyhow::Result<()> {
        if let Some((min, max, avg)) = self.stats.summary() {
            info!("FPS Statistics:");
            info!("  Min: {min:.1}");
            info!("  Max: {max:.1}");
            info!("  Avg: {avg:.1}");
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }
        self.app.cleanup(&mut self.ctx);
        self.ctx.destroy()?;
        info!("Cleanup complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn empty_stats_have_no_summary() {
        assert!(FrameStats::default().summary().is_none());
    }

    #[test]
    fn stats_track_min_max_avg() {
        let mut stats = FrameStats::default();
        stats.record(0.01);
        stats.record(0.02);
        stats.record(0.0);

        let (min, max, avg) = stats.summary().unwrap();
        assert_eq!(stats.samples(), 2);
        assert_relative_eq!(min, 50.0, epsilon = 1e-3);
        assert_relative_eq!(max, 100.0, epsilon = 1e-3);
        assert_relative_eq!(avg, 75.0, epsilon = 1e-3);
    }
}
