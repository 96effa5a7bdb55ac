//! Frame driver and application framework for the Voxray renderer.
//!
//! This crate handles the boilerplate around the renderer core:
//! - Window creation and the winit event loop
//! - GPU context, swapchain and ray tracing pipeline setup
//! - The per-frame acquire, record, submit and present cycle
//! - Swapchain recreation on resize or invalidation
//! - Logging initialization
//!
//! # Example
//!
//! ```no_run
//! use voxray_app::{run_app, AppConfig, AppContext, Camera, RayTraceApp};
//! use glam::{Quat, Vec3};
//!
//! struct MyApp {
//!     camera: Camera,
//! }
//!
//! impl RayTraceApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         ctx.accel.add_voxel(Vec3::ZERO, Quat::IDENTITY, Vec3::ONE);
//!         Ok(MyApp { camera: Camera::default() })
//!     }
//!
//!     fn update(&mut self, _ctx: &mut AppContext, _dt: f32) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn camera(&self) -> &Camera {
//!         &self.camera
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod config;
mod context;
mod hooks;
mod runner;
mod shaders;

pub use app::RayTraceApp;
pub use config::AppConfig;
pub use context::AppContext;
pub use hooks::{record_clear, PresentLayoutHooks};
pub use runner::{init_logging, run_app, FrameStats};
pub use shaders::load_shader_set;

pub use voxray_gpu::{GpuContext, GpuContextBuilder};
pub use voxray_rt::Camera;
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
