//! Viewer application: a growing voxel grid under an orbit camera.

use glam::{Quat, Vec3};
use tracing::{info, warn};
use winit::event::{ElementState, KeyEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

use voxray_app::{AppContext, Camera, RayTraceApp, WindowEvent};

use crate::options::ViewerOptions;

/// Seconds between two grid rows appearing.
const ROW_INTERVAL: f32 = 0.15;

/// Orbit angular speed in radians per second.
const ORBIT_SPEED: f32 = 0.35;

/// Placement of one grid voxel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridVoxel {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

/// Column height at grid cell `(x, z)`: a gentle wave between 1 and 4.
fn column_height(x: u32, z: u32) -> u32 {
    let wave = ((x as f32 * 0.6).sin() + (z as f32 * 0.45).cos()) * 0.5;
    1 + ((wave + 1.0) * 1.5).round() as u32
}

/// Voxels of grid row `z`, centered on the origin.
pub fn grid_row(size: u32, z: u32) -> Vec<GridVoxel> {
    let half = size as f32 * 0.5 - 0.5;
    let mut voxels = Vec::new();
    for x in 0..size {
        for y in 0..column_height(x, z) {
            voxels.push(GridVoxel {
                position: Vec3::new(x as f32 - half, y as f32, z as f32 - half),
                rotation: Quat::from_rotation_y((x + z) as f32 * 0.1),
                scale: Vec3::splat(0.9),
            });
        }
    }
    voxels
}

/// Camera position on a circle of `radius` around `center`, `height` above it.
pub fn orbit_position(center: Vec3, radius: f32, height: f32, angle: f32) -> Vec3 {
    center + Vec3::new(radius * angle.cos(), height, radius * angle.sin())
}

/// Viewer application state.
pub struct Viewer {
    camera: Camera,
    grid: u32,
    rows_added: u32,
    row_timer: f32,
    orbit_angle: f32,
    orbit_paused: bool,
}

impl Viewer {
    fn orbit_radius(&self) -> f32 {
        self.grid as f32 * 1.2 + 4.0
    }

    fn place_camera(&mut self) {
        let radius = self.orbit_radius();
        self.camera.position = orbit_position(Vec3::ZERO, radius, radius * 0.6, self.orbit_angle);
        self.camera.look_at(Vec3::new(0.0, 1.0, 0.0));
    }

    fn add_row(&mut self, ctx: &mut AppContext) {
        for voxel in grid_row(self.grid, self.rows_added) {
            ctx.accel.add_voxel(voxel.position, voxel.rotation, voxel.scale);
        }
        self.rows_added += 1;
        if self.rows_added == self.grid {
            info!(voxels = ctx.accel.scene().len(), "Grid complete");
        }
    }
}

impl RayTraceApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let options = ViewerOptions::from_args().unwrap_or_else(|e| {
            warn!("{e}, using defaults");
            ViewerOptions::default()
        });
        info!(grid = options.grid, "Voxel grid");

        let mut viewer = Self {
            camera: Camera::default(),
            grid: options.grid,
            rows_added: 0,
            row_timer: 0.0,
            orbit_angle: 0.0,
            orbit_paused: false,
        };
        viewer.camera.set_viewport(ctx.width(), ctx.height());
        viewer.camera.far = viewer.orbit_radius() * 4.0;
        viewer.place_camera();
        viewer.add_row(ctx);
        Ok(viewer)
    }

    fn update(&mut self, ctx: &mut AppContext, dt: f32) -> anyhow::Result<()> {
        if self.rows_added < self.grid {
            self.row_timer += dt;
            if self.row_timer >= ROW_INTERVAL {
                self.row_timer -= ROW_INTERVAL;
                self.add_row(ctx);
            }
        }

        if !self.orbit_paused {
            self.orbit_angle = (self.orbit_angle + ORBIT_SPEED * dt) % std::f32::consts::TAU;
            self.place_camera();
        }
        Ok(())
    }

    fn camera(&self) -> &Camera {
        &self.camera
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        self.camera.set_viewport(width, height);
        Ok(())
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        if let WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(KeyCode::Space),
                    state: ElementState::Pressed,
                    repeat: false,
                    ..
                },
            ..
        } = event
        {
            self.orbit_paused = !self.orbit_paused;
            info!(paused = self.orbit_paused, "Orbit toggled");
            return true;
        }
        false
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        info!(
            voxels = ctx.accel.scene().len(),
            frames = ctx.frame_count,
            "Viewer shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn column_heights_stay_in_range() {
        for x in 0..32 {
            for z in 0..32 {
                let h = column_height(x, z);
                assert!((1..=4).contains(&h), "height {h} at ({x}, {z})");
            }
        }
    }

    #[test]
    fn grid_row_is_centered() {
        let size = 4;
        let row = grid_row(size, 0);
        assert!(row.len() >= size as usize);

        let xs: Vec<f32> = row.iter().filter(|v| v.position.y == 0.0).map(|v| v.position.x).collect();
        assert_eq!(xs, vec![-1.5, -0.5, 0.5, 1.5]);
        assert!(row.iter().all(|v| v.position.z == -1.5));
    }

    #[test]
    fn orbit_keeps_radius_and_height() {
        let center = Vec3::new(1.0, 0.0, -2.0);
        for step in 0..8 {
            let p = orbit_position(center, 5.0, 3.0, step as f32 * 0.8);
            let flat = Vec3::new(p.x - center.x, 0.0, p.z - center.z);
            assert_relative_eq!(flat.length(), 5.0, epsilon = 1e-5);
            assert_relative_eq!(p.y, 3.0);
        }
    }
}
