//! Camera and the uniform block the ray generation shader reads.

use glam::{Mat4, Vec3};

/// Perspective camera.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Camera at `position` looking at `target`.
    pub fn looking_at(position: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).try_normalize().unwrap_or(Vec3::NEG_Z),
            aspect,
            ..Self::default()
        }
    }

    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position)
            .try_normalize()
            .unwrap_or(self.direction);
    }

    /// Aspect ratio from a pixel extent. Zero heights are ignored.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Vulkan-style projection with Y pointing down in clip space.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        projection.y_axis.y = -projection.y_axis.y;
        projection
    }

    pub fn uniforms(&self) -> CameraUniforms {
        CameraUniforms::from(self)
    }
}

/// Camera uniform buffer data (std140 compatible).
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniforms {
    pub inverse_view: [[f32; 4]; 4],
    pub inverse_projection: [[f32; 4]; 4],
    pub position: [f32; 4],
}

impl CameraUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

impl From<&Camera> for CameraUniforms {
    fn from(camera: &Camera) -> Self {
        Self {
            inverse_view: camera.view_matrix().inverse().to_cols_array_2d(),
            inverse_projection: camera.projection_matrix().inverse().to_cols_array_2d(),
            position: camera.position.extend(1.0).to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn uniforms_are_std140_sized() {
        assert_eq!(CameraUniforms::SIZE % 16, 0);
        assert_eq!(CameraUniforms::SIZE, 144);
    }

    #[test]
    fn inverse_view_maps_origin_to_camera_position() {
        let camera = Camera::looking_at(Vec3::new(3.0, 4.0, 5.0), Vec3::ZERO, 1.0);
        let uniforms = camera.uniforms();
        let inverse_view = Mat4::from_cols_array_2d(&uniforms.inverse_view);
        let origin = inverse_view * Vec4::new(0.0, 0.0, 0.0, 1.0);

        assert_relative_eq!(origin.x, 3.0, epsilon = 1e-5);
        assert_relative_eq!(origin.y, 4.0, epsilon = 1e-5);
        assert_relative_eq!(origin.z, 5.0, epsilon = 1e-5);
        assert_relative_eq!(uniforms.position[3], 1.0);
    }

    #[test]
    fn projection_flips_y() {
        let camera = Camera::default();
        let up = camera.projection_matrix() * Vec4::new(0.0, 1.0, -1.0, 1.0);
        assert!(up.y < 0.0);
    }

    #[test]
    fn viewport_ignores_zero_height() {
        let mut camera = Camera::default();
        camera.set_viewport(1920, 1080);
        assert_relative_eq!(camera.aspect, 1920.0 / 1080.0);
        camera.set_viewport(1920, 0);
        assert_relative_eq!(camera.aspect, 1920.0 / 1080.0);
    }

    #[test]
    fn look_at_own_position_keeps_direction() {
        let mut camera = Camera::default();
        camera.look_at(camera.position);
        assert_eq!(camera.direction, Vec3::NEG_Z);
    }
}
