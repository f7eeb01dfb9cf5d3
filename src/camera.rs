// Fly camera - view and projection matrices for the scene uniform

use glam::{Mat4, Vec3};

pub struct Camera {
    pub pos: Vec3,
    pub dir: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees.
    pub fov: f32,
    pub aspect: f32,
}

impl Camera {
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.pos, self.pos + self.dir, self.up)
    }

    /// Perspective projection with a 0..1 depth range.
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov.to_radians(), self.aspect, 0.1, 10000.0)
    }

    /// The combined matrix written to the scene uniform every frame.
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}
