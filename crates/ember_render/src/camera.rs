//! Camera for ray generation.

use glam::Vec3;

use ember_fb::CameraParams;

use crate::ray::Ray;

/// Camera for generating primary rays into the scene.
#[derive(Clone)]
pub struct Camera {
    // Image settings
    pub image_width: u32,
    pub image_height: u32,

    // Camera positioning
    look_from: Vec3,
    look_at: Vec3,
    vup: Vec3,

    // Lens settings
    vfov: f32, // Vertical field of view in degrees
    near: f32,
    far: f32,

    // Cached computed values (set by initialize())
    pixel00_loc: Vec3,
    pixel_delta_u: Vec3,
    pixel_delta_v: Vec3,
}

impl Camera {
    /// Create a new camera with default settings.
    pub fn new() -> Self {
        Self {
            image_width: 800,
            image_height: 450,
            look_from: Vec3::ZERO,
            look_at: Vec3::new(0.0, 0.0, -1.0),
            vup: Vec3::new(0.0, 1.0, 0.0),
            vfov: 90.0,
            near: 0.1,
            far: 1000.0,
            pixel00_loc: Vec3::ZERO,
            pixel_delta_u: Vec3::ZERO,
            pixel_delta_v: Vec3::ZERO,
        }
    }

    /// Set image resolution.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.image_width = width;
        self.image_height = height;
        self
    }

    /// Set camera position.
    pub fn with_position(mut self, look_from: Vec3, look_at: Vec3, vup: Vec3) -> Self {
        self.look_from = look_from;
        self.look_at = look_at;
        self.vup = vup;
        self
    }

    /// Set vertical field of view in degrees.
    pub fn with_fov(mut self, vfov: f32) -> Self {
        self.vfov = vfov;
        self
    }

    /// Set clip distances, used for depth normalization.
    pub fn with_clip(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    /// Parameters the frame operator chain consults.
    pub fn params(&self) -> CameraParams {
        CameraParams {
            near: self.near,
            far: self.far,
        }
    }

    /// Initialize the camera (must be called before generating rays).
    pub fn initialize(&mut self) {
        let focus_dist = 1.0;
        let theta = self.vfov.to_radians();
        let h = (theta / 2.0).tan();
        let viewport_height = 2.0 * h * focus_dist;
        let viewport_width =
            viewport_height * (self.image_width as f32 / self.image_height as f32);

        let w = (self.look_from - self.look_at).normalize();
        let u = self.vup.cross(w).normalize();
        let v = w.cross(u);

        let viewport_u = u * viewport_width;
        let viewport_v = -v * viewport_height;
        self.pixel_delta_u = viewport_u / self.image_width as f32;
        self.pixel_delta_v = viewport_v / self.image_height as f32;

        let viewport_upper_left =
            self.look_from - w * focus_dist - viewport_u / 2.0 - viewport_v / 2.0;
        self.pixel00_loc = viewport_upper_left + (self.pixel_delta_u + self.pixel_delta_v) * 0.5;
    }

    /// Generate a ray through pixel (x, y), offset by a sub-pixel jitter in
    /// `[-0.5, 0.5]^2`.
    pub fn get_ray(&self, x: u32, y: u32, jitter: (f32, f32)) -> Ray {
        let pixel = self.pixel00_loc
            + self.pixel_delta_u * (x as f32 + jitter.0)
            + self.pixel_delta_v * (y as f32 + jitter.1);
        Ray::new(self.look_from, (pixel - self.look_from).normalize())
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}
