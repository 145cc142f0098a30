//! The render worker kernel and the seam to the intersection service.
//!
//! Ray traversal is an external collaborator behind the [`Intersect`] trait:
//! a pure nearest-hit query with no side effects on the engine's data model.
//! The [`Renderer`] trait shades one pixel per pass; the worker kernel
//! [`render_tile`] walks a tile cell, shades it and stamps the pass counter.

use glam::{Vec3, Vec4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ember_fb::{ChannelFlags, Sample, Tile};

use crate::camera::Camera;
use crate::ray::Ray;

/// Nearest-hit result from the intersection service.
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    /// Ray parameter at the hit point.
    pub t: f32,
    /// Shading normal.
    pub normal: Vec3,
    /// Surface base color.
    pub albedo: Vec3,
}

/// The external ray-intersection service.
pub trait Intersect: Send + Sync {
    /// Nearest hit along the ray, or `None` for a miss.
    fn intersect(&self, ray: &Ray) -> Option<Hit>;
}

/// A world with nothing in it.
pub struct EmptyWorld;

impl Intersect for EmptyWorld {
    fn intersect(&self, _ray: &Ray) -> Option<Hit> {
        None
    }
}

/// Analytic sphere, enough geometry to exercise the pipeline.
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
    pub albedo: Vec3,
}

impl Intersect for Sphere {
    fn intersect(&self, ray: &Ray) -> Option<Hit> {
        let oc = self.center - ray.origin();
        let a = ray.direction().length_squared();
        let h = ray.direction().dot(oc);
        let c = oc.length_squared() - self.radius * self.radius;
        let discriminant = h * h - a * c;
        if discriminant < 0.0 {
            return None;
        }
        let t = (h - discriminant.sqrt()) / a;
        if t <= 1e-3 {
            return None;
        }
        let normal = (ray.at(t) - self.center) / self.radius;
        Some(Hit {
            t,
            normal,
            albedo: self.albedo,
        })
    }
}

/// Render configuration for one pass.
#[derive(Debug, Clone, Copy)]
pub struct RenderConfig {
    /// Samples per pixel per pass.
    pub samples_per_pixel: u32,
    /// Color for rays that miss everything.
    pub background: Vec4,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            samples_per_pixel: 1,
            background: Vec4::ZERO,
        }
    }
}

/// Shades one pixel for one pass.
pub trait Renderer: Send + Sync {
    fn shade(&self, camera: &Camera, world: &dyn Intersect, x: u32, y: u32, pass: u32) -> Sample;
}

/// Constant-color renderer, for pipeline tests.
pub struct FlatRenderer {
    pub color: Vec4,
    pub depth: f32,
}

impl FlatRenderer {
    pub fn new(color: Vec4) -> Self {
        Self { color, depth: 1.0 }
    }
}

impl Renderer for FlatRenderer {
    fn shade(&self, _camera: &Camera, _world: &dyn Intersect, _x: u32, _y: u32, _pass: u32) -> Sample {
        Sample {
            color: self.color,
            depth: self.depth,
            normal: Vec3::Y,
            albedo: self.color.truncate(),
        }
    }
}

/// Primary-ray renderer with a camera-mounted light.
///
/// One bounce, no global illumination: enough shading to produce meaningful
/// color, depth, normal and albedo channels through the intersect seam.
pub struct HeadlightRenderer {
    pub config: RenderConfig,
}

impl HeadlightRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }
}

impl Renderer for HeadlightRenderer {
    fn shade(&self, camera: &Camera, world: &dyn Intersect, x: u32, y: u32, pass: u32) -> Sample {
        // Deterministic per (pixel, pass) jitter stream.
        let seed = (u64::from(x) << 40) ^ (u64::from(y) << 16) ^ u64::from(pass);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut color = Vec4::ZERO;
        let mut nearest: Option<Hit> = None;
        for _ in 0..self.config.samples_per_pixel.max(1) {
            let jitter = (rng.gen::<f32>() - 0.5, rng.gen::<f32>() - 0.5);
            let ray = camera.get_ray(x, y, jitter);
            match world.intersect(&ray) {
                Some(hit) => {
                    let shade = hit.normal.dot(-ray.direction()).max(0.0);
                    color += (hit.albedo * shade).extend(1.0);
                    if nearest.map_or(true, |n| hit.t < n.t) {
                        nearest = Some(hit);
                    }
                }
                None => color += self.config.background,
            }
        }
        color /= self.config.samples_per_pixel.max(1) as f32;

        match nearest {
            Some(hit) => Sample {
                color,
                depth: hit.t,
                normal: hit.normal,
                albedo: hit.albedo,
            },
            None => Sample {
                color,
                ..Sample::empty()
            },
        }
    }
}

/// Render one pass of a tile cell: shade every active pixel and stamp the
/// pass. The caller decides which auxiliary channels are worth producing.
pub fn render_tile(
    renderer: &dyn Renderer,
    camera: &Camera,
    world: &dyn Intersect,
    tile: &mut Tile,
    pass: u32,
    channels: ChannelFlags,
) {
    let desc = tile.desc;
    for local_y in 0..desc.height {
        for local_x in 0..desc.width {
            let global_x = desc.x + local_x;
            let global_y = desc.y + local_y;
            let mut sample = renderer.shade(camera, world, global_x, global_y, pass);
            if !channels.contains(ChannelFlags::NORMAL) {
                sample.normal = Vec3::ZERO;
            }
            if !channels.contains(ChannelFlags::ALBEDO) {
                sample.albedo = Vec3::ZERO;
            }
            tile.add_sample(local_x, local_y, sample);
        }
    }
    tile.finish_pass();
}
