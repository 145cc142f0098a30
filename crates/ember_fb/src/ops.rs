//! Frame operators: post-processing passes over the composited image.
//!
//! An operator is configured once per framebuffer via [`FrameOp::attach`],
//! which validates its channel requirements against the framebuffer and
//! returns a live instance. Live instances run in user order, strictly after
//! the frame completion barrier and before the finished signal reaches the
//! caller. Channel requirements that cannot be met are a configuration
//! error at attach time, never a silent skip at frame time.

use glam::{Vec3, Vec4};
use log::trace;

use crate::error::{Error, Result};
use crate::framebuffer::FrameBufferView;

/// Camera parameters the operator chain may consult.
#[derive(Debug, Clone, Copy)]
pub struct CameraParams {
    /// Near clip distance, used to normalize depth output.
    pub near: f32,
    /// Far clip distance.
    pub far: f32,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            near: 0.1,
            far: 1000.0,
        }
    }
}

/// A configured post-processing pass.
pub trait FrameOp: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate channel requirements and build the live per-framebuffer
    /// instance. Missing channels are a configuration error here.
    fn attach(&self, view: &FrameBufferView<'_>) -> Result<Box<dyn LiveFrameOp>>;
}

/// An attached operator, run once per finished frame.
pub trait LiveFrameOp: Send {
    /// Transform the color buffer in place. `view` exposes the read-only
    /// auxiliary channels of the framebuffer.
    fn process(&mut self, color: &mut [Vec4], view: &FrameBufferView<'_>, camera: &CameraParams);
}

// -------------------------------------------------------------------------
// Tone mapping

/// Filmic tone mapping with exposure control (Lottes-style fitted curve).
#[derive(Debug, Clone, Copy)]
pub struct ToneMapOp {
    /// Linear exposure multiplier applied before the curve.
    pub exposure: f32,
    /// Contrast (toe strength) of the curve.
    pub contrast: f32,
    /// Highlight compression; 1.0 keeps the full shoulder.
    pub shoulder: f32,
    /// Mid-level anchor input.
    pub mid_in: f32,
    /// Mid-level anchor output.
    pub mid_out: f32,
    /// Luminance that maps to white.
    pub hdr_max: f32,
}

impl Default for ToneMapOp {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            contrast: 1.6773,
            shoulder: 0.9714,
            mid_in: 0.18,
            mid_out: 0.18,
            hdr_max: 11.0785,
        }
    }
}

struct LiveToneMap {
    exposure: f32,
    a: f32,
    b: f32,
    c: f32,
    d: f32,
}

impl FrameOp for ToneMapOp {
    fn name(&self) -> &'static str {
        "tonemap"
    }

    fn attach(&self, _view: &FrameBufferView<'_>) -> Result<Box<dyn LiveFrameOp>> {
        if self.mid_in <= 0.0 || self.mid_out <= 0.0 || self.hdr_max <= self.mid_in {
            return Err(Error::Config(format!(
                "tonemap anchors out of range: mid_in={}, mid_out={}, hdr_max={}",
                self.mid_in, self.mid_out, self.hdr_max
            )));
        }

        let a = self.contrast.max(1e-4);
        let d = self.shoulder.clamp(1e-4, 1.0);
        let denom = (self.hdr_max.powf(a * d) - self.mid_in.powf(a * d)) * self.mid_out;
        let b = (-self.mid_in.powf(a) + self.hdr_max.powf(a) * self.mid_out) / denom;
        let c = (self.hdr_max.powf(a * d) * self.mid_in.powf(a)
            - self.hdr_max.powf(a) * self.mid_in.powf(a * d) * self.mid_out)
            / denom;

        Ok(Box::new(LiveToneMap {
            exposure: self.exposure,
            a,
            b,
            c,
            d,
        }))
    }
}

impl LiveToneMap {
    #[inline]
    fn curve(&self, x: f32) -> f32 {
        let x = x.max(0.0);
        let z = x.powf(self.a);
        z / (x.powf(self.a * self.d) * self.b + self.c)
    }
}

impl LiveFrameOp for LiveToneMap {
    fn process(&mut self, color: &mut [Vec4], _view: &FrameBufferView<'_>, _camera: &CameraParams) {
        for px in color.iter_mut() {
            let exposed = *px * self.exposure;
            *px = Vec4::new(
                self.curve(exposed.x),
                self.curve(exposed.y),
                self.curve(exposed.z),
                px.w,
            );
        }
    }
}

// -------------------------------------------------------------------------
// Depth visualization

/// Replaces color with depth normalized to `[near, far]` as grayscale.
///
/// Requires the framebuffer to carry a depth channel; attaching to a
/// depthless framebuffer is a configuration error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthNormalizeOp;

struct LiveDepthNormalize;

impl FrameOp for DepthNormalizeOp {
    fn name(&self) -> &'static str {
        "depth_normalize"
    }

    fn attach(&self, view: &FrameBufferView<'_>) -> Result<Box<dyn LiveFrameOp>> {
        if view.depth.is_none() {
            return Err(Error::Config(
                "depth_normalize requires a framebuffer with a depth channel".into(),
            ));
        }
        Ok(Box::new(LiveDepthNormalize))
    }
}

impl LiveFrameOp for LiveDepthNormalize {
    fn process(&mut self, color: &mut [Vec4], view: &FrameBufferView<'_>, camera: &CameraParams) {
        // Presence was validated at attach time.
        let depth = view.depth.unwrap();
        let range = (camera.far - camera.near).max(1e-6);
        for (px, d) in color.iter_mut().zip(depth.iter()) {
            let t = if d.is_finite() {
                ((d - camera.near) / range).clamp(0.0, 1.0)
            } else {
                1.0
            };
            *px = Vec4::new(t, t, t, px.w);
        }
    }
}

// -------------------------------------------------------------------------
// Denoise

/// Feature-guided smoothing pass.
///
/// A stand-in for a library denoiser: a Gaussian blur whose weights collapse
/// across albedo and normal discontinuities when those channels are present,
/// so edges stay crisp while flat regions are smoothed.
#[derive(Debug, Clone, Copy)]
pub struct DenoiseOp {
    /// Filter radius in pixels.
    pub radius: i32,
    /// Spatial standard deviation.
    pub sigma: f32,
}

impl Default for DenoiseOp {
    fn default() -> Self {
        Self {
            radius: 3,
            sigma: 1.5,
        }
    }
}

struct LiveDenoise {
    radius: i32,
    inv_two_sigma_sq: f32,
}

impl FrameOp for DenoiseOp {
    fn name(&self) -> &'static str {
        "denoise"
    }

    fn attach(&self, _view: &FrameBufferView<'_>) -> Result<Box<dyn LiveFrameOp>> {
        if self.radius < 1 || self.sigma <= 0.0 {
            return Err(Error::Config(format!(
                "denoise parameters out of range: radius={}, sigma={}",
                self.radius, self.sigma
            )));
        }
        Ok(Box::new(LiveDenoise {
            radius: self.radius,
            inv_two_sigma_sq: 1.0 / (2.0 * self.sigma * self.sigma),
        }))
    }
}

impl LiveFrameOp for LiveDenoise {
    fn process(&mut self, color: &mut [Vec4], view: &FrameBufferView<'_>, _camera: &CameraParams) {
        let w = view.width as i32;
        let h = view.height as i32;
        let src = color.to_vec();

        for y in 0..h {
            for x in 0..w {
                let o = (y * w + x) as usize;
                let mut sum = Vec4::ZERO;
                let mut weight_sum = 0.0f32;
                for dy in -self.radius..=self.radius {
                    for dx in -self.radius..=self.radius {
                        let nx = x + dx;
                        let ny = y + dy;
                        if nx < 0 || nx >= w || ny < 0 || ny >= h {
                            continue;
                        }
                        let n = (ny * w + nx) as usize;
                        let mut weight = (-((dx * dx + dy * dy) as f32)
                            * self.inv_two_sigma_sq)
                            .exp();
                        if let Some(albedo) = view.albedo {
                            weight *= feature_weight(albedo[o], albedo[n]);
                        }
                        if let Some(normal) = view.normal {
                            weight *= feature_weight(normal[o], normal[n]);
                        }
                        sum += src[n] * weight;
                        weight_sum += weight;
                    }
                }
                if weight_sum > 0.0 {
                    let alpha = color[o].w;
                    color[o] = sum / weight_sum;
                    color[o].w = alpha;
                }
            }
        }
    }
}

/// Edge-stopping weight: 1 for identical features, falling off with their
/// distance.
#[inline]
fn feature_weight(a: Vec3, b: Vec3) -> f32 {
    (-(a - b).length_squared() * 8.0).exp()
}

// -------------------------------------------------------------------------
// Ambient occlusion

/// Screen-space ambient occlusion over the depth and normal channels.
///
/// Darkens a pixel by how many of its screen neighbors sit in front of it
/// relative to its surface orientation. Requires both the depth and normal
/// channels at attach time.
#[derive(Debug, Clone, Copy)]
pub struct SsaoOp {
    /// Neighborhood radius in pixels.
    pub radius: i32,
    /// Occlusion strength in `[0, 1]`.
    pub strength: f32,
}

impl Default for SsaoOp {
    fn default() -> Self {
        Self {
            radius: 4,
            strength: 0.6,
        }
    }
}

struct LiveSsao {
    radius: i32,
    strength: f32,
}

impl FrameOp for SsaoOp {
    fn name(&self) -> &'static str {
        "ssao"
    }

    fn attach(&self, view: &FrameBufferView<'_>) -> Result<Box<dyn LiveFrameOp>> {
        if view.depth.is_none() || view.normal.is_none() {
            return Err(Error::Config(
                "ssao requires a framebuffer with depth and normal channels".into(),
            ));
        }
        Ok(Box::new(LiveSsao {
            radius: self.radius.max(1),
            strength: self.strength.clamp(0.0, 1.0),
        }))
    }
}

impl LiveFrameOp for LiveSsao {
    fn process(&mut self, color: &mut [Vec4], view: &FrameBufferView<'_>, _camera: &CameraParams) {
        let depth = view.depth.unwrap();
        let normal = view.normal.unwrap();
        let w = view.width as i32;
        let h = view.height as i32;

        for y in 0..h {
            for x in 0..w {
                let o = (y * w + x) as usize;
                if !depth[o].is_finite() {
                    continue;
                }
                let mut occluded = 0.0f32;
                let mut samples = 0.0f32;
                for dy in -self.radius..=self.radius {
                    for dx in -self.radius..=self.radius {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = x + dx;
                        let ny = y + dy;
                        if nx < 0 || nx >= w || ny < 0 || ny >= h {
                            continue;
                        }
                        let n = (ny * w + nx) as usize;
                        samples += 1.0;
                        if depth[n].is_finite() && depth[n] < depth[o] {
                            // Closer neighbors occlude more when the surface
                            // faces away from them.
                            let facing = 1.0 - normal[o].dot(normal[n]).max(0.0);
                            occluded += 0.5 + 0.5 * facing;
                        }
                    }
                }
                if samples > 0.0 {
                    let ao = 1.0 - self.strength * (occluded / samples).min(1.0);
                    let alpha = color[o].w;
                    color[o] *= ao;
                    color[o].w = alpha;
                }
            }
        }
    }
}

// -------------------------------------------------------------------------
// Debug

/// Smoke-test operator: tags the first pixel and logs that it ran.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugOp;

struct LiveDebug;

impl FrameOp for DebugOp {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn attach(&self, _view: &FrameBufferView<'_>) -> Result<Box<dyn LiveFrameOp>> {
        Ok(Box::new(LiveDebug))
    }
}

impl LiveFrameOp for LiveDebug {
    fn process(&mut self, color: &mut [Vec4], view: &FrameBufferView<'_>, _camera: &CameraParams) {
        trace!("debug frame op over {}x{} buffer", view.width, view.height);
        if let Some(px) = color.first_mut() {
            *px = Vec4::new(1.0, 0.0, 1.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(width: u32, height: u32, depth: Option<&[f32]>) -> FrameBufferView<'_> {
        FrameBufferView {
            width,
            height,
            depth,
            normal: None,
            albedo: None,
        }
    }

    #[test]
    fn test_tonemap_is_monotone_and_bounded() {
        let op = ToneMapOp::default();
        let v = view(2, 1, None);
        let mut live = op.attach(&v).unwrap();

        let mut color = vec![
            Vec4::new(0.1, 0.1, 0.1, 1.0),
            Vec4::new(4.0, 4.0, 4.0, 1.0),
        ];
        live.process(&mut color, &v, &CameraParams::default());

        assert!(color[0].x < color[1].x, "curve must be monotone");
        assert!(color[1].x <= 1.05, "bright input must be compressed");
        assert_eq!(color[0].w, 1.0, "alpha passes through");
    }

    #[test]
    fn test_tonemap_anchors_midpoint() {
        let op = ToneMapOp::default();
        let v = view(1, 1, None);
        let mut live = op.attach(&v).unwrap();

        let mut color = vec![Vec4::new(0.18, 0.18, 0.18, 1.0)];
        live.process(&mut color, &v, &CameraParams::default());
        assert!((color[0].x - 0.18).abs() < 0.02, "got {}", color[0].x);
    }

    #[test]
    fn test_depth_normalize_requires_depth_channel() {
        let op = DepthNormalizeOp;
        let v = view(1, 1, None);
        assert!(matches!(op.attach(&v), Err(Error::Config(_))));
    }

    #[test]
    fn test_depth_normalize_maps_range() {
        let op = DepthNormalizeOp;
        let depth = [0.1f32, 500.05, 1000.0, f32::INFINITY];
        let v = view(4, 1, Some(&depth));
        let mut live = op.attach(&v).unwrap();

        let mut color = vec![Vec4::ONE; 4];
        live.process(&mut color, &v, &CameraParams::default());

        assert!(color[0].x < 1e-4);
        assert!((color[1].x - 0.5).abs() < 1e-3);
        assert!((color[2].x - 1.0).abs() < 1e-3);
        assert_eq!(color[3].x, 1.0, "miss pixels read as far plane");
    }

    #[test]
    fn test_denoise_flattens_uniform_noise_mean() {
        let op = DenoiseOp::default();
        let v = view(8, 8, None);
        let mut live = op.attach(&v).unwrap();

        // Checkerboard of 0 and 1; the blur must pull values toward 0.5.
        let mut color: Vec<Vec4> = (0..64)
            .map(|i| {
                let on = (i + i / 8) % 2 == 0;
                Vec4::new(on as u32 as f32, 0.0, 0.0, 1.0)
            })
            .collect();
        live.process(&mut color, &v, &CameraParams::default());

        let center = color[8 * 4 + 4].x;
        assert!((center - 0.5).abs() < 0.2, "got {center}");
    }

    #[test]
    fn test_ssao_requires_depth_and_normal() {
        let op = SsaoOp::default();
        let depth = [1.0f32];
        assert!(matches!(op.attach(&view(1, 1, None)), Err(Error::Config(_))));
        assert!(matches!(
            op.attach(&view(1, 1, Some(&depth))),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_ssao_darkens_occluded_pixels() {
        let op = SsaoOp {
            radius: 1,
            strength: 1.0,
        };
        // 3x1 strip: the middle pixel sits behind both neighbors.
        let depth = [1.0f32, 5.0, 1.0];
        let normal = vec![Vec3::Z; 3];
        let v = FrameBufferView {
            width: 3,
            height: 1,
            depth: Some(&depth),
            normal: Some(&normal),
            albedo: None,
        };
        let mut live = op.attach(&v).unwrap();

        let mut color = vec![Vec4::ONE; 3];
        live.process(&mut color, &v, &CameraParams::default());

        assert!(color[1].x < color[0].x, "occluded pixel must darken");
        assert_eq!(color[1].w, 1.0, "alpha passes through");
    }

    #[test]
    fn test_denoise_rejects_bad_parameters() {
        let op = DenoiseOp {
            radius: 0,
            sigma: 1.0,
        };
        assert!(matches!(op.attach(&view(1, 1, None)), Err(Error::Config(_))));
    }
}
