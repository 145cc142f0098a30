//! Framebuffer: channel negotiation, resolve and map/unmap.
//!
//! The framebuffer owns the accumulation buffer, the tile pool and the
//! attached frame-operator chain. Accumulation is always float precision
//! internally; `ColorFormat` only controls what `map_color` presents.
//!
//! Mapping is valid only once the frame controller has reached its finished
//! state; the returned guards keep the resolved buffers borrowed until the
//! caller drops them (the unmap).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard};

use glam::{Vec3, Vec4};

use crate::accum::AccumBuffer;
use crate::channel::{ChannelFlags, ColorFormat};
use crate::error::{Error, Result};
use crate::grid::TileGrid;
use crate::ops::{CameraParams, FrameOp, LiveFrameOp};
use crate::tile::TilePool;

/// Read-only window onto the framebuffer's auxiliary channels, handed to
/// frame operators.
pub struct FrameBufferView<'a> {
    pub width: u32,
    pub height: u32,
    pub depth: Option<&'a [f32]>,
    pub normal: Option<&'a [Vec3]>,
    pub albedo: Option<&'a [Vec3]>,
}

/// Resolved, presentable buffers for the most recently finished frame.
struct Resolved {
    /// Color after the operator chain ran.
    color: Vec<Vec4>,
    /// Raw normalized accumulation, before any operator.
    accum_color: Vec<Vec4>,
    depth: Vec<f32>,
    normal: Vec<Vec3>,
    albedo: Vec<Vec3>,
}

pub struct FrameBuffer {
    format: ColorFormat,
    channels: ChannelFlags,
    accum: AccumBuffer,
    pool: TilePool,
    resolved: RwLock<Resolved>,
    ops: Mutex<Vec<Box<dyn LiveFrameOp>>>,
    frame_done: AtomicBool,
}

impl FrameBuffer {
    /// Create a framebuffer. Dimensions and channel set are fixed for its
    /// whole lifetime.
    pub fn new(
        width: u32,
        height: u32,
        format: ColorFormat,
        channels: ChannelFlags,
        background: Vec4,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Config(format!(
                "framebuffer extents must be non-zero, got {width}x{height}"
            )));
        }
        if !channels.contains(ChannelFlags::COLOR) {
            return Err(Error::Config(
                "framebuffer requires at least the color channel".into(),
            ));
        }

        let grid = TileGrid::new(width, height, crate::tile::TILE_SIZE);
        let pixels = (width * height) as usize;
        // Two tiles per cell covers double-buffered progressive submission.
        let pool = TilePool::new(grid.len() * 2);
        let accum = AccumBuffer::new(grid, background);

        Ok(Self {
            format,
            channels,
            accum,
            pool,
            resolved: RwLock::new(Resolved {
                color: vec![Vec4::ZERO; pixels],
                accum_color: vec![Vec4::ZERO; pixels],
                depth: vec![f32::INFINITY; pixels],
                normal: vec![Vec3::ZERO; pixels],
                albedo: vec![Vec3::ZERO; pixels],
            }),
            ops: Mutex::new(Vec::new()),
            frame_done: AtomicBool::new(false),
        })
    }

    pub fn width(&self) -> u32 {
        self.accum.grid().image_width()
    }

    pub fn height(&self) -> u32 {
        self.accum.grid().image_height()
    }

    pub fn format(&self) -> ColorFormat {
        self.format
    }

    pub fn channels(&self) -> ChannelFlags {
        self.channels
    }

    pub fn grid(&self) -> &TileGrid {
        self.accum.grid()
    }

    pub fn accum(&self) -> &AccumBuffer {
        &self.accum
    }

    pub fn pool(&self) -> &TilePool {
        &self.pool
    }

    /// The current accumulation epoch; tiles must carry it to be accepted.
    pub fn epoch(&self) -> u64 {
        self.accum.epoch()
    }

    /// Reset accumulation and start a new epoch. The previously resolved
    /// frame becomes unmappable until a new frame finishes.
    pub fn clear(&self) {
        self.frame_done.store(false, Ordering::Release);
        self.accum.clear();
    }

    /// Attach an operator chain, replacing any previous one. Channel
    /// requirements are validated here, synchronously; on error no operator
    /// is installed.
    pub fn set_ops(&self, ops: Vec<Box<dyn FrameOp>>) -> Result<()> {
        let resolved = self.resolved.read().unwrap();
        let view = self.view_of(&resolved);
        let mut live = Vec::with_capacity(ops.len());
        for op in &ops {
            live.push(op.attach(&view)?);
        }
        drop(resolved);
        *self.ops.lock().unwrap() = live;
        Ok(())
    }

    /// True once the most recent frame has been resolved and is mappable.
    pub fn is_frame_done(&self) -> bool {
        self.frame_done.load(Ordering::Acquire)
    }

    /// Invalidate the mapped state at the start of a new frame.
    pub fn begin_frame(&self) {
        self.frame_done.store(false, Ordering::Release);
    }

    /// Normalize the accumulation buffer, run the operator chain and mark
    /// the frame mappable. Called by the compositor once the completion
    /// barrier is reached.
    pub fn resolve(&self, camera: &CameraParams) {
        {
            let mut resolved = self.resolved.write().unwrap();
            self.accum.normalize(&mut resolved.accum_color);
            if self.channels.contains(ChannelFlags::DEPTH) {
                self.accum.resolve_depth(&mut resolved.depth);
            }
            if self.channels.contains(ChannelFlags::NORMAL) {
                self.accum.resolve_normal(&mut resolved.normal);
            }
            if self.channels.contains(ChannelFlags::ALBEDO) {
                self.accum.resolve_albedo(&mut resolved.albedo);
            }

            let Resolved {
                color,
                accum_color,
                depth,
                normal,
                albedo,
            } = &mut *resolved;
            color.copy_from_slice(accum_color);

            let view = FrameBufferView {
                width: self.width(),
                height: self.height(),
                depth: self.channels.contains(ChannelFlags::DEPTH).then_some(&depth[..]),
                normal: self
                    .channels
                    .contains(ChannelFlags::NORMAL)
                    .then_some(&normal[..]),
                albedo: self
                    .channels
                    .contains(ChannelFlags::ALBEDO)
                    .then_some(&albedo[..]),
            };
            let mut ops = self.ops.lock().unwrap();
            for op in ops.iter_mut() {
                op.process(color, &view, camera);
            }
        }
        self.frame_done.store(true, Ordering::Release);
    }

    fn view_of<'a>(&self, resolved: &'a Resolved) -> FrameBufferView<'a> {
        FrameBufferView {
            width: self.width(),
            height: self.height(),
            depth: self
                .channels
                .contains(ChannelFlags::DEPTH)
                .then_some(&resolved.depth[..]),
            normal: self
                .channels
                .contains(ChannelFlags::NORMAL)
                .then_some(&resolved.normal[..]),
            albedo: self
                .channels
                .contains(ChannelFlags::ALBEDO)
                .then_some(&resolved.albedo[..]),
        }
    }

    fn guard_mapped(&self) -> Result<RwLockReadGuard<'_, Resolved>> {
        if !self.is_frame_done() {
            return Err(Error::MapUnfinished);
        }
        Ok(self.resolved.read().unwrap())
    }

    /// Map the presentable color channel. Valid only after the frame
    /// finished; dropping the returned guard is the unmap.
    pub fn map_color(&self) -> Result<MappedColor<'_>> {
        let guard = self.guard_mapped()?;
        let srgb = match self.format {
            ColorFormat::Srgba8 => Some(guard.color.iter().map(|c| color_to_rgba(*c)).fold(
                Vec::with_capacity(guard.color.len() * 4),
                |mut acc, px| {
                    acc.extend_from_slice(&px);
                    acc
                },
            )),
            ColorFormat::Rgba32F => None,
        };
        Ok(MappedColor {
            guard,
            format: self.format,
            srgb,
        })
    }

    /// Map the raw normalized accumulation (pre-operator) color.
    pub fn map_accum(&self) -> Result<MappedAccum<'_>> {
        if !self.channels.contains(ChannelFlags::ACCUM) {
            return Err(Error::Config(
                "framebuffer was created without the accum channel".into(),
            ));
        }
        Ok(MappedAccum {
            guard: self.guard_mapped()?,
        })
    }

    pub fn map_depth(&self) -> Result<MappedDepth<'_>> {
        if !self.channels.contains(ChannelFlags::DEPTH) {
            return Err(Error::Config(
                "framebuffer was created without the depth channel".into(),
            ));
        }
        Ok(MappedDepth {
            guard: self.guard_mapped()?,
        })
    }

    pub fn map_normal(&self) -> Result<MappedNormal<'_>> {
        if !self.channels.contains(ChannelFlags::NORMAL) {
            return Err(Error::Config(
                "framebuffer was created without the normal channel".into(),
            ));
        }
        Ok(MappedNormal {
            guard: self.guard_mapped()?,
        })
    }

    pub fn map_albedo(&self) -> Result<MappedAlbedo<'_>> {
        if !self.channels.contains(ChannelFlags::ALBEDO) {
            return Err(Error::Config(
                "framebuffer was created without the albedo channel".into(),
            ));
        }
        Ok(MappedAlbedo {
            guard: self.guard_mapped()?,
        })
    }
}

/// Mapped color channel; drop to unmap.
pub struct MappedColor<'a> {
    guard: RwLockReadGuard<'a, Resolved>,
    format: ColorFormat,
    srgb: Option<Vec<u8>>,
}

impl MappedColor<'_> {
    /// Linear float pixels, regardless of the presented format.
    pub fn as_rgba_f32(&self) -> &[Vec4] {
        &self.guard.color
    }

    /// The channel in its negotiated external format.
    pub fn as_bytes(&self) -> &[u8] {
        match self.format {
            ColorFormat::Srgba8 => self.srgb.as_deref().unwrap(),
            ColorFormat::Rgba32F => bytemuck::cast_slice(&self.guard.color),
        }
    }
}

pub struct MappedAccum<'a> {
    guard: RwLockReadGuard<'a, Resolved>,
}

impl MappedAccum<'_> {
    pub fn as_rgba_f32(&self) -> &[Vec4] {
        &self.guard.accum_color
    }
}

pub struct MappedDepth<'a> {
    guard: RwLockReadGuard<'a, Resolved>,
}

impl MappedDepth<'_> {
    pub fn as_slice(&self) -> &[f32] {
        &self.guard.depth
    }
}

pub struct MappedNormal<'a> {
    guard: RwLockReadGuard<'a, Resolved>,
}

impl MappedNormal<'_> {
    pub fn as_slice(&self) -> &[Vec3] {
        &self.guard.normal
    }
}

pub struct MappedAlbedo<'a> {
    guard: RwLockReadGuard<'a, Resolved>,
}

impl MappedAlbedo<'_> {
    pub fn as_slice(&self) -> &[Vec3] {
        &self.guard.albedo
    }
}

/// Apply gamma correction (gamma = 2.0).
#[inline]
pub fn linear_to_gamma(linear: f32) -> f32 {
    if linear > 0.0 {
        linear.sqrt()
    } else {
        0.0
    }
}

/// Convert a linear color to 8-bit gamma-encoded RGBA.
pub fn color_to_rgba(color: Vec4) -> [u8; 4] {
    let r = (255.0 * linear_to_gamma(color.x).clamp(0.0, 1.0)) as u8;
    let g = (255.0 * linear_to_gamma(color.y).clamp(0.0, 1.0)) as u8;
    let b = (255.0 * linear_to_gamma(color.z).clamp(0.0, 1.0)) as u8;
    let a = (255.0 * color.w.clamp(0.0, 1.0)) as u8;
    [r, g, b, a]
}
