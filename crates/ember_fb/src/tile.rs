//! Tiles: the unit of work a render worker produces and submits.
//!
//! A tile is a fixed-size rectangular pixel region carrying color, depth,
//! normal and albedo planes plus an accumulation counter. Pixel arrays are
//! always allocated at the full `TILE_SIZE` footprint; tiles on the image
//! edge use a clipped active region described by their [`TileDesc`].

use std::sync::Mutex;

use glam::{Vec3, Vec4};

/// Edge length of a tile in pixels.
pub const TILE_SIZE: u32 = 64;

/// Number of pixels in a full tile.
pub const TILE_PIXELS: usize = (TILE_SIZE * TILE_SIZE) as usize;

/// Placement of one tile cell within the image-space grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDesc {
    /// X coordinate of the tile's top-left corner in image space
    pub x: u32,
    /// Y coordinate of the tile's top-left corner in image space
    pub y: u32,
    /// Active width in pixels (clipped at the image edge)
    pub width: u32,
    /// Active height in pixels (clipped at the image edge)
    pub height: u32,
    /// Row-major index of this cell in the tile grid
    pub cell: usize,
}

impl TileDesc {
    pub fn new(x: u32, y: u32, width: u32, height: u32, cell: usize) -> Self {
        Self { x, y, width, height, cell }
    }

    /// Number of active pixels in this tile.
    pub fn pixel_count(&self) -> u32 {
        self.width * self.height
    }
}

/// One shaded sample for a single pixel.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub color: Vec4,
    pub depth: f32,
    pub normal: Vec3,
    pub albedo: Vec3,
}

impl Sample {
    /// A miss: background-less black, infinitely far away.
    pub fn empty() -> Self {
        Self {
            color: Vec4::ZERO,
            depth: f32::INFINITY,
            normal: Vec3::ZERO,
            albedo: Vec3::ZERO,
        }
    }

    /// Replace non-finite components so one degenerate ray can never poison
    /// the accumulation buffer.
    pub fn sanitized(mut self) -> Self {
        fn finite_or_zero(v: f32) -> f32 {
            if v.is_finite() {
                v
            } else {
                0.0
            }
        }
        if !self.color.is_finite() {
            self.color = Vec4::new(
                finite_or_zero(self.color.x),
                finite_or_zero(self.color.y),
                finite_or_zero(self.color.z),
                finite_or_zero(self.color.w),
            );
        }
        if !self.depth.is_finite() {
            self.depth = f32::INFINITY;
        }
        if !self.normal.is_finite() {
            self.normal = Vec3::ZERO;
        }
        if !self.albedo.is_finite() {
            self.albedo = Vec3::ZERO;
        }
        self
    }
}

/// A tile of accumulated render output.
///
/// `color` holds the per-pixel *sum* of `accum_id` sample passes; the
/// accumulation buffer divides by the count at normalize time. `depth` keeps
/// the nearest-to-camera depth seen so far, `normal` and `albedo` hold sums
/// alongside `color`.
#[derive(Debug, Clone)]
pub struct Tile {
    pub desc: TileDesc,
    /// Accumulation epoch this tile was rendered for. Contributions tagged
    /// with a stale epoch are dropped by the accumulation buffer.
    pub epoch: u64,
    /// Number of sample passes summed into this tile so far.
    pub accum_id: u32,
    /// Rank that produced this tile (0 in single-rank runs).
    pub owner_rank: u32,
    pub color: Vec<Vec4>,
    pub depth: Vec<f32>,
    pub normal: Vec<Vec3>,
    pub albedo: Vec<Vec3>,
}

impl Tile {
    /// Allocate a zeroed tile for the given grid cell.
    pub fn new(desc: TileDesc, epoch: u64) -> Self {
        Self {
            desc,
            epoch,
            accum_id: 0,
            owner_rank: 0,
            color: vec![Vec4::ZERO; TILE_PIXELS],
            depth: vec![f32::INFINITY; TILE_PIXELS],
            normal: vec![Vec3::ZERO; TILE_PIXELS],
            albedo: vec![Vec3::ZERO; TILE_PIXELS],
        }
    }

    /// Row-major index of a tile-local pixel. Arrays are strided at the full
    /// `TILE_SIZE` width regardless of edge clipping.
    #[inline]
    pub fn index(local_x: u32, local_y: u32) -> usize {
        debug_assert!(local_x < TILE_SIZE && local_y < TILE_SIZE);
        (local_y * TILE_SIZE + local_x) as usize
    }

    /// Add one sample for a tile-local pixel. Non-finite samples are
    /// sanitized in place rather than aborting the pass.
    pub fn add_sample(&mut self, local_x: u32, local_y: u32, sample: Sample) {
        let sample = sample.sanitized();
        let i = Self::index(local_x, local_y);
        self.color[i] += sample.color;
        self.normal[i] += sample.normal;
        self.albedo[i] += sample.albedo;
        if sample.depth < self.depth[i] {
            self.depth[i] = sample.depth;
        }
    }

    /// Add one weighted sample pass over the tile's active region.
    ///
    /// `samples` is row-major over `desc.width * desc.height` pixels. The
    /// tile's accumulation counter advances by one.
    pub fn accumulate(&mut self, samples: &[Sample], weight: f32) {
        assert_eq!(
            samples.len(),
            self.desc.pixel_count() as usize,
            "sample slab does not match tile extents"
        );
        for ly in 0..self.desc.height {
            for lx in 0..self.desc.width {
                let mut s = samples[(ly * self.desc.width + lx) as usize].sanitized();
                s.color *= weight;
                s.normal *= weight;
                s.albedo *= weight;
                self.add_sample(lx, ly, s);
            }
        }
        self.accum_id += 1;
    }

    /// Mark the end of one unweighted fill pass written via `add_sample`.
    pub fn finish_pass(&mut self) {
        self.accum_id += 1;
    }

    /// Zero all planes and the accumulation counter, and retarget the tile
    /// at a (possibly different) grid cell and epoch.
    pub fn reset(&mut self, desc: TileDesc, epoch: u64, owner_rank: u32) {
        self.desc = desc;
        self.epoch = epoch;
        self.accum_id = 0;
        self.owner_rank = owner_rank;
        self.color.fill(Vec4::ZERO);
        self.depth.fill(f32::INFINITY);
        self.normal.fill(Vec3::ZERO);
        self.albedo.fill(Vec3::ZERO);
    }
}

/// Pool of reusable tiles, one per framebuffer.
///
/// Tiles are allocated once at framebuffer creation and recycled across
/// frames; running out is a synchronous error to the render call issuing the
/// acquire, never a crash mid-frame.
pub struct TilePool {
    free: Mutex<Vec<Box<Tile>>>,
    capacity: usize,
}

impl TilePool {
    /// Pre-allocate `capacity` tiles.
    pub fn new(capacity: usize) -> Self {
        let blank = TileDesc::new(0, 0, TILE_SIZE, TILE_SIZE, 0);
        let free = (0..capacity).map(|_| Box::new(Tile::new(blank, 0))).collect();
        Self {
            free: Mutex::new(free),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tiles currently available.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Take one tile out of the pool, reset for the given cell and epoch.
    pub fn acquire(
        &self,
        desc: TileDesc,
        epoch: u64,
        owner_rank: u32,
    ) -> crate::error::Result<Box<Tile>> {
        let mut free = self.free.lock().unwrap();
        match free.pop() {
            Some(mut tile) => {
                tile.reset(desc, epoch, owner_rank);
                Ok(tile)
            }
            None => Err(crate::error::Error::TilePoolExhausted {
                requested: 1,
                capacity: self.capacity,
            }),
        }
    }

    /// Take `descs.len()` tiles at once, or fail without taking any.
    pub fn acquire_all(
        &self,
        descs: &[TileDesc],
        epoch: u64,
        owner_rank: u32,
    ) -> crate::error::Result<Vec<Box<Tile>>> {
        let mut free = self.free.lock().unwrap();
        if free.len() < descs.len() {
            return Err(crate::error::Error::TilePoolExhausted {
                requested: descs.len(),
                capacity: self.capacity,
            });
        }
        let mut out = Vec::with_capacity(descs.len());
        for desc in descs {
            let mut tile = free.pop().unwrap();
            tile.reset(*desc, epoch, owner_rank);
            out.push(tile);
        }
        Ok(out)
    }

    /// Return a tile to the pool.
    pub fn release(&self, tile: Box<Tile>) {
        let mut free = self.free.lock().unwrap();
        if free.len() < self.capacity {
            free.push(tile);
        }
    }
}
