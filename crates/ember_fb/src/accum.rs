//! Per-pixel accumulation buffer for progressive refinement.
//!
//! The buffer owns a running color sum and sample count for every pixel in
//! the image, stored per tile cell behind a per-cell lock: concurrent
//! accumulation into *different* cells never contends, while redundant
//! submissions for the *same* cell serialize on that cell's lock only.
//!
//! Every contribution carries the epoch it was rendered for. An explicit
//! clear bumps the epoch, so tiles still in flight from a superseded frame
//! (camera moved, scene changed) are recognized as stale and dropped instead
//! of ghosting into the new accumulation pass.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use glam::{Vec3, Vec4};
use log::debug;

use crate::grid::TileGrid;
use crate::tile::{Tile, TILE_PIXELS, TILE_SIZE};

struct CellAccum {
    color: Vec<Vec4>,
    count: Vec<u32>,
    depth: Vec<f32>,
    normal: Vec<Vec3>,
    albedo: Vec<Vec3>,
    /// Estimated remaining variance of this cell, for adaptive refinement.
    error: f32,
}

impl CellAccum {
    fn new() -> Self {
        Self {
            color: vec![Vec4::ZERO; TILE_PIXELS],
            count: vec![0; TILE_PIXELS],
            depth: vec![f32::INFINITY; TILE_PIXELS],
            normal: vec![Vec3::ZERO; TILE_PIXELS],
            albedo: vec![Vec3::ZERO; TILE_PIXELS],
            error: f32::INFINITY,
        }
    }

    fn clear(&mut self) {
        self.color.fill(Vec4::ZERO);
        self.count.fill(0);
        self.depth.fill(f32::INFINITY);
        self.normal.fill(Vec3::ZERO);
        self.albedo.fill(Vec3::ZERO);
        self.error = f32::INFINITY;
    }
}

/// Whole-image accumulation state. Owned exclusively by the tile compositor.
pub struct AccumBuffer {
    grid: TileGrid,
    cells: Vec<Mutex<CellAccum>>,
    epoch: AtomicU64,
    background: Vec4,
}

impl AccumBuffer {
    pub fn new(grid: TileGrid, background: Vec4) -> Self {
        let cells = (0..grid.len()).map(|_| Mutex::new(CellAccum::new())).collect();
        Self {
            grid,
            cells,
            epoch: AtomicU64::new(0),
            background,
        }
    }

    /// The current accumulation epoch. Tiles must be tagged with this value
    /// to be accepted.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn background(&self) -> Vec4 {
        self.background
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    /// Reset all accumulated state and start a new epoch.
    ///
    /// Clearing twice in a row leaves the same zeroed state as clearing once;
    /// only the epoch counter keeps advancing.
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        for cell in &self.cells {
            cell.lock().unwrap().clear();
        }
    }

    /// Fold one tile's sums into the buffer.
    ///
    /// Returns `false` if the tile was tagged with a stale epoch and dropped.
    /// That is an expected event in progressive rendering, not an error.
    pub fn accumulate_tile(&self, tile: &Tile) -> bool {
        let current = self.epoch();
        if tile.epoch != current {
            debug!(
                "dropping stale tile for cell {} (tile epoch {}, buffer epoch {})",
                tile.desc.cell, tile.epoch, current
            );
            return false;
        }
        if tile.accum_id == 0 {
            return true;
        }

        let mut cell = self.cells[tile.desc.cell].lock().unwrap();

        // Revalidate under the cell lock. clear() bumps the epoch before it
        // takes any cell lock, so a clear racing this submission either
        // zeroes the cell after our write or is caught here; the unlocked
        // check above is only a fast path.
        if tile.epoch != self.epoch() {
            debug!(
                "dropping tile for cell {}: cleared while in flight",
                tile.desc.cell
            );
            return false;
        }

        // Track convergence: how far this contribution moves the running
        // average, in mean absolute luminance over the active region.
        let mut drift = 0.0f32;
        let active = tile.desc.pixel_count() as f32;

        for ly in 0..tile.desc.height {
            for lx in 0..tile.desc.width {
                let i = (ly * TILE_SIZE + lx) as usize;
                let old_count = cell.count[i];
                let old_avg = if old_count > 0 {
                    cell.color[i] / old_count as f32
                } else {
                    Vec4::ZERO
                };

                cell.color[i] += tile.color[i];
                cell.normal[i] += tile.normal[i];
                cell.albedo[i] += tile.albedo[i];
                cell.count[i] = old_count + tile.accum_id;
                if tile.depth[i] < cell.depth[i] {
                    cell.depth[i] = tile.depth[i];
                }

                let new_avg = cell.color[i] / cell.count[i] as f32;
                let delta = (new_avg - old_avg).abs();
                drift += (delta.x + delta.y + delta.z) / 3.0;
            }
        }
        cell.error = drift / active;
        true
    }

    /// Convergence estimate for one cell: how much the last accepted
    /// contribution moved the running average. Infinite until the cell has
    /// received anything.
    pub fn tile_error(&self, cell: usize) -> f32 {
        self.cells[cell].lock().unwrap().error
    }

    /// Resolve `sum / max(1, count)` per pixel into a row-major image buffer.
    /// Pixels with zero samples resolve to the background color.
    pub fn normalize(&self, out: &mut [Vec4]) {
        let w = self.grid.image_width();
        assert_eq!(out.len(), (w * self.grid.image_height()) as usize);

        for desc in self.grid.cells() {
            let cell = self.cells[desc.cell].lock().unwrap();
            for ly in 0..desc.height {
                for lx in 0..desc.width {
                    let i = (ly * TILE_SIZE + lx) as usize;
                    let o = ((desc.y + ly) * w + desc.x + lx) as usize;
                    out[o] = if cell.count[i] > 0 {
                        cell.color[i] / cell.count[i] as f32
                    } else {
                        self.background
                    };
                }
            }
        }
    }

    /// Resolve the nearest-to-camera depth per pixel. Never-hit pixels stay
    /// at positive infinity.
    pub fn resolve_depth(&self, out: &mut [f32]) {
        let w = self.grid.image_width();
        assert_eq!(out.len(), (w * self.grid.image_height()) as usize);

        for desc in self.grid.cells() {
            let cell = self.cells[desc.cell].lock().unwrap();
            for ly in 0..desc.height {
                for lx in 0..desc.width {
                    let i = (ly * TILE_SIZE + lx) as usize;
                    let o = ((desc.y + ly) * w + desc.x + lx) as usize;
                    out[o] = cell.depth[i];
                }
            }
        }
    }

    /// Resolve the averaged shading normal per pixel, re-normalized where
    /// non-zero.
    pub fn resolve_normal(&self, out: &mut [Vec3]) {
        self.resolve_vec3(out, |cell, i| cell.normal[i], true);
    }

    /// Resolve the averaged albedo per pixel.
    pub fn resolve_albedo(&self, out: &mut [Vec3]) {
        self.resolve_vec3(out, |cell, i| cell.albedo[i], false);
    }

    fn resolve_vec3(
        &self,
        out: &mut [Vec3],
        plane: impl Fn(&CellAccum, usize) -> Vec3,
        renormalize: bool,
    ) {
        let w = self.grid.image_width();
        assert_eq!(out.len(), (w * self.grid.image_height()) as usize);

        for desc in self.grid.cells() {
            let cell = self.cells[desc.cell].lock().unwrap();
            for ly in 0..desc.height {
                for lx in 0..desc.width {
                    let i = (ly * TILE_SIZE + lx) as usize;
                    let o = ((desc.y + ly) * w + desc.x + lx) as usize;
                    let mut v = if cell.count[i] > 0 {
                        plane(&*cell, i) / cell.count[i] as f32
                    } else {
                        Vec3::ZERO
                    };
                    if renormalize && v.length_squared() > 0.0 {
                        v = v.normalize();
                    }
                    out[o] = v;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{Sample, TileDesc};

    fn filled_tile(desc: TileDesc, epoch: u64, color: Vec4) -> Tile {
        let mut tile = Tile::new(desc, epoch);
        let samples = vec![
            Sample {
                color,
                depth: 2.0,
                normal: Vec3::Y,
                albedo: Vec3::splat(0.8),
            };
            desc.pixel_count() as usize
        ];
        tile.accumulate(&samples, 1.0);
        tile
    }

    fn red() -> Vec4 {
        Vec4::new(1.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn test_correct_averaging_repeated_submissions() {
        for n in [1u32, 5, 100] {
            let grid = TileGrid::new(8, 8, 64);
            let accum = AccumBuffer::new(grid, Vec4::ZERO);
            let desc = accum.grid().cell(0);

            for _ in 0..n {
                let tile = filled_tile(desc, 0, red());
                assert!(accum.accumulate_tile(&tile));
            }

            let mut out = vec![Vec4::ZERO; 64];
            accum.normalize(&mut out);
            for px in &out {
                assert!((px.x - 1.0).abs() < 1e-5, "n={n}: got {px:?}");
                assert!(px.y.abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_zero_count_pixels_resolve_to_background() {
        let background = Vec4::new(0.1, 0.2, 0.3, 1.0);
        let grid = TileGrid::new(8, 8, 64);
        let accum = AccumBuffer::new(grid, background);

        let mut out = vec![Vec4::ZERO; 64];
        accum.normalize(&mut out);
        assert!(out.iter().all(|px| *px == background));
    }

    #[test]
    fn test_stale_epoch_tile_is_dropped() {
        let grid = TileGrid::new(8, 8, 64);
        let accum = AccumBuffer::new(grid, Vec4::ZERO);
        let desc = accum.grid().cell(0);

        let pre_clear = filled_tile(desc, accum.epoch(), red());
        accum.clear();
        assert!(!accum.accumulate_tile(&pre_clear));

        let mut out = vec![Vec4::ZERO; 64];
        accum.normalize(&mut out);
        assert!(out.iter().all(|px| *px == Vec4::ZERO));
    }

    #[test]
    fn test_concurrent_clear_never_ghosts_stale_tile() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        // Race one submission against a clear, many rounds. Whichever side
        // wins the interleaving, a tile rendered for the pre-clear epoch must
        // never survive into the post-clear accumulation.
        let accum = Arc::new(AccumBuffer::new(TileGrid::new(8, 8, 64), Vec4::ZERO));
        for _ in 0..2000 {
            let desc = accum.grid().cell(0);
            let tile = filled_tile(desc, accum.epoch(), red());
            let barrier = Arc::new(Barrier::new(2));

            let submitter = {
                let accum = accum.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    accum.accumulate_tile(&tile);
                })
            };
            barrier.wait();
            accum.clear();
            submitter.join().unwrap();

            let mut out = vec![Vec4::ONE; 64];
            accum.normalize(&mut out);
            assert!(
                out.iter().all(|px| *px == Vec4::ZERO),
                "stale tile ghosted past a concurrent clear"
            );
        }
    }

    #[test]
    fn test_clear_is_idempotent() {
        let grid = TileGrid::new(8, 8, 64);
        let accum = AccumBuffer::new(grid, Vec4::ZERO);
        let desc = accum.grid().cell(0);
        let tile = filled_tile(desc, 0, red());
        accum.accumulate_tile(&tile);

        accum.clear();
        let mut once = vec![Vec4::ZERO; 64];
        accum.normalize(&mut once);

        accum.clear();
        let mut twice = vec![Vec4::ZERO; 64];
        accum.normalize(&mut twice);

        assert_eq!(once, twice);
        assert_eq!(accum.epoch(), 2);
    }

    #[test]
    fn test_error_estimate_shrinks_with_accumulation() {
        let grid = TileGrid::new(8, 8, 64);
        let accum = AccumBuffer::new(grid, Vec4::ZERO);
        let desc = accum.grid().cell(0);

        accum.accumulate_tile(&filled_tile(desc, 0, red()));
        let after_one = accum.tile_error(0);

        for _ in 0..9 {
            accum.accumulate_tile(&filled_tile(desc, 0, red()));
        }
        let after_ten = accum.tile_error(0);

        // A uniform signal converges immediately; the estimate must reflect
        // that the average stopped moving.
        assert!(after_ten <= after_one);
        assert!(after_ten < 1e-5);
    }

    #[test]
    fn test_depth_keeps_nearest() {
        let grid = TileGrid::new(8, 8, 64);
        let accum = AccumBuffer::new(grid, Vec4::ZERO);
        let desc = accum.grid().cell(0);

        let mut near = Tile::new(desc, 0);
        let mut far = Tile::new(desc, 0);
        for ly in 0..desc.height {
            for lx in 0..desc.width {
                near.add_sample(
                    lx,
                    ly,
                    Sample {
                        depth: 1.0,
                        ..Sample::empty()
                    },
                );
                far.add_sample(
                    lx,
                    ly,
                    Sample {
                        depth: 5.0,
                        ..Sample::empty()
                    },
                );
            }
        }
        near.finish_pass();
        far.finish_pass();

        accum.accumulate_tile(&far);
        accum.accumulate_tile(&near);

        let mut depth = vec![0.0f32; 64];
        accum.resolve_depth(&mut depth);
        assert!(depth.iter().all(|d| *d == 1.0));
    }
}
