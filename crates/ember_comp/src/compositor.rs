//! Tile compositor: merges worker tiles into the accumulation buffer and
//! drives frame completion.
//!
//! One compositor exists per in-flight frame. It tracks which tile cells have
//! been received versus expected, forwards accepted tiles to the framebuffer's
//! accumulation buffer, and - once every cell has been observed at least once
//! - resolves the frame, runs the operator chain and signals the future.
//!
//! Bookkeeping is one atomic counter per cell plus a single remaining-cells
//! atomic, so concurrent submissions for different cells never contend on a
//! shared lock; redundant submissions for the same cell serialize only on
//! that cell's accumulation lock.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace};

use ember_fb::{CameraParams, FrameBuffer, Tile};

use crate::future::FrameFuture;

pub struct TileCompositor {
    fb: Arc<FrameBuffer>,
    future: Arc<FrameFuture>,
    camera: CameraParams,
    /// Number of tiles received per cell during this frame.
    received: Vec<AtomicU32>,
    /// Cells not yet received at least once.
    remaining: AtomicUsize,
}

impl TileCompositor {
    /// Start a frame against `fb`. The expected tile set is the framebuffer's
    /// whole grid; accumulation state persists from previous frames until an
    /// explicit clear.
    pub fn new(fb: Arc<FrameBuffer>, future: Arc<FrameFuture>, camera: CameraParams) -> Self {
        fb.begin_frame();
        let cells = fb.grid().len();
        Self {
            fb,
            future,
            camera,
            received: (0..cells).map(|_| AtomicU32::new(0)).collect(),
            remaining: AtomicUsize::new(cells),
        }
    }

    pub fn framebuffer(&self) -> &Arc<FrameBuffer> {
        &self.fb
    }

    pub fn future(&self) -> &Arc<FrameFuture> {
        &self.future
    }

    /// Number of cells the frame is waiting on.
    pub fn expected(&self) -> usize {
        self.fb.grid().len()
    }

    /// How many tiles have been received for one cell this frame.
    pub fn received_count(&self, cell: usize) -> u32 {
        self.received[cell].load(Ordering::Acquire)
    }

    /// Merge one finished tile. The tile is returned to the framebuffer's
    /// pool in all cases.
    ///
    /// Redundant submissions for an already-received cell accumulate
    /// additively (progressive refinement); stale-epoch tiles are dropped by
    /// the accumulation buffer and do not advance completion.
    pub fn submit_tile(&self, tile: Box<Tile>) {
        if self.future.is_cancelled() {
            trace!("dropping tile for cell {} after cancel", tile.desc.cell);
            self.fb.pool().release(tile);
            return;
        }

        self.future.mark_rendering();

        let cell = tile.desc.cell;
        let accepted = self.fb.accum().accumulate_tile(&tile);
        self.fb.pool().release(tile);
        if !accepted {
            return;
        }

        let prev = self.received[cell].fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            self.future.note_cell_received();
            if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.finish_frame();
            }
        } else {
            trace!("cell {cell} refined, {} submissions so far", prev + 1);
        }
    }

    /// All expected cells observed: resolve, run the operator chain, signal.
    /// Runs on the worker thread that submitted the last outstanding tile.
    fn finish_frame(&self) {
        if !self.future.mark_world_rendered() {
            debug!("frame cancelled at the completion barrier, skipping frame ops");
            return;
        }
        self.fb.resolve(&self.camera);
        self.future.mark_frame_finished();
        self.future.mark_task_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Stage;
    use ember_fb::{
        ChannelFlags, ColorFormat, DebugOp, Sample, SyncEvent, TileDesc, Vec3, Vec4,
    };
    use std::time::Duration;

    fn make_fb(width: u32, height: u32) -> Arc<FrameBuffer> {
        Arc::new(
            FrameBuffer::new(
                width,
                height,
                ColorFormat::Rgba32F,
                ChannelFlags::COLOR | ChannelFlags::DEPTH,
                Vec4::ZERO,
            )
            .unwrap(),
        )
    }

    fn uniform_tile(fb: &FrameBuffer, desc: TileDesc, color: Vec4) -> Box<Tile> {
        let mut tile = fb.pool().acquire(desc, fb.epoch(), 0).unwrap();
        for ly in 0..desc.height {
            for lx in 0..desc.width {
                tile.add_sample(
                    lx,
                    ly,
                    Sample {
                        color,
                        depth: 1.0,
                        normal: Vec3::Y,
                        albedo: Vec3::ONE,
                    },
                );
            }
        }
        tile.finish_pass();
        tile
    }

    fn red() -> Vec4 {
        Vec4::new(1.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn test_frame_completes_after_all_cells() {
        let fb = make_fb(128, 128);
        let future = FrameFuture::new(fb.grid().len());
        let comp = TileCompositor::new(fb.clone(), future.clone(), CameraParams::default());

        let cells = fb.grid().cells().to_vec();
        assert_eq!(cells.len(), 4);
        for desc in cells {
            assert!(!future.is_ready(SyncEvent::FrameFinished));
            comp.submit_tile(uniform_tile(&fb, desc, red()));
        }

        assert!(future.is_ready(SyncEvent::FrameFinished));
        assert!(future.is_ready(SyncEvent::TaskFinished));
        let mapped = fb.map_color().unwrap();
        assert!(mapped.as_rgba_f32().iter().all(|px| (px.x - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_incomplete_frame_stays_rendering() {
        let fb = make_fb(256, 256);
        let future = FrameFuture::new(fb.grid().len());
        let comp = TileCompositor::new(fb.clone(), future.clone(), CameraParams::default());

        // 15 of 16 cells: the barrier must hold.
        let cells = fb.grid().cells().to_vec();
        assert_eq!(cells.len(), 16);
        for desc in &cells[..15] {
            comp.submit_tile(uniform_tile(&fb, *desc, red()));
        }

        assert_eq!(future.stage(), Stage::Rendering);
        assert!(!future
            .wait_timeout(SyncEvent::FrameFinished, Duration::from_millis(50))
            .unwrap());
        assert!((future.progress() - 15.0 / 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_submission_order_does_not_matter() {
        let orders: [&[usize]; 3] = [&[0, 1, 2, 3], &[3, 1, 0, 2], &[2, 3, 1, 0]];
        let mut images = Vec::new();

        for order in orders {
            let fb = make_fb(128, 128);
            let future = FrameFuture::new(fb.grid().len());
            let comp = TileCompositor::new(fb.clone(), future.clone(), CameraParams::default());
            for &cell in order {
                let desc = fb.grid().cell(cell);
                let color = Vec4::new(0.1 + cell as f32 * 0.2, 0.0, 0.0, 1.0);
                comp.submit_tile(uniform_tile(&fb, desc, color));
            }
            let mapped = fb.map_color().unwrap();
            images.push(mapped.as_rgba_f32().to_vec());
        }

        assert_eq!(images[0], images[1]);
        assert_eq!(images[0], images[2]);
    }

    #[test]
    fn test_redundant_cell_submissions_accumulate() {
        let fb = make_fb(128, 128);
        let future = FrameFuture::new(fb.grid().len());
        let comp = TileCompositor::new(fb.clone(), future.clone(), CameraParams::default());

        // Cell 0 gets two contributions before the frame completes.
        let desc = fb.grid().cell(0);
        comp.submit_tile(uniform_tile(&fb, desc, Vec4::new(1.0, 0.0, 0.0, 1.0)));
        comp.submit_tile(uniform_tile(&fb, desc, Vec4::new(0.0, 1.0, 0.0, 1.0)));
        assert_eq!(comp.received_count(0), 2);
        for cell in 1..4 {
            comp.submit_tile(uniform_tile(&fb, fb.grid().cell(cell), red()));
        }

        // Both contributions averaged, not the second discarded.
        let mapped = fb.map_color().unwrap();
        let px = mapped.as_rgba_f32()[0];
        assert!((px.x - 0.5).abs() < 1e-5);
        assert!((px.y - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_stale_tile_does_not_advance_completion() {
        let fb = make_fb(64, 64);
        let future = FrameFuture::new(fb.grid().len());
        let desc = fb.grid().cell(0);
        let stale = uniform_tile(&fb, desc, red());

        fb.clear();
        let comp = TileCompositor::new(fb.clone(), future.clone(), CameraParams::default());
        comp.submit_tile(stale);

        assert_eq!(comp.received_count(0), 0);
        assert!(!future.is_ready(SyncEvent::FrameFinished));
    }

    #[test]
    fn test_cancel_suppresses_frame_ops() {
        let fb = make_fb(128, 128);
        fb.set_ops(vec![Box::new(DebugOp)]).unwrap();
        let future = FrameFuture::new(fb.grid().len());
        let comp = TileCompositor::new(fb.clone(), future.clone(), CameraParams::default());

        let cells = fb.grid().cells().to_vec();
        for desc in &cells[..2] {
            comp.submit_tile(uniform_tile(&fb, *desc, red()));
        }
        future.cancel();
        for desc in &cells[2..] {
            comp.submit_tile(uniform_tile(&fb, *desc, red()));
        }

        assert_eq!(future.stage(), Stage::Cancelled(ember_fb::CancelReason::User));
        assert!(!future.is_ready(SyncEvent::FrameFinished));
        // The frame never resolved, so mapping stays a usage error.
        assert!(fb.map_color().is_err());
    }

    #[test]
    fn test_concurrent_workers_reach_the_barrier() {
        let fb = make_fb(256, 256);
        let future = FrameFuture::new(fb.grid().len());
        let comp = Arc::new(TileCompositor::new(
            fb.clone(),
            future.clone(),
            CameraParams::default(),
        ));

        let mut workers = Vec::new();
        for chunk in fb.grid().cells().chunks(4) {
            let comp = comp.clone();
            let fb = fb.clone();
            let chunk = chunk.to_vec();
            workers.push(std::thread::spawn(move || {
                for desc in chunk {
                    comp.submit_tile(uniform_tile(&fb, desc, red()));
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        future.wait(SyncEvent::FrameFinished).unwrap();
        let mapped = fb.map_color().unwrap();
        assert!(mapped.as_rgba_f32().iter().all(|px| (px.x - 1.0).abs() < 1e-5));
    }

    #[test]
    fn test_accumulation_persists_across_frames() {
        let fb = make_fb(64, 64);
        let desc = fb.grid().cell(0);

        for pass in 0..2 {
            let future = FrameFuture::new(fb.grid().len());
            let comp = TileCompositor::new(fb.clone(), future.clone(), CameraParams::default());
            let color = if pass == 0 {
                Vec4::new(1.0, 0.0, 0.0, 1.0)
            } else {
                Vec4::new(0.0, 0.0, 1.0, 1.0)
            };
            comp.submit_tile(uniform_tile(&fb, desc, color));
            assert!(future.is_ready(SyncEvent::FrameFinished));
        }

        // No clear in between: both frames' contributions averaged.
        let mapped = fb.map_color().unwrap();
        let px = mapped.as_rgba_f32()[0];
        assert!((px.x - 0.5).abs() < 1e-5);
        assert!((px.z - 0.5).abs() < 1e-5);
    }
}
