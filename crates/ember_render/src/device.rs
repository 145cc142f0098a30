//! Device: object registry and the render entry point.
//!
//! The device owns a slot-map registry of framebuffers, renderers and worlds.
//! Keys are generation counted, so a key kept across a release refers to
//! nothing instead of silently aliasing a recycled slot.
//!
//! `render_frame` acquires the frame's tiles up front (so pool exhaustion
//! surfaces synchronously), then fans tile jobs out over a rayon worker pool.
//! Workers check for cancellation between tiles; an in-flight tile is
//! finished and dropped rather than preempted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use log::info;
use slotmap::{new_key_type, SlotMap};

use ember_comp::{FrameFuture, TileCompositor};
use ember_fb::{ChannelFlags, ColorFormat, Error, FrameBuffer, Result, Vec4};

use crate::camera::Camera;
use crate::renderer::{render_tile, Intersect, Renderer};

new_key_type! {
    pub struct FrameBufferKey;
    pub struct RendererKey;
    pub struct WorldKey;
}

pub struct Device {
    framebuffers: RwLock<SlotMap<FrameBufferKey, Arc<FrameBuffer>>>,
    renderers: RwLock<SlotMap<RendererKey, Arc<dyn Renderer>>>,
    worlds: RwLock<SlotMap<WorldKey, Arc<dyn Intersect>>>,
    pool: rayon::ThreadPool,
    frame_counter: AtomicU32,
}

impl Device {
    /// A device with one worker per hardware thread.
    pub fn new() -> Result<Self> {
        Self::with_threads(0)
    }

    /// A device with a fixed worker count (0 = hardware concurrency).
    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| Error::Config(format!("worker pool: {e}")))?;
        Ok(Self {
            framebuffers: RwLock::new(SlotMap::with_key()),
            renderers: RwLock::new(SlotMap::with_key()),
            worlds: RwLock::new(SlotMap::with_key()),
            pool,
            frame_counter: AtomicU32::new(0),
        })
    }

    // ---------------------------------------------------------------------
    // Registry

    pub fn create_framebuffer(
        &self,
        width: u32,
        height: u32,
        format: ColorFormat,
        channels: ChannelFlags,
        background: Vec4,
    ) -> Result<FrameBufferKey> {
        let fb = Arc::new(FrameBuffer::new(width, height, format, channels, background)?);
        Ok(self.framebuffers.write().unwrap().insert(fb))
    }

    pub fn framebuffer(&self, key: FrameBufferKey) -> Result<Arc<FrameBuffer>> {
        self.framebuffers
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    pub fn release_framebuffer(&self, key: FrameBufferKey) -> Result<()> {
        self.framebuffers
            .write()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or(Error::InvalidHandle)
    }

    pub fn create_renderer(&self, renderer: Arc<dyn Renderer>) -> RendererKey {
        self.renderers.write().unwrap().insert(renderer)
    }

    pub fn renderer(&self, key: RendererKey) -> Result<Arc<dyn Renderer>> {
        self.renderers
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    pub fn release_renderer(&self, key: RendererKey) -> Result<()> {
        self.renderers
            .write()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or(Error::InvalidHandle)
    }

    pub fn create_world(&self, world: Arc<dyn Intersect>) -> WorldKey {
        self.worlds.write().unwrap().insert(world)
    }

    pub fn world(&self, key: WorldKey) -> Result<Arc<dyn Intersect>> {
        self.worlds
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    pub fn release_world(&self, key: WorldKey) -> Result<()> {
        self.worlds
            .write()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or(Error::InvalidHandle)
    }

    // ---------------------------------------------------------------------
    // Rendering

    /// Kick off one progressive pass over the whole image and return the
    /// frame's future. Tiles are walked center-out; each worker renders and
    /// submits disjoint tiles.
    pub fn render_frame(
        &self,
        fb_key: FrameBufferKey,
        renderer_key: RendererKey,
        camera: &Camera,
        world_key: WorldKey,
        channels: ChannelFlags,
    ) -> Result<Arc<FrameFuture>> {
        let fb = self.framebuffer(fb_key)?;
        let renderer = self.renderer(renderer_key)?;
        let world = self.world(world_key)?;

        let mut camera = camera.clone();
        camera.initialize();
        let camera = Arc::new(camera);

        let descs = fb.grid().spiral_order();
        // Synchronous failure path: take every tile before any work starts.
        let tiles = fb.pool().acquire_all(&descs, fb.epoch(), 0)?;

        let future = FrameFuture::new(fb.grid().len());
        let compositor = Arc::new(TileCompositor::new(fb.clone(), future.clone(), camera.params()));
        let pass = self.frame_counter.fetch_add(1, Ordering::Relaxed);

        info!(
            "rendering pass {pass}: {}x{} in {} tiles",
            fb.width(),
            fb.height(),
            descs.len()
        );

        for tile in tiles {
            let compositor = compositor.clone();
            let camera = camera.clone();
            let renderer = renderer.clone();
            let world = world.clone();
            let future = future.clone();
            self.pool.spawn(move || {
                let mut tile = tile;
                if future.is_cancelled() {
                    compositor.framebuffer().pool().release(tile);
                    return;
                }
                render_tile(&*renderer, &camera, &*world, &mut tile, pass, channels);
                compositor.submit_tile(tile);
            });
        }

        Ok(future)
    }
}
