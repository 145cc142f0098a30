//! Ember framebuffer core - tiles, accumulation and frame operators.
//!
//! This crate holds the data model of the progressive renderer:
//!
//! - **Tiles**: fixed-size pixel regions carrying color, depth, normal and
//!   albedo, the unit of work a render worker produces.
//! - **Accumulation buffer**: per-pixel running sum/count enabling progressive
//!   refinement across frames, with epoch tagging to reject stale tiles.
//! - **Framebuffer**: channel negotiation (8-bit sRGB vs 32-bit float),
//!   map/unmap of finished frames.
//! - **Frame operators**: tone-mapping, depth visualization and denoise passes
//!   run over the composited image.

pub mod accum;
pub mod channel;
pub mod error;
pub mod framebuffer;
pub mod grid;
pub mod ops;
pub mod tile;

pub use accum::AccumBuffer;
pub use channel::{ChannelFlags, ColorFormat, SyncEvent};
pub use error::{CancelReason, Error, Result};
pub use framebuffer::{FrameBuffer, FrameBufferView, MappedColor};
pub use grid::TileGrid;
pub use ops::{
    CameraParams, DebugOp, DenoiseOp, DepthNormalizeOp, FrameOp, LiveFrameOp, SsaoOp, ToneMapOp,
};
pub use tile::{Sample, Tile, TileDesc, TilePool, TILE_PIXELS, TILE_SIZE};

/// Re-export the math types used throughout the pixel pipeline.
pub use glam::{Vec3, Vec4};
