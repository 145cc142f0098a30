//! Ember compositing - progressive frame assembly and distributed reduction.
//!
//! This crate drives a frame from tile submission to the finished signal:
//!
//! - **Tile compositor**: tracks received-vs-expected cells, feeds the
//!   accumulation buffer and enforces the completion barrier.
//! - **Reduction layer**: merges per-rank partial tiles (sum- or
//!   z-composite) before the compositor sees them.
//! - **Comm layer**: async rank endpoints and the gather thread.
//! - **Frame future**: the handle callers wait, poll and cancel on.

pub mod comm;
pub mod compositor;
pub mod future;
pub mod reduce;

pub use comm::{CommLayer, TileGatherer, TileMessage};
pub use compositor::TileCompositor;
pub use future::{FrameFuture, Stage};
pub use reduce::{ReductionPolicy, TileReducer};
