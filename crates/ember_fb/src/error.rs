//! Error taxonomy for the compositing engine.

use std::fmt;

use thiserror::Error;

/// Why a frame ended up cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller asked for the frame to be aborted.
    User,
    /// The distributed gather did not complete within its wall-clock bound.
    Timeout,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::User => write!(f, "user cancel"),
            CancelReason::Timeout => write!(f, "reduction timeout"),
        }
    }
}

/// Errors surfaced by the framebuffer and compositing pipeline.
///
/// Stale-epoch tile contributions are deliberately *not* represented here:
/// they are an expected, frequent event in progressive rendering and are
/// dropped with a debug log instead of an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Attach/commit-time misconfiguration, e.g. a frame operator requiring a
    /// depth channel on a framebuffer that has none. Fatal to the attempt,
    /// recoverable by reconfiguring.
    #[error("configuration error: {0}")]
    Config(String),

    /// The per-framebuffer tile pool could not satisfy a render call.
    #[error("tile pool exhausted: {requested} tiles requested, {capacity} pooled")]
    TilePoolExhausted { requested: usize, capacity: usize },

    /// `map` was called before the frame reached its finished state.
    #[error("framebuffer mapped before the frame finished")]
    MapUnfinished,

    /// A handle passed to the device does not refer to a live object.
    #[error("invalid or stale object handle")]
    InvalidHandle,

    /// The frame was cancelled before it could finish.
    #[error("frame cancelled ({reason})")]
    Cancelled { reason: CancelReason },
}

pub type Result<T> = std::result::Result<T, Error>;
