//! Channel flags, color formats and sync events exposed to the API layer.

use bitflags::bitflags;

bitflags! {
    /// Which framebuffer channels are allocated / requested.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelFlags: u32 {
        const COLOR  = 1 << 0;
        const DEPTH  = 1 << 1;
        const NORMAL = 1 << 2;
        const ALBEDO = 1 << 3;
        const ACCUM  = 1 << 4;
    }
}

/// Externally presented color buffer format.
///
/// The accumulation buffer is always float precision internally; this only
/// controls what `map` hands back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    /// 8-bit per channel, gamma encoded on readout.
    Srgba8,
    /// 32-bit float per channel, linear.
    Rgba32F,
}

/// Milestones a caller can wait on through the frame future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncEvent {
    /// All expected tiles for the frame have been received.
    WorldRendered,
    /// The frame operator chain has run; the buffer is presentable.
    FrameFinished,
    /// All bookkeeping for the render task is done.
    TaskFinished,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_flags_combine() {
        let flags = ChannelFlags::COLOR | ChannelFlags::DEPTH;
        assert!(flags.contains(ChannelFlags::COLOR));
        assert!(flags.contains(ChannelFlags::DEPTH));
        assert!(!flags.contains(ChannelFlags::NORMAL));
    }

    #[test]
    fn test_sync_event_ordering() {
        assert!(SyncEvent::WorldRendered < SyncEvent::FrameFinished);
        assert!(SyncEvent::FrameFinished < SyncEvent::TaskFinished);
    }
}
