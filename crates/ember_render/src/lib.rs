//! Ember render - the integration surface of the progressive renderer.
//!
//! Ties the framebuffer core and the compositing engine together behind a
//! device API: register framebuffers, renderers and worlds, then call
//! [`Device::render_frame`] to kick off a progressive pass and get back a
//! frame future to wait on.
//!
//! Ray traversal itself is an external service behind the
//! [`Intersect`](renderer::Intersect) trait; the built-in renderers exist to
//! exercise the pipeline, not to be a shading system.

mod camera;
mod device;
mod io;
mod ray;
mod renderer;

pub use camera::Camera;
pub use device::{Device, FrameBufferKey, RendererKey, WorldKey};
pub use io::{write_png, WriteError};
pub use ray::Ray;
pub use renderer::{
    render_tile, EmptyWorld, FlatRenderer, HeadlightRenderer, Hit, Intersect, RenderConfig,
    Renderer, Sphere,
};

/// Re-export the API types callers interact with.
pub use ember_comp::{FrameFuture, Stage};
pub use ember_fb::{ChannelFlags, ColorFormat, Error, Result, SyncEvent};
