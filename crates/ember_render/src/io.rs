//! Debug image output.
//!
//! The engine owns no on-disk format; this is glue for dumping a finished
//! frame to PNG while developing.

use std::path::Path;

use thiserror::Error;

use ember_fb::framebuffer::color_to_rgba;
use ember_fb::FrameBuffer;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("framebuffer error: {0}")]
    Framebuffer(#[from] ember_fb::Error),

    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),
}

/// Write the finished frame's color channel as an 8-bit PNG.
pub fn write_png(fb: &FrameBuffer, path: impl AsRef<Path>) -> Result<(), WriteError> {
    let mapped = fb.map_color()?;
    let mut bytes = Vec::with_capacity(mapped.as_rgba_f32().len() * 4);
    for px in mapped.as_rgba_f32() {
        bytes.extend_from_slice(&color_to_rgba(*px));
    }
    let img = image::RgbaImage::from_raw(fb.width(), fb.height(), bytes)
        .expect("pixel count matches framebuffer extents");
    img.save(path)?;
    Ok(())
}
