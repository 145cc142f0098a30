//! Example: Render a sphere progressively and write a PNG.
//!
//! Run with: cargo run --example render_sphere -- out.png
//!
//! Set RUST_LOG=debug to watch tiles flow through the compositor.

use std::env;
use std::sync::Arc;

use ember_fb::{ChannelFlags, ColorFormat, SyncEvent, Vec3, Vec4};
use ember_render::{
    write_png, Camera, Device, HeadlightRenderer, RenderConfig, Sphere,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let out = args.get(1).map(String::as_str).unwrap_or("sphere.png");

    let device = Device::new().expect("worker pool");
    let fb_key = device
        .create_framebuffer(
            512,
            512,
            ColorFormat::Srgba8,
            ChannelFlags::COLOR | ChannelFlags::DEPTH,
            Vec4::new(0.05, 0.05, 0.1, 1.0),
        )
        .expect("framebuffer");
    let renderer = device.create_renderer(Arc::new(HeadlightRenderer::new(RenderConfig {
        samples_per_pixel: 4,
        background: Vec4::new(0.05, 0.05, 0.1, 1.0),
    })));
    let world = device.create_world(Arc::new(Sphere {
        center: Vec3::new(0.0, 0.0, -3.0),
        radius: 1.0,
        albedo: Vec3::new(0.9, 0.3, 0.2),
    }));
    let camera = Camera::new().with_resolution(512, 512).with_clip(0.1, 10.0);

    // Four progressive passes into the same accumulation buffer.
    for pass in 0..4 {
        let future = device
            .render_frame(fb_key, renderer, &camera, world, ChannelFlags::COLOR)
            .expect("render");
        future.wait(SyncEvent::FrameFinished).expect("frame");
        println!(
            "pass {pass} finished in {:.1} ms",
            future.duration().unwrap_or(0.0) * 1000.0
        );
    }

    let fb = device.framebuffer(fb_key).expect("framebuffer handle");
    write_png(&fb, out).expect("write png");
    println!("wrote {out}");
}
