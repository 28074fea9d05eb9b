//! Simple tessera test client
//!
//! Connects to the server, creates a swapchain, and renders a few frames
//! of solid colour into it.
//! Run with: cargo run --example test_client [SOCKET] [FRAMES]

use std::fs::File;
use std::time::Duration;

use anyhow::Context;
use memmap2::MmapMut;
use tessera::compositor::format;
use tessera::config::ServerConfig;
use tessera::ipc::protocol::{CreateSwapchainArgs, Event, Layer, SwapchainUsage};
use tessera::ipc::Connection;

const WIDTH: u32 = 256;
const HEIGHT: u32 = 256;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let socket = args
        .next()
        .or_else(|| std::env::var("TESSERA_SOCKET").ok())
        .unwrap_or_else(|| ServerConfig::default().socket_path);
    let frames: u32 = match args.next() {
        Some(n) => n.parse().context("FRAMES must be a number")?,
        None => 120,
    };

    println!("Connecting to {}...", socket);
    let mut conn = Connection::connect(&socket)?;
    println!(
        "Connected as session {} ({} swapchain slots)",
        conn.session_id(),
        conn.max_swapchains()
    );

    conn.set_client_info(std::process::id(), "test_client")?;
    conn.begin_session()?;

    let swapchain = conn.create_swapchain(&CreateSwapchainArgs {
        format: format::ARGB8888,
        width: WIDTH,
        height: HEIGHT,
        image_count: 3,
        usage: SwapchainUsage::COLOR.bits(),
    })?;
    println!(
        "Swapchain {} with {} images of {} bytes",
        swapchain.index,
        swapchain.images.len(),
        swapchain.image_size
    );

    let mut images = Vec::with_capacity(swapchain.images.len());
    for fd in &swapchain.images {
        let file = File::from(fd.try_clone()?);
        // The server created the image at this size and never shrinks it.
        let map = unsafe { MmapMut::map_mut(&file)? };
        images.push(map);
    }

    for frame in 0..frames {
        let prediction = conn.predict_frame()?;
        conn.wait_woke(prediction.frame_id)?;
        conn.begin_frame(prediction.frame_id)?;

        let image = conn.acquire_image(swapchain.index)?;
        conn.wait_image(swapchain.index, image, Duration::from_millis(100))?;
        fill(&mut images[image as usize], frame);
        conn.release_image(swapchain.index, image)?;

        let sequence =
            conn.submit_frame(prediction.frame_id, &[Layer::quad(swapchain.index, image)])?;
        if frame % 30 == 0 {
            println!("Frame {} published as {}", prediction.frame_id, sequence);
        }

        for event in conn.take_events() {
            match event.event {
                Event::SessionLossPending => {
                    println!("Server is shutting down");
                    return Ok(());
                }
                other => println!("Event {}: {:?}", event.sequence, other),
            }
        }
    }

    conn.destroy_swapchain(swapchain.index)?;
    conn.end_session()?;
    println!("Done");
    Ok(())
}

fn fill(image: &mut [u8], frame: u32) {
    let shade = (frame * 4 % 256) as u8;
    for pixel in image.chunks_exact_mut(4) {
        pixel.copy_from_slice(&[shade, 0x40, 0xff - shade, 0xff]);
    }
}
