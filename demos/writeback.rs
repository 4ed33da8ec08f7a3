//! Composites a moving box over a gradient on a real writeback connector.
//!
//! ```sh
//! RUST_LOG=kms_compositor=debug cargo run --example writeback -- --frames 120 --output out.nv12
//! ```

use std::{fs::File, io::Write, path::PathBuf};

use clap::Parser;
use kms_compositor::{
    compositor::{CompositorSettings, CompositorState, KmsCompositor, PropertyValue},
    video::{
        AllocationQuery, CapsStructure, Memory, Range, SystemMemory, VideoBuffer, VideoCaps, VideoFormat,
        VideoInfo, VideoMeta,
    },
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Composite two generated streams through a KMS writeback connector")]
struct Args {
    /// Drm driver to open, probed if neither driver nor bus id is given
    #[arg(long)]
    driver: Option<String>,
    /// Bus id of the device to open
    #[arg(long)]
    bus_id: Option<String>,
    /// Writeback connector id
    #[arg(long)]
    connector: Option<u32>,
    /// Output width
    #[arg(long, default_value_t = 1280)]
    width: i32,
    /// Output height
    #[arg(long, default_value_t = 720)]
    height: i32,
    /// Number of frames to composite
    #[arg(long, default_value_t = 60)]
    frames: u32,
    /// Write raw NV12 output frames to this file
    #[arg(long)]
    output: Option<PathBuf>,
    /// Hand out dma-buf backed output frames
    #[arg(long)]
    dmabuf: bool,
}

fn gradient(info: &VideoInfo) -> VideoBuffer {
    let mut data = vec![0u8; info.size];
    let stride = info.strides[0] as usize;
    for row in 0..info.height as usize {
        for col in 0..info.width as usize {
            let px = &mut data[row * stride + col * 4..][..4];
            px[0] = (col * 255 / info.width as usize) as u8;
            px[1] = (row * 255 / info.height as usize) as u8;
            px[2] = 0x80;
        }
    }
    VideoBuffer::builder()
        .memory(Memory::System(SystemMemory::from_vec(data)))
        .video_meta(VideoMeta::from_info(info))
        .build()
}

fn solid(info: &VideoInfo, bgrx: [u8; 4]) -> VideoBuffer {
    let data = bgrx.iter().copied().cycle().take(info.size).collect();
    VideoBuffer::builder()
        .memory(Memory::System(SystemMemory::from_vec(data)))
        .video_meta(VideoMeta::from_info(info))
        .build()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut compositor = KmsCompositor::new(CompositorSettings {
        driver_name: args.driver,
        bus_id: args.bus_id,
        connector_id: args.connector,
        ..CompositorSettings::from_env()
    });
    compositor.set_state(CompositorState::Paused)?;
    info!(
        connector = compositor.connector_id(),
        crtc = compositor.crtc_id(),
        pads = compositor.pads().len(),
        "Device opened"
    );

    let background = VideoInfo::new(VideoFormat::Bgrx, args.width as u32, args.height as u32);
    let overlay = VideoInfo::new(VideoFormat::Bgrx, 160, 160);
    let pads = compositor.pads().to_vec();
    pads[0].set_caps(&background.to_caps())?;
    if let Some(pad) = pads.get(1) {
        pad.set_caps(&overlay.to_caps())?;
        pad.set_property("alpha", &PropertyValue::Double(0.75))?;
    } else {
        warn!("Only one plane available, compositing the background alone");
    }

    let downstream = VideoCaps::new(
        CapsStructure::new([VideoFormat::Nv12])
            .with_size(Range::fixed(args.width), Range::fixed(args.height))
            .with_dmabuf(args.dmabuf),
    );
    let caps = compositor.negotiate(Some(&downstream))?;
    info!(%caps, "Negotiated");
    let mut query = AllocationQuery::new(caps, true);
    compositor.decide_allocation(&mut query)?;
    compositor.set_state(CompositorState::Playing)?;

    let mut output = args.output.map(File::create).transpose()?;
    let out_size = compositor.src_info().map_or(0, |info| info.size);
    let background = gradient(&background);
    let overlay = solid(&overlay, [0x20, 0x40, 0xe0, 0xff]);
    for frame in 0..args.frames {
        pads[0].push_buffer(background.clone());
        if let Some(pad) = pads.get(1) {
            let x = (frame as i32 * 8) % (args.width - 160).max(1);
            pad.set_position(x, args.height / 2 - 80);
            pad.push_buffer(overlay.clone());
        }
        let buffer = compositor.aggregate()?;
        if let Some(file) = &mut output {
            let map = buffer.map()?;
            if let Some(bytes) = map.range(0, out_size) {
                file.write_all(bytes)?;
            }
        }
    }
    info!(frames = args.frames, "Done");

    compositor.set_state(CompositorState::Closed)?;
    Ok(())
}
