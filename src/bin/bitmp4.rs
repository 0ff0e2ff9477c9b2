//! bitmp4 - render a synthetic animation and record it to an MP4 file.
//!
//! Usage:
//!   bitmp4 [options]
//!
//! Options:
//!   --output <path>         Output file (default: bitmp4.mp4)
//!   --size <WxH>            Frame size (default: 320x240)
//!   --frames <n>            Number of frames to render (default: 60)
//!   --delay-ms <ms>         Delay between frames (default: 50)
//!   --compression <level>   low, mid or high (default: low)
//!   --fragment-ms <ms>      Target fragment duration (default: 1000)
//!   --stop-after <n>        Stop (abandon backlog) after n frames instead of finishing

use anyhow::{Context, Result};
use bitmp4::mp4::{read_samples, read_track_table};
use bitmp4::{
    pack_argb, CompressionLevel, EncodeOutcome, Encoder, EncodingOptions, Frame, SoftwareBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Args {
    output: String,
    width: u32,
    height: u32,
    frames: u32,
    delay: Duration,
    compression: CompressionLevel,
    fragment_ms: u32,
    stop_after: Option<u32>,
}

fn parse_size(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once(['x', 'X'])?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        output: "bitmp4.mp4".to_string(),
        width: 320,
        height: 240,
        frames: 60,
        delay: bitmp4::DEFAULT_FRAME_DELAY,
        compression: CompressionLevel::default(),
        fragment_ms: bitmp4::mp4::DEFAULT_FRAGMENT_DURATION_MS,
        stop_after: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--output" | "-o" if i + 1 < args.len() => {
                parsed.output = args[i + 1].clone();
                i += 2;
            }
            "--size" if i + 1 < args.len() => {
                let (w, h) = parse_size(&args[i + 1])
                    .with_context(|| format!("invalid size '{}', expected WxH", args[i + 1]))?;
                parsed.width = w;
                parsed.height = h;
                i += 2;
            }
            "--frames" if i + 1 < args.len() => {
                parsed.frames = args[i + 1].parse().context("invalid --frames")?;
                i += 2;
            }
            "--delay-ms" if i + 1 < args.len() => {
                let ms: u64 = args[i + 1].parse().context("invalid --delay-ms")?;
                parsed.delay = Duration::from_millis(ms);
                i += 2;
            }
            "--compression" if i + 1 < args.len() => {
                parsed.compression = args[i + 1].parse()?;
                i += 2;
            }
            "--fragment-ms" if i + 1 < args.len() => {
                parsed.fragment_ms = args[i + 1].parse().context("invalid --fragment-ms")?;
                i += 2;
            }
            "--stop-after" if i + 1 < args.len() => {
                parsed.stop_after = Some(args[i + 1].parse().context("invalid --stop-after")?);
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
                i += 1;
            }
        }
    }
    Ok(parsed)
}

fn print_usage() {
    println!("bitmp4 - records a synthetic animation to an MP4 file");
    println!();
    println!("Usage: bitmp4 [options]");
    println!();
    println!("Options:");
    println!("  --output <path>         Output file (default: bitmp4.mp4)");
    println!("  --size <WxH>            Frame size (default: 320x240)");
    println!("  --frames <n>            Number of frames to render (default: 60)");
    println!("  --delay-ms <ms>         Delay between frames (default: 50)");
    println!("  --compression <level>   low, mid or high (default: low)");
    println!("  --fragment-ms <ms>      Target fragment duration (default: 1000)");
    println!("  --stop-after <n>        Stop after n frames, abandoning queued frames");
    println!();
    println!("Examples:");
    println!("  bitmp4 --output demo.mp4 --size 640x480 --frames 100");
    println!("  bitmp4 --frames 40 --stop-after 10");
}

/// A gradient background with a square moving across it.
fn render_frame(width: u32, height: u32, t: u32) -> Result<Frame> {
    let side = (width.min(height) / 4).max(2);
    let span = width.saturating_sub(side).max(1);
    let square_x = (t * 8) % span;
    let square_y = (height - side.min(height)) / 2;

    let mut pixels = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let inside = x >= square_x
                && x < square_x + side
                && y >= square_y
                && y < square_y + side;
            let pixel = if inside {
                pack_argb(0xFF, 0xFF, 0xFF, 0xFF)
            } else {
                let r = (x * 255 / width.max(1)) as u8;
                let g = (y * 255 / height.max(1)) as u8;
                let b = ((t * 4) & 0xFF) as u8;
                pack_argb(0xFF, r, g, b)
            };
            pixels.push(pixel);
        }
    }
    Ok(Frame::new(width, height, pixels)?)
}

fn print_report(path: &str) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path))?;
    let tracks = read_track_table(&data)?;
    let samples = read_samples(&data)?;

    println!();
    println!("File:       {} ({} bytes)", path, data.len());
    for track in &tracks {
        let count = samples.get(&track.track_id).map_or(0, |s| s.len());
        let detail = if track.is_video() {
            format!("{}x{}", track.width, track.height)
        } else {
            format!("{} Hz, {} ch", track.sample_rate, track.channels)
        };
        println!(
            "Track {}:    {} {} ({}), timescale {}, {} samples",
            track.track_id,
            String::from_utf8_lossy(&track.handler),
            String::from_utf8_lossy(&track.sample_entry),
            detail,
            track.timescale,
            count
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bitmp4=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = parse_args()?;
    let cancel = CancellationToken::new();

    // Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received, stopping...");
        cancel_clone.cancel();
    });

    println!();
    println!("========================================");
    println!("bitmp4");
    println!("========================================");
    println!("Output:      {}", args.output);
    println!("Size:        {}x{}", args.width, args.height);
    println!("Frames:      {}", args.frames);
    println!("Delay:       {} ms", args.delay.as_millis());
    println!("Compression: {}", args.compression);
    println!("========================================");

    let options = EncodingOptions::new(&args.output)
        .output_size(args.width, args.height)
        .frame_delay(args.delay)
        .compression(args.compression);
    let backend = SoftwareBackend::new().fragment_duration_ms(args.fragment_ms);
    let mut encoder = Encoder::with_backend(options, Arc::new(backend));
    let completion = encoder.start()?;

    let mut stopped = false;
    for t in 0..args.frames {
        if cancel.is_cancelled() || args.stop_after == Some(t) {
            encoder.stop();
            stopped = true;
            break;
        }
        encoder.add_frame(render_frame(args.width, args.height, t)?);
        tokio::time::sleep(args.delay).await;
    }
    if !stopped {
        encoder.finish();
    }

    match completion.wait().await? {
        EncodeOutcome::Completed(summary) => {
            println!(
                "{} {} frames ({} skipped, {} busy), {} video / {} audio samples",
                if summary.interrupted { "Stopped after" } else { "Encoded" },
                summary.frames_added,
                summary.frames_skipped,
                summary.frames_busy,
                summary.video_samples,
                summary.audio_samples
            );
            print_report(&args.output)?;
        }
        EncodeOutcome::Failed { summary, error } => {
            anyhow::bail!(
                "{} was not written after {} frames: {}",
                summary.output_path.display(),
                summary.frames_added,
                error
            );
        }
        EncodeOutcome::NoFrames => println!("No frames were recorded, nothing written"),
    }
    Ok(())
}
