//! Soundtrack bridge CLI — diagnostics for the stream adapter and the
//! output path.
//!
//! ## Commands
//! - `devices`: list CPAL output devices.
//! - `probe`: open a file through the file-stream adapter and print the
//!   descriptor the engine would see.
//! - `play`: decode a file and play it through the CPAL output. The output
//!   targets the file's native rate (nearest supported device rate — there
//!   is no resampler in this path).

mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use soundtrack_bridge::decoder::AudioFileDecoder;
use soundtrack_bridge::device;
use soundtrack_bridge::engine::EngineDelegate;
use soundtrack_bridge::output::{CpalOutput, OutputConfig, PlayingStream, StreamOutput};
use soundtrack_bridge::render::RenderPull;
use soundtrack_bridge::stream::FileStreamDelegate;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match &args.cmd {
        cli::Command::Devices => {
            let host = cpal::default_host();
            device::list_devices(&host)?;
        }
        cli::Command::Probe {
            name,
            search_path,
            headphones,
        } => probe(&args, name, search_path.clone(), *headphones)?,
        cli::Command::Play { name, search_path } => play(&args, name, search_path.clone())?,
    }

    Ok(())
}

fn probe(
    args: &cli::Args,
    name: &str,
    search_path: Option<PathBuf>,
    headphones: bool,
) -> Result<()> {
    let output = Arc::new(CpalOutput::new(OutputConfig {
        device: args.device.clone(),
        target_sample_rate: None,
        headphones,
    }));
    let delegate = FileStreamDelegate::new(output);
    delegate.set_search_path(search_path);

    let stream = delegate
        .open_stream(name)
        .ok_or_else(|| anyhow!("could not open stream: {name}"))?;

    println!("sample rate: {} Hz", stream.sample_rate());
    println!("layout:      {:?}", stream.layout());
    println!("format:      {:?}", stream.format());
    match stream.frames_hint() {
        Some(frames) => println!("frames:      {frames}"),
        None => println!("frames:      unknown"),
    }
    Ok(())
}

fn play(args: &cli::Args, name: &str, search_path: Option<PathBuf>) -> Result<()> {
    let path = match search_path {
        Some(base) => base.join(name),
        None => PathBuf::from(name),
    };
    let decoder = AudioFileDecoder::open(&path)?;
    let channels = decoder.channels() as u16;
    let rate = decoder.sample_rate();
    tracing::info!(rate_hz = rate, channels, path = %path.display(), "playing");

    let output = CpalOutput::new(OutputConfig {
        device: args.device.clone(),
        target_sample_rate: Some(rate),
        headphones: false,
    });
    let handle = output.play_stream(
        Box::new(FileRenderer {
            decoder,
            done: false,
        }),
        channels,
    )?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_signal = stop.clone();
    let _ = ctrlc::set_handler(move || stop_for_signal.store(true, Ordering::Relaxed));

    while handle.is_playing() && !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

/// Render pull source that drains one decoded file.
struct FileRenderer {
    decoder: AudioFileDecoder,
    done: bool,
}

impl RenderPull for FileRenderer {
    fn turn_handle(&mut self, out: &mut [f32]) -> bool {
        if self.done {
            return false;
        }
        let n = self.decoder.read(out);
        if n == 0 {
            self.done = true;
            return false;
        }
        if n < out.len() {
            // Zero the tail of the final buffer; end is reported on the
            // next turn so the tail plays out.
            out[n..].fill(0.0);
            self.done = true;
        }
        true
    }
}
