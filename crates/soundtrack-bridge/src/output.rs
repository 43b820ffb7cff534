//! Output backend driving a render pull source.
//!
//! [`StreamOutput`] is the seam between the lifecycle controller and
//! whatever owns the real-time audio callback. [`CpalOutput`] is the CPAL
//! implementation: it builds an output stream whose callback pulls
//! interleaved f32 from the registered [`RenderPull`] source, maps source
//! channels onto the device channel count, and converts to the device
//! sample format.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::device;
use crate::render::RenderPull;

/// Where render pull sources get registered.
///
/// Implementations are shared between the lifecycle controller (activation,
/// sample-rate query) and the file-stream delegate (headphone-profile
/// query, possibly from the engine's decoder threads), hence `Send + Sync`.
pub trait StreamOutput: Send + Sync {
    /// Whether an output device is currently available. Checked before
    /// every activation.
    fn is_available(&self) -> bool;

    /// Output sample rate in Hz the engine should be configured with.
    fn sample_rate(&self) -> u32;

    /// Whether a binaural/headphone profile is active on the output.
    fn headphones(&self) -> bool;

    /// Register `source` for periodic render turns until the returned
    /// handle is dropped. `source_channels` is the interleaved channel
    /// count `source` produces.
    fn play_stream(
        &self,
        source: Box<dyn RenderPull>,
        source_channels: u16,
    ) -> Result<Box<dyn PlayingStream>>;
}

/// Handle for a registered render source. Dropping it stops the turns.
pub trait PlayingStream {
    /// False once the source has reported end-of-stream. The stream keeps
    /// taking (cheap, inactive) turns until the handle is dropped, so a
    /// lifecycle deactivation still completes after this turns false.
    fn is_playing(&self) -> bool;
}

/// Configuration for [`CpalOutput`].
#[derive(Clone, Debug, Default)]
pub struct OutputConfig {
    /// Output device substring (case-insensitive); host default when unset.
    pub device: Option<String>,
    /// Preferred output sample rate; the device's best rate when unset.
    pub target_sample_rate: Option<u32>,
    /// Advertise a binaural/headphone profile to stream producers.
    pub headphones: bool,
}

/// CPAL-backed output.
pub struct CpalOutput {
    config: OutputConfig,
}

const FALLBACK_SAMPLE_RATE: u32 = 48_000;

impl CpalOutput {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }

    fn resolved_config(&self) -> Result<(cpal::Device, cpal::SupportedStreamConfig)> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, self.config.device.as_deref())?;
        let supported = device::pick_output_config(&device, self.config.target_sample_rate)?;
        Ok((device, supported))
    }
}

impl StreamOutput for CpalOutput {
    fn is_available(&self) -> bool {
        cpal::default_host().default_output_device().is_some()
    }

    fn sample_rate(&self) -> u32 {
        match self.resolved_config() {
            Ok((_, supported)) => supported.sample_rate(),
            Err(e) => {
                tracing::warn!(
                    "output rate query failed, assuming {FALLBACK_SAMPLE_RATE} Hz: {e:#}"
                );
                FALLBACK_SAMPLE_RATE
            }
        }
    }

    fn headphones(&self) -> bool {
        self.config.headphones
    }

    fn play_stream(
        &self,
        source: Box<dyn RenderPull>,
        source_channels: u16,
    ) -> Result<Box<dyn PlayingStream>> {
        let (device, supported) = self.resolved_config()?;
        let mut stream_config: cpal::StreamConfig = supported.clone().into();
        if let Some(buffer) = device::pick_buffer_size(&supported) {
            stream_config.buffer_size = buffer;
        }
        let device_name = device
            .description()
            .ok()
            .map(|d| d.to_string())
            .unwrap_or_default();
        tracing::debug!(
            device = %device_name,
            rate_hz = stream_config.sample_rate,
            buffer_size = ?stream_config.buffer_size,
            "output stream starting"
        );

        let finished = Arc::new(AtomicBool::new(false));
        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &stream_config, source, source_channels, &finished)
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &stream_config, source, source_channels, &finished)
            }
            cpal::SampleFormat::I32 => {
                build_stream::<i32>(&device, &stream_config, source, source_channels, &finished)
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, &stream_config, source, source_channels, &finished)
            }
            other => Err(anyhow!("Unsupported sample format: {other:?}")),
        }?;
        stream.play()?;

        Ok(Box::new(CpalStream {
            _stream: stream,
            finished,
        }))
    }
}

struct CpalStream {
    _stream: cpal::Stream,
    finished: Arc<AtomicBool>,
}

impl PlayingStream for CpalStream {
    fn is_playing(&self) -> bool {
        !self.finished.load(Ordering::Relaxed)
    }
}

/// Type-specialized stream builder for the CPAL sample formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut source: Box<dyn RenderPull>,
    source_channels: u16,
    finished: &Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let src_channels = source_channels.max(1) as usize;
    let mut scratch: Vec<f32> = Vec::new();
    let finished = finished.clone();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / channels_out;
            let needed = frames * src_channels;
            if scratch.len() < needed {
                // Grows on the first callback only; steady state reuses it.
                scratch.resize(needed, 0.0);
            }

            // The source is pulled every turn, even after it reports end:
            // lifecycle reconciliation happens inside these turns.
            let alive = source.turn_handle(&mut scratch[..needed]);
            if !alive {
                finished.store(true, Ordering::Relaxed);
                data.fill(<T as cpal::Sample>::from_sample::<f32>(0.0));
                return;
            }

            for frame in 0..frames {
                for ch in 0..channels_out {
                    let sample = mapped_sample(&scratch, src_channels, frame, channels_out, ch);
                    data[frame * channels_out + ch] =
                        <T as cpal::Sample>::from_sample::<f32>(sample);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Map one source frame onto a destination channel.
///
/// Mapping rules:
/// - mono → any: duplicate channel 0
/// - stereo → mono: average L/R
/// - stereo → multichannel: L/R into the first two, repeat for the rest
/// - other layouts: clamp to available channels
fn mapped_sample(
    src: &[f32],
    src_channels: usize,
    frame: usize,
    dst_channels: usize,
    dst_ch: usize,
) -> f32 {
    let base = frame * src_channels;
    let get = |ch: usize| src.get(base + ch).copied().unwrap_or(0.0);
    match (src_channels, dst_channels) {
        (1, _) => get(0),
        (2, 1) => 0.5 * (get(0) + get(1)),
        (2, _) => get(dst_ch.min(1)),
        _ => get(dst_ch.min(src_channels - 1)),
    }
}
