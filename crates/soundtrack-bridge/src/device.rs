//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for picking an output device and a stream
//! configuration suited to a target sample rate.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device whose name contains `needle`
/// (case-insensitive), or the host default when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let mut devices: Vec<cpal::Device> = host
        .output_devices()
        .context("No output devices")?
        .collect();

    if let Some(needle) = needle {
        if let Some(device) = devices.drain(..).find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        }) {
            return Ok(device);
        }
        return Err(anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the best supported output config for a target sample rate.
///
/// Rates at or below the target are preferred (highest first); when none
/// qualify, the lowest rate above the target wins. Without a target, the
/// highest supported rate wins. Ties break toward f32 output.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();
    if ranges.is_empty() {
        return Err(anyhow!("No supported output configs"));
    }

    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            at_or_below_target: target_rate.map(|t| rate <= t).unwrap_or(true),
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = match &best {
            None => true,
            Some((current, _)) => candidate.beats(current),
        };
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    match best {
        Some((_, config)) => Ok(config),
        None => Err(anyhow!("No supported output configs")),
    }
}

/// Prefer a fixed buffer size when the device advertises a range, capped to
/// keep callback latency sane.
///
/// Returns `None` when the device only supports its default buffer size.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            let chosen = if *max > MAX_FRAMES {
                if *min > MAX_FRAMES { *min } else { MAX_FRAMES }
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Print available output devices to stdout, for CLI use.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, device) in devices.enumerate() {
        println!("#{i}: {}", device.description()?);
    }
    Ok(())
}

struct Candidate {
    at_or_below_target: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn beats(&self, other: &Candidate) -> bool {
        if self.at_or_below_target != other.at_or_below_target {
            self.at_or_below_target
        } else if self.rate != other.rate {
            self.rate > other.rate
        } else {
            self.format_rank < other.format_rank
        }
    }
}

fn rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
