//! Pull-based audio file decoding.
//!
//! Uses Symphonia to probe the container/codec and decode packets into
//! interleaved `f32` samples on demand. Unlike a push pipeline, nothing is
//! decoded until the consumer asks: the engine's decoder threads pull
//! exactly as fast as they mix.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use soundtrack_types::SampleFormat;

use crate::stream::StreamSource;

/// Streaming decoder for one opened audio file.
///
/// `read` never returns more than the remaining data and returns 0 at end
/// of stream; there is no seeking.
pub struct AudioFileDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    sample_rate: u32,
    channels: usize,
    native_format: SampleFormat,
    n_frames: Option<u64>,
    pending: Vec<f32>,
    pending_pos: usize,
    finished: bool,
}

impl AudioFileDecoder {
    /// Probe and open `path`, selecting the default audio track.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| anyhow!("No default audio track"))?;
        let codec_params = track.codec_params.clone();

        let channels = codec_params
            .channels
            .ok_or_else(|| anyhow!("Unknown channels"))?
            .count();
        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;

        let decoder =
            symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            sample_rate,
            channels,
            native_format: native_sample_format(&codec_params),
            n_frames: codec_params.n_frames,
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Sample format the source stores, before the decode to f32.
    pub fn native_format(&self) -> SampleFormat {
        self.native_format
    }

    /// Total frame count when the container provides one.
    pub fn frames(&self) -> Option<u64> {
        self.n_frames
    }

    /// Read up to `out.len()` interleaved f32 samples. Returns the number
    /// of samples written; 0 means end of data (or a fatal decode
    /// condition, which ends the stream the same way).
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            if self.pending_pos >= self.pending.len() {
                if self.finished || !self.refill() {
                    break;
                }
            }
            let available = self.pending.len() - self.pending_pos;
            let take = available.min(out.len() - written);
            out[written..written + take]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
            self.pending_pos += take;
            written += take;
        }
        written
    }

    /// Decode packets until one yields samples. Returns false at end of
    /// stream. Packets that fail to decode are skipped.
    fn refill(&mut self) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(_) => {
                    self.finished = true;
                    return false;
                }
            };

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(_) => continue,
            };
            if decoded.frames() == 0 {
                continue;
            }

            let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending.extend_from_slice(sample_buf.samples());
            self.pending_pos = 0;
            return true;
        }
    }
}

impl StreamSource for AudioFileDecoder {
    fn read(&mut self, out: &mut [f32]) -> usize {
        AudioFileDecoder::read(self, out)
    }

    fn frames_hint(&self) -> Option<u64> {
        self.n_frames
    }
}

/// Sample format the stream reports for this source.
///
/// 8-bit sources report `Unsigned8` and 16-bit sources `Signed16`;
/// everything else decodes through `Float32`. The mapping is total, so an
/// unknown source format can never surface as a runtime error.
fn native_sample_format(params: &CodecParameters) -> SampleFormat {
    use symphonia::core::sample::SampleFormat as Native;
    match params.sample_format {
        Some(Native::U8 | Native::S8) => SampleFormat::Unsigned8,
        Some(Native::U16 | Native::S16) => SampleFormat::Signed16,
        Some(_) => SampleFormat::Float32,
        None => match params.bits_per_sample {
            Some(8) => SampleFormat::Unsigned8,
            Some(16) => SampleFormat::Signed16,
            _ => SampleFormat::Float32,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    /// Write a minimal PCM16 WAV file with a deterministic ramp payload.
    fn write_wav16(path: &Path, sample_rate: u32, channels: u16, frames: usize) {
        let data_len = frames * channels as usize * 2;
        let mut bytes = Vec::with_capacity(44 + data_len);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        bytes.extend_from_slice(&(channels * 2).to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&(data_len as u32).to_le_bytes());
        for i in 0..frames * channels as usize {
            let value = (i as i64 % 1000) as i16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn fixture_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("soundtrack-bridge-decoder-tests");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("{}-{}", std::process::id(), name))
    }

    #[test]
    fn open_reports_stream_parameters() {
        let path = fixture_path("params.wav");
        write_wav16(&path, 22_050, 2, 500);

        let decoder = AudioFileDecoder::open(&path).unwrap();
        assert_eq!(decoder.sample_rate(), 22_050);
        assert_eq!(decoder.channels(), 2);
        assert_eq!(decoder.native_format(), SampleFormat::Signed16);
        assert_eq!(decoder.frames(), Some(500));
    }

    #[test]
    fn read_drains_whole_stream_then_returns_zero() {
        let path = fixture_path("drain.wav");
        let frames = 700;
        write_wav16(&path, 44_100, 2, frames);

        let mut decoder = AudioFileDecoder::open(&path).unwrap();
        let mut total = 0usize;
        let mut buf = vec![0.0f32; 256];
        loop {
            let n = decoder.read(&mut buf);
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, frames * 2);
        assert_eq!(decoder.read(&mut buf), 0);
    }

    #[test]
    fn read_handles_partial_buffers() {
        let path = fixture_path("partial.wav");
        write_wav16(&path, 44_100, 1, 100);

        let mut decoder = AudioFileDecoder::open(&path).unwrap();
        // An odd buffer length forces copies that straddle packet
        // boundaries.
        let mut buf = vec![0.0f32; 33];
        let mut total = 0usize;
        loop {
            let n = decoder.read(&mut buf);
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn open_missing_file_fails() {
        let path = fixture_path("does-not-exist.wav");
        assert!(AudioFileDecoder::open(&path).is_err());
    }

    #[test]
    fn open_garbage_fails() {
        let path = fixture_path("garbage.wav");
        std::fs::write(&path, b"this is not audio").unwrap();
        assert!(AudioFileDecoder::open(&path).is_err());
    }
}
