//! Sound streams and the file-stream delegate.
//!
//! [`SoundStream`] is the descriptor the engine receives for every opened
//! music file: format metadata plus a pull source it reads to exhaustion
//! and then drops. [`FileStreamDelegate`] implements the engine's delegate
//! callbacks on top of a search path and [`AudioFileDecoder`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use soundtrack_types::{SampleFormat, SpeakerLayout};

use crate::decoder::AudioFileDecoder;
use crate::engine::EngineDelegate;
use crate::output::StreamOutput;

/// Pull source backing one opened stream. Dropping it closes the decoder;
/// that drop happens exactly once, when the engine drops the stream.
pub trait StreamSource: Send {
    /// Read up to `out.len()` interleaved f32 samples; 0 means end of
    /// data. Never a negative-style error: failures end the stream.
    fn read(&mut self, out: &mut [f32]) -> usize;

    /// Estimated total frame count, when the container provides one.
    fn frames_hint(&self) -> Option<u64>;
}

/// Descriptor for one opened stream: derived metadata plus the source the
/// engine pulls samples from. No seek, skip, or clone support.
pub struct SoundStream {
    sample_rate: u32,
    layout: SpeakerLayout,
    format: SampleFormat,
    source: Box<dyn StreamSource>,
}

impl SoundStream {
    pub fn new(
        sample_rate: u32,
        layout: SpeakerLayout,
        format: SampleFormat,
        source: Box<dyn StreamSource>,
    ) -> Self {
        debug_assert!(sample_rate > 0);
        Self {
            sample_rate,
            layout,
            format,
            source,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn layout(&self) -> SpeakerLayout {
        self.layout
    }

    /// Native format of the source (samples are delivered as f32).
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn frames_hint(&self) -> Option<u64> {
        self.source.frames_hint()
    }

    pub fn read(&mut self, out: &mut [f32]) -> usize {
        self.source.read(out)
    }
}

/// Engine delegate that opens music files from disk.
///
/// Stream opens run on the engine's decoder threads and may be concurrent
/// across streams; the search path is the only shared mutable state, and
/// its lock is held only long enough to copy the value out — never across
/// any I/O.
pub struct FileStreamDelegate {
    search_path: Mutex<Option<PathBuf>>,
    output: Arc<dyn StreamOutput>,
}

impl FileStreamDelegate {
    pub fn new(output: Arc<dyn StreamOutput>) -> Self {
        Self {
            search_path: Mutex::new(None),
            output,
        }
    }

    /// Replace the base path used to resolve relative stream names.
    /// Callable from any thread; takes effect for the next open.
    pub fn set_search_path(&self, path: Option<PathBuf>) {
        *self.search_path.lock().unwrap() = path;
    }

    /// Current search path (copied out under the lock).
    pub fn search_path(&self) -> Option<PathBuf> {
        self.search_path.lock().unwrap().clone()
    }

    fn resolve(&self, name: &str) -> PathBuf {
        match self.search_path() {
            Some(base) => base.join(name),
            None => PathBuf::from(name),
        }
    }
}

impl EngineDelegate for FileStreamDelegate {
    fn open_stream(&self, name: &str) -> Option<SoundStream> {
        let path = self.resolve(name);
        let decoder = match AudioFileDecoder::open(&path) {
            Ok(decoder) => decoder,
            Err(e) => {
                // The engine raises its own warning for a failed open; keep
                // this at debug so the message is not duplicated at warn.
                tracing::debug!(path = %path.display(), "music stream open failed: {e:#}");
                return None;
            }
        };

        let format = decoder.native_format();
        let layout = if decoder.channels() != 2 {
            SpeakerLayout::Mono
        } else if self.output.headphones() {
            SpeakerLayout::Headphones
        } else {
            SpeakerLayout::Stereo
        };
        let sample_rate = decoder.sample_rate();

        Some(SoundStream::new(
            sample_rate,
            layout,
            format,
            Box::new(decoder),
        ))
    }

    fn warning(&self, message: &str) {
        tracing::warn!("music engine warning: {message}");
    }
}
