use serde::{Deserialize, Serialize};

/// Interpolation shape used when ramping a volume or gain toward a target
/// over a duration.
///
/// Commands that accept a curve take `Option<FadeCurve>`; `None` lets the
/// engine pick its own default.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    Exponential,
    Logarithmic,
    Linear,
}

impl FadeCurve {
    /// Parse a curve from its lowercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "exponential" => Some(Self::Exponential),
            "logarithmic" => Some(Self::Logarithmic),
            "linear" => Some(Self::Linear),
            _ => None,
        }
    }

    /// Lowercase name, the inverse of [`FadeCurve::from_name`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Logarithmic => "logarithmic",
            Self::Linear => "linear",
        }
    }
}

/// Native sample format of a decoded source.
///
/// Streams always deliver `f32` samples after decode; this records what the
/// source actually stored, for engines that care (dither decisions, level
/// statistics).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    Unsigned8,
    Signed16,
    Float32,
}

/// Speaker layout reported for a decoded source or requested of the engine.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerLayout {
    Mono,
    Stereo,
    /// Stereo optimized for binaural/HRTF rendering.
    Headphones,
}

impl SpeakerLayout {
    /// Interleaved channel count carried by this layout.
    pub fn channel_count(&self) -> u16 {
        match self {
            Self::Mono => 1,
            Self::Stereo | Self::Headphones => 2,
        }
    }
}

/// Human-readable version of this library.
pub fn version_string() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Monotonically encoded version number: major in the high 16 bits, minor
/// and patch in the low byte groups.
pub fn version_number() -> u32 {
    encode_version(
        pkg_part(env!("CARGO_PKG_VERSION_MAJOR")),
        pkg_part(env!("CARGO_PKG_VERSION_MINOR")),
        pkg_part(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

pub fn version_major() -> u32 {
    version_number() >> 16
}

pub fn version_minor() -> u32 {
    (version_number() >> 8) & 0xff
}

pub fn version_patch() -> u32 {
    version_number() & 0xff
}

fn encode_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 16) | ((minor & 0xff) << 8) | (patch & 0xff)
}

fn pkg_part(raw: &str) -> u32 {
    raw.parse().unwrap_or(0)
}
