//! Engine boundary traits.
//!
//! The streaming music engine itself is an external collaborator: an opaque
//! library that schedules flows, runs its own decoder threads, and mixes
//! output. This module defines the seams the rest of the crate talks
//! through:
//! - [`SoundtrackEngine`]: the render-context handle ("turn the handle").
//! - [`EngineCommander`]: the control-context command surface.
//! - [`EngineDelegate`]: what the engine calls back into (file opens,
//!   warnings).
//! - [`EngineFactory`]: engine construction, invoked on activation.

use std::sync::Arc;

use anyhow::Result;
use soundtrack_types::{FadeCurve, SpeakerLayout};

use crate::stream::SoundStream;

/// Configuration handed to the engine factory on activation.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Target output layout. Activation always requests stereo.
    pub layout: SpeakerLayout,
    /// Output sample rate in Hz, taken from the output device.
    pub sample_rate: u32,
    /// Whether the engine may load and decode in the background. Turned off
    /// for deterministic capture (film recording).
    pub background_loading: bool,
    /// Decoder thread count hint; 0 lets the engine pick.
    pub decode_threads: usize,
    /// Core affinity hint for decoder threads; 0 means no pinning.
    pub core_affinity: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            layout: SpeakerLayout::Stereo,
            sample_rate: 48_000,
            background_loading: true,
            decode_threads: 0,
            core_affinity: 0,
        }
    }
}

/// Callbacks the engine makes into the embedding application.
///
/// `open_stream` runs on whatever thread the engine decodes on and must be
/// safe to call concurrently for multiple streams. `warning` is the
/// engine's single channel for non-fatal problems; implementations forward
/// it to the application log without filtering.
pub trait EngineDelegate: Send + Sync {
    /// Open the named audio resource, or `None` when it cannot be opened.
    /// The engine reports the failure through its own warning channel.
    fn open_stream(&self, name: &str) -> Option<SoundStream>;

    /// A non-fatal engine-side problem, delivered as human-readable text.
    fn warning(&self, message: &str);
}

/// The engine handle owned by the render context.
///
/// Created by the lifecycle controller on activation and transferred to the
/// render context, which drops it on the deactivation edge. Dropping the
/// engine joins its decoder threads and releases every open stream.
pub trait SoundtrackEngine: Send + 'static {
    type Commander: EngineCommander;

    /// Derive the control-context commander for this engine instance. The
    /// pairing is 1:1; dropping the commander does not stop the engine.
    fn commander(&self) -> Self::Commander;

    /// Advance engine state and fill `out` with interleaved f32 samples.
    ///
    /// Returns whether the engine is still alive; engines can
    /// self-terminate when nothing is left to play. Must be callable at
    /// real-time cadence.
    fn turn_handle(&mut self, out: &mut [f32]) -> bool;
}

/// Constructs engines on demand. Invoked by the lifecycle controller each
/// time the engine is (re)activated.
pub trait EngineFactory {
    type Engine: SoundtrackEngine;

    /// Build a new engine. A failure is treated as "feature unavailable":
    /// logged by the caller, activation skipped.
    fn create_engine(
        &self,
        delegate: Arc<dyn EngineDelegate>,
        config: &EngineConfig,
    ) -> Result<Self::Engine>;
}

/// Fire-and-forget command surface of a running engine.
///
/// Owned exclusively by the control context, which is logically
/// single-threaded for command issue; the facade adds no locking of its
/// own. Name arguments are exact names unless the operation says `prefixed`.
/// Fade lengths are in seconds; `None` curves use the engine default.
pub trait EngineCommander: Send + 'static {
    /// Replace the running soundtrack program. The one commander operation
    /// with a result: parse errors surface synchronously at this boundary.
    fn replace_soundtrack(&self, source: &str) -> Result<()>;

    fn precache(&self, flow: &str);
    fn unprecache(&self, flow: &str);
    fn unprecache_all(&self);

    fn set_flow_control_to_number(&self, control: &str, value: f64);
    fn set_flow_control_to_string(&self, control: &str, value: &str);
    fn clear_flow_control(&self, control: &str);
    fn clear_prefixed_flow_controls(&self, prefix: &str);
    fn clear_all_flow_controls(&self);

    fn fade_mix_control_to(
        &self,
        control: &str,
        target_volume: f32,
        fade_length: f32,
        curve: Option<FadeCurve>,
    );
    fn fade_prefixed_mix_controls_to(
        &self,
        prefix: &str,
        target_volume: f32,
        fade_length: f32,
        curve: Option<FadeCurve>,
    );
    fn fade_all_mix_controls_to(
        &self,
        target_volume: f32,
        fade_length: f32,
        curve: Option<FadeCurve>,
    );
    fn fade_all_mix_controls_except_main_to(
        &self,
        target_volume: f32,
        fade_length: f32,
        curve: Option<FadeCurve>,
    );
    fn fade_mix_control_out(&self, control: &str, fade_length: f32, curve: Option<FadeCurve>);
    fn fade_prefixed_mix_controls_out(
        &self,
        prefix: &str,
        fade_length: f32,
        curve: Option<FadeCurve>,
    );
    fn fade_all_mix_controls_out(&self, fade_length: f32, curve: Option<FadeCurve>);
    fn fade_all_mix_controls_except_main_out(&self, fade_length: f32, curve: Option<FadeCurve>);
    fn kill_mix_control(&self, control: &str);
    fn kill_prefixed_mix_controls(&self, prefix: &str);
    fn kill_all_mix_controls(&self);
    fn kill_all_mix_controls_except_main(&self);

    fn start_flow(&self, flow: &str, target_volume: f32, fade_length: f32, curve: Option<FadeCurve>);
    fn fade_flow_to(&self, flow: &str, target_volume: f32, fade_length: f32, curve: Option<FadeCurve>);
    fn fade_prefixed_flows_to(
        &self,
        prefix: &str,
        target_volume: f32,
        fade_length: f32,
        curve: Option<FadeCurve>,
    );
    fn fade_all_flows_to(&self, target_volume: f32, fade_length: f32, curve: Option<FadeCurve>);
    fn fade_flow_out(&self, flow: &str, fade_length: f32, curve: Option<FadeCurve>);
    fn fade_prefixed_flows_out(&self, prefix: &str, fade_length: f32, curve: Option<FadeCurve>);
    fn fade_all_flows_out(&self, fade_length: f32, curve: Option<FadeCurve>);
    fn kill_flow(&self, flow: &str);
    fn kill_prefixed_flows(&self, prefix: &str);
    fn kill_all_flows(&self);
}
