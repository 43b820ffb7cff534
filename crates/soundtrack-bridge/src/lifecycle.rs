//! Engine lifecycle controller.
//!
//! [`MusicLifecycle`] owns the handoff of a streaming music engine between
//! the control context (game logic, scripting) and the render context (the
//! audio callback):
//!
//! - Activation is lazy: asking for a commander brings the engine up if
//!   needed. The control context builds the engine, derives the commander,
//!   parks the engine in a bounded(1) channel, flips `desired_active`, and
//!   registers the render pull source with the output.
//! - Deactivation is synchronous for the caller but never blocks the render
//!   context: the commander is dropped first, `desired_active` is cleared,
//!   and the control context yields until the render context has observed
//!   the change and dropped the engine.
//!
//! One controller instance stands in for what would otherwise be process
//! globals; constructing several independent instances is supported (and is
//! how the tests run).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use anyhow::{Result, bail};
use soundtrack_types::SpeakerLayout;

use crate::engine::{
    EngineCommander, EngineConfig, EngineDelegate, EngineFactory, SoundtrackEngine,
};
use crate::output::{PlayingStream, StreamOutput};
use crate::render::{EngineFlags, RenderSource};
use crate::stream::FileStreamDelegate;

/// Commander type produced by a factory's engine.
pub type CommanderOf<F> =
    <<F as EngineFactory>::Engine as SoundtrackEngine>::Commander;

/// Value assigned to the leave-map flow control when leaving a map.
const LEAVING_VALUE: &str = "leaving";

/// Yield iterations before a deactivation wait is declared stuck. The wait
/// is normally bounded by one render period; hitting this limit means the
/// render context is not running at all.
const DEACTIVATE_SPIN_LIMIT: u64 = 1_000_000;

/// Behavior applied once when leaving a map, then cleared. `None` disables
/// each field independently.
#[derive(Debug, Default)]
struct LeaveMapState {
    fade_out_seconds: Option<f32>,
    start_flow: Option<String>,
    flow_control: Option<String>,
}

impl LeaveMapState {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// One activation's worth of state. The commander is dropped at the start
/// of deactivation, strictly before the engine; the stream handle is
/// dropped last, after the render context has released the engine.
struct ActiveSession<C> {
    flags: Arc<EngineFlags>,
    commander: Option<C>,
    stream: Box<dyn PlayingStream>,
}

/// Dual-context engine lifecycle controller.
///
/// All lifecycle-mutating calls take `&mut self`: the control context is
/// logically single-threaded for them. Only the render context reads the
/// activity flags concurrently.
pub struct MusicLifecycle<F: EngineFactory> {
    factory: F,
    output: Arc<dyn StreamOutput>,
    delegate: Arc<FileStreamDelegate>,
    session: Option<ActiveSession<CommanderOf<F>>>,
    leave_map: LeaveMapState,
    background_loading: bool,
    in_map: bool,
}

impl<F: EngineFactory> MusicLifecycle<F> {
    pub fn new(factory: F, output: Arc<dyn StreamOutput>) -> Self {
        let delegate = Arc::new(FileStreamDelegate::new(output.clone()));
        Self {
            factory,
            output,
            delegate,
            session: None,
            leave_map: LeaveMapState::default(),
            background_loading: true,
            in_map: false,
        }
    }

    /// Whether the control context wants the engine running.
    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.flags.desired_active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Whether the render context has adopted the engine.
    pub fn is_render_active(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.flags.actual_active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Bring the engine up if it is not already up. Idempotent.
    ///
    /// Skips activation (with an error log) when the audio output is
    /// unavailable or the engine cannot be constructed; commander accessors
    /// then return `None` and callers carry on without music.
    pub fn activate_if_needed(&mut self) {
        if self.is_active() {
            return;
        }
        self.leave_map.clear();
        if !self.output.is_available() {
            tracing::error!("no audio output available; music engine stays inactive");
            return;
        }
        debug_assert!(self.session.is_none());

        let config = EngineConfig {
            layout: SpeakerLayout::Stereo,
            sample_rate: self.output.sample_rate(),
            background_loading: self.background_loading,
            decode_threads: 0,
            core_affinity: 0,
        };
        let delegate: Arc<dyn EngineDelegate> = self.delegate.clone();
        let engine = match self.factory.create_engine(delegate, &config) {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!("music engine construction failed: {e:#}");
                return;
            }
        };
        let commander = engine.commander();

        let flags = Arc::new(EngineFlags::default());
        let (handoff, intake) = crossbeam_channel::bounded(1);
        // The send must complete before the flag flips so the render
        // context adopting on the activation edge always finds the engine.
        let _ = handoff.send(engine);
        flags.desired_active.store(true, Ordering::Release);

        let source = RenderSource::new(flags.clone(), intake);
        let stream = match self
            .output
            .play_stream(Box::new(source), config.layout.channel_count())
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to register the music render source: {e:#}");
                flags.desired_active.store(false, Ordering::Release);
                return;
            }
        };

        tracing::info!(
            sample_rate_hz = config.sample_rate,
            background_loading = config.background_loading,
            "music engine activated"
        );
        self.session = Some(ActiveSession {
            flags,
            commander: Some(commander),
            stream,
        });
    }

    /// Tear the engine down, if it is up. Harmless to call more than once.
    ///
    /// Synchronous: on `Ok`, the render context has dropped the engine
    /// (decoder threads joined, open streams released). Must never be
    /// called from the render context itself — the render context is the
    /// one that clears `actual_active`, so that would deadlock.
    ///
    /// No-op while the render context has not yet adopted the engine.
    pub fn deactivate(&mut self) -> Result<()> {
        let adopted = self
            .session
            .as_ref()
            .map(|s| s.flags.actual_active.load(Ordering::Acquire))
            .unwrap_or(false);
        if !adopted {
            return Ok(());
        }
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };

        // No further commands once teardown starts.
        drop(session.commander.take());
        session.flags.desired_active.store(false, Ordering::Release);

        let mut spins: u64 = 0;
        while session.flags.actual_active.load(Ordering::Acquire) {
            spins += 1;
            if spins >= DEACTIVATE_SPIN_LIMIT {
                tracing::error!(
                    "render context never released the music engine; is the audio callback running?"
                );
                bail!("music engine deactivation timed out");
            }
            thread::yield_now();
        }

        drop(session.stream);
        self.in_map = false;
        self.leave_map.clear();
        tracing::info!("music engine deactivated");
        Ok(())
    }

    /// Commander for the active engine, activating it first if needed.
    ///
    /// Marks the controller as "in a map". Returns `None` when activation
    /// was skipped (no output, engine construction failed).
    pub fn commander(&mut self) -> Option<&CommanderOf<F>> {
        self.in_map = true;
        self.activate_if_needed();
        self.session.as_ref().and_then(|s| s.commander.as_ref())
    }

    /// Commander for the active engine, or `None` when inactive. Never
    /// activates.
    pub fn optional_commander(&self) -> Option<&CommanderOf<F>> {
        self.session.as_ref().and_then(|s| s.commander.as_ref())
    }

    /// The delegate the engine opens music files through. Shareable across
    /// threads; useful for setting the search path from wherever the
    /// scripting layer runs.
    pub fn stream_delegate(&self) -> Arc<FileStreamDelegate> {
        self.delegate.clone()
    }

    /// Base path for resolving relative music names. Takes effect for the
    /// next stream open; already-open streams are unaffected.
    pub fn set_music_search_path(&self, path: Option<PathBuf>) {
        self.delegate.set_search_path(path);
    }

    /// Apply the configured leave-map behavior, then clear it.
    ///
    /// No-op unless a commander has been handed out since the last leave or
    /// deactivation. Each configured field is applied exactly once: fade
    /// all flows out, start the named flow, set the named flow control to
    /// "leaving".
    pub fn leaving_map(&mut self) {
        if !self.in_map {
            return;
        }
        if let Some(commander) = self.optional_commander() {
            if let Some(fade) = self.leave_map.fade_out_seconds {
                commander.fade_all_flows_out(fade, None);
            }
            if let Some(flow) = self.leave_map.start_flow.as_deref() {
                commander.start_flow(flow, 1.0, 0.0, None);
            }
            if let Some(control) = self.leave_map.flow_control.as_deref() {
                commander.set_flow_control_to_string(control, LEAVING_VALUE);
            }
        }
        self.in_map = false;
        self.leave_map.clear();
    }

    /// Fade-all-flows-out duration applied on leaving a map; `None` when
    /// disabled.
    pub fn fade_on_leave(&self) -> Option<f32> {
        self.leave_map.fade_out_seconds
    }

    pub fn set_fade_on_leave(&mut self, seconds: Option<f32>) {
        debug_assert!(seconds.map(|s| s >= 0.0).unwrap_or(true));
        self.leave_map.fade_out_seconds = seconds;
    }

    /// Flow started on leaving a map; `None` when disabled.
    pub fn start_flow_on_leave(&self) -> Option<&str> {
        self.leave_map.start_flow.as_deref()
    }

    pub fn set_start_flow_on_leave(&mut self, flow: Option<String>) {
        self.leave_map.start_flow = flow;
    }

    /// Flow control set to "leaving" on leaving a map; `None` when
    /// disabled.
    pub fn flow_control_on_leave(&self) -> Option<&str> {
        self.leave_map.flow_control.as_deref()
    }

    pub fn set_flow_control_on_leave(&mut self, control: Option<String>) {
        self.leave_map.flow_control = control;
    }

    /// Change the background-loading flag. The engine is recreated with the
    /// new value on its next activation, so an active engine is torn down
    /// here.
    pub fn set_background_loading(&mut self, enabled: bool) -> Result<()> {
        if enabled != self.background_loading {
            self.deactivate()?;
            self.background_loading = enabled;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    use anyhow::Result;
    use soundtrack_types::SpeakerLayout;

    use super::*;
    use crate::engine::testing::StubFactory;
    use crate::render::RenderPull;

    /// Output stub that hands the registered source to the test for manual
    /// or threaded pumping.
    #[derive(Clone)]
    struct ManualOutput {
        available: bool,
        headphones: bool,
        rate: u32,
        slot: Arc<Mutex<Option<Box<dyn RenderPull>>>>,
        registered: Arc<AtomicUsize>,
    }

    impl ManualOutput {
        fn new() -> Self {
            Self {
                available: true,
                headphones: false,
                rate: 44_100,
                slot: Arc::new(Mutex::new(None)),
                registered: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn pump_once(&self) -> bool {
            let mut buf = vec![0.0f32; 128];
            let mut slot = self.slot.lock().unwrap();
            match slot.as_mut() {
                Some(source) => source.turn_handle(&mut buf),
                None => false,
            }
        }
    }

    impl StreamOutput for ManualOutput {
        fn is_available(&self) -> bool {
            self.available
        }

        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn headphones(&self) -> bool {
            self.headphones
        }

        fn play_stream(
            &self,
            source: Box<dyn RenderPull>,
            _source_channels: u16,
        ) -> Result<Box<dyn PlayingStream>> {
            *self.slot.lock().unwrap() = Some(source);
            self.registered.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(ManualStream))
        }
    }

    struct ManualStream;

    impl PlayingStream for ManualStream {
        fn is_playing(&self) -> bool {
            true
        }
    }

    /// Continuously pump the registered source, standing in for the audio
    /// callback thread.
    fn spawn_pump(output: &ManualOutput, run: Arc<AtomicBool>) -> JoinHandle<()> {
        let output = output.clone();
        std::thread::spawn(move || {
            while run.load(Ordering::Relaxed) {
                output.pump_once();
                std::thread::yield_now();
            }
        })
    }

    fn lifecycle_with(
        output: ManualOutput,
    ) -> (MusicLifecycle<StubFactory>, StubFactory) {
        let factory = StubFactory::new();
        let lifecycle = MusicLifecycle::new(factory.clone(), Arc::new(output));
        (lifecycle, factory)
    }

    #[test]
    fn activation_is_lazy_and_idempotent() {
        let output = ManualOutput::new();
        let (mut lifecycle, factory) = lifecycle_with(output.clone());

        assert!(!lifecycle.is_active());
        assert!(lifecycle.optional_commander().is_none());

        assert!(lifecycle.commander().is_some());
        assert!(lifecycle.commander().is_some());
        assert_eq!(factory.created.load(Ordering::Relaxed), 1);
        assert_eq!(output.registered.load(Ordering::Relaxed), 1);
        assert!(lifecycle.is_active());
    }

    #[test]
    fn activation_passes_output_configuration() {
        let mut output = ManualOutput::new();
        output.rate = 96_000;
        let (mut lifecycle, factory) = lifecycle_with(output);

        lifecycle.activate_if_needed();
        let config = factory.last_config.lock().unwrap().clone().unwrap();
        assert_eq!(config.layout, SpeakerLayout::Stereo);
        assert_eq!(config.sample_rate, 96_000);
        assert!(config.background_loading);
        assert_eq!(config.decode_threads, 0);
        assert_eq!(config.core_affinity, 0);
    }

    #[test]
    fn unavailable_output_skips_activation() {
        let mut output = ManualOutput::new();
        output.available = false;
        let (mut lifecycle, factory) = lifecycle_with(output);

        assert!(lifecycle.commander().is_none());
        assert_eq!(factory.created.load(Ordering::Relaxed), 0);
        assert!(!lifecycle.is_active());
    }

    #[test]
    fn failed_engine_construction_stays_inactive() {
        let output = ManualOutput::new();
        let (mut lifecycle, factory) = lifecycle_with(output);
        factory.fail.store(true, Ordering::Relaxed);

        assert!(lifecycle.commander().is_none());
        assert!(!lifecycle.is_active());
    }

    #[test]
    fn deactivate_without_activation_is_noop() {
        let output = ManualOutput::new();
        let (mut lifecycle, _factory) = lifecycle_with(output);
        lifecycle.deactivate().unwrap();
        assert!(!lifecycle.is_active());
    }

    #[test]
    fn deactivate_waits_for_render_teardown() {
        let output = ManualOutput::new();
        let (mut lifecycle, factory) = lifecycle_with(output.clone());

        assert!(lifecycle.commander().is_some());
        let run = Arc::new(AtomicBool::new(true));
        let pump = spawn_pump(&output, run.clone());

        while !lifecycle.is_render_active() {
            std::thread::yield_now();
        }

        lifecycle.deactivate().unwrap();
        assert!(factory.dropped(0));
        assert!(!lifecycle.is_active());
        assert!(!lifecycle.is_render_active());
        assert!(lifecycle.optional_commander().is_none());

        run.store(false, Ordering::Relaxed);
        pump.join().unwrap();
    }

    #[test]
    fn deactivate_before_render_adoption_is_noop() {
        let output = ManualOutput::new();
        let (mut lifecycle, factory) = lifecycle_with(output);

        assert!(lifecycle.commander().is_some());
        // The render context never took a turn, so there is nothing to
        // tear down yet.
        lifecycle.deactivate().unwrap();
        assert!(lifecycle.is_active());
        assert!(!factory.dropped(0));
    }

    #[test]
    fn deactivate_fails_loudly_when_render_stops() {
        let output = ManualOutput::new();
        let (mut lifecycle, _factory) = lifecycle_with(output.clone());

        assert!(lifecycle.commander().is_some());
        assert!(output.pump_once());
        assert!(lifecycle.is_render_active());

        // Nothing pumps anymore; the bounded spin must error out instead of
        // hanging forever.
        assert!(lifecycle.deactivate().is_err());
    }

    #[test]
    fn reactivation_yields_fresh_engine_and_empty_leave_state() {
        let output = ManualOutput::new();
        let (mut lifecycle, factory) = lifecycle_with(output.clone());
        let run = Arc::new(AtomicBool::new(true));
        let pump = spawn_pump(&output, run.clone());

        assert!(lifecycle.commander().is_some());
        lifecycle.set_fade_on_leave(Some(1.5));
        lifecycle.set_start_flow_on_leave(Some("theme".to_string()));
        lifecycle.set_flow_control_on_leave(Some("danger".to_string()));

        while !lifecycle.is_render_active() {
            std::thread::yield_now();
        }
        lifecycle.deactivate().unwrap();
        assert!(factory.dropped(0));

        assert!(lifecycle.commander().is_some());
        assert_eq!(factory.created.load(Ordering::Relaxed), 2);
        assert!(!factory.dropped(1));
        assert_eq!(lifecycle.fade_on_leave(), None);
        assert_eq!(lifecycle.start_flow_on_leave(), None);
        assert_eq!(lifecycle.flow_control_on_leave(), None);

        run.store(false, Ordering::Relaxed);
        pump.join().unwrap();
    }

    #[test]
    fn repeated_cycles_converge() {
        let output = ManualOutput::new();
        let (mut lifecycle, factory) = lifecycle_with(output.clone());
        let run = Arc::new(AtomicBool::new(true));
        let pump = spawn_pump(&output, run.clone());

        for cycle in 0..5 {
            assert!(lifecycle.commander().is_some());
            while !lifecycle.is_render_active() {
                std::thread::yield_now();
            }
            lifecycle.deactivate().unwrap();
            assert!(factory.dropped(cycle));
            assert!(!lifecycle.is_render_active());
        }
        assert_eq!(factory.created.load(Ordering::Relaxed), 5);

        run.store(false, Ordering::Relaxed);
        pump.join().unwrap();
    }

    #[test]
    fn leave_map_round_trip_applies_each_field_once() {
        let output = ManualOutput::new();
        let (mut lifecycle, factory) = lifecycle_with(output);

        assert!(lifecycle.commander().is_some());
        lifecycle.set_fade_on_leave(Some(2.5));
        lifecycle.set_start_flow_on_leave(Some("ambient".to_string()));
        lifecycle.set_flow_control_on_leave(Some("danger".to_string()));

        lifecycle.leaving_map();

        let entries = factory.journal.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec![
                "fade_all_flows_out 2.5 default".to_string(),
                "start_flow ambient 1 0 default".to_string(),
                "set_flow_control danger leaving".to_string(),
            ]
        );
        assert_eq!(lifecycle.fade_on_leave(), None);
        assert_eq!(lifecycle.start_flow_on_leave(), None);
        assert_eq!(lifecycle.flow_control_on_leave(), None);

        // A second leave with nothing newly configured issues nothing.
        lifecycle.leaving_map();
        assert_eq!(factory.journal.lock().unwrap().len(), 3);
    }

    #[test]
    fn leaving_map_outside_a_map_is_noop() {
        let output = ManualOutput::new();
        let (mut lifecycle, factory) = lifecycle_with(output);

        lifecycle.set_fade_on_leave(Some(1.0));
        lifecycle.leaving_map();
        assert!(factory.journal.lock().unwrap().is_empty());
        // Not in a map: the configured behavior is kept for the real leave.
        assert_eq!(lifecycle.fade_on_leave(), Some(1.0));
    }

    #[test]
    fn leave_map_skips_unset_fields() {
        let output = ManualOutput::new();
        let (mut lifecycle, factory) = lifecycle_with(output);

        assert!(lifecycle.commander().is_some());
        lifecycle.set_start_flow_on_leave(Some("outro".to_string()));
        lifecycle.leaving_map();

        let entries = factory.journal.lock().unwrap().clone();
        assert_eq!(entries, vec!["start_flow outro 1 0 default".to_string()]);
    }

    #[test]
    fn background_loading_change_recreates_engine() {
        let output = ManualOutput::new();
        let (mut lifecycle, factory) = lifecycle_with(output.clone());
        let run = Arc::new(AtomicBool::new(true));
        let pump = spawn_pump(&output, run.clone());

        assert!(lifecycle.commander().is_some());
        while !lifecycle.is_render_active() {
            std::thread::yield_now();
        }

        lifecycle.set_background_loading(false).unwrap();
        assert!(!lifecycle.is_active());
        assert!(factory.dropped(0));

        assert!(lifecycle.commander().is_some());
        let config = factory.last_config.lock().unwrap().clone().unwrap();
        assert!(!config.background_loading);

        // Setting the same value again does not cycle the engine.
        lifecycle.set_background_loading(false).unwrap();
        assert!(lifecycle.is_active());
        assert_eq!(factory.created.load(Ordering::Relaxed), 2);

        run.store(false, Ordering::Relaxed);
        pump.join().unwrap();
    }
}
