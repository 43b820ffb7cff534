//! Render-context pull source.
//!
//! [`RenderSource`] is the bridge between the audio callback and the engine.
//! Each turn it reconciles the desired/actual activity flags, adopting a
//! freshly built engine on the activation edge and dropping it on the
//! deactivation edge, then pulls samples from the engine while active.
//!
//! The steady-state path takes no locks and performs no allocation. The one
//! exception is the engine drop on the deactivation edge, which happens at
//! most once per lifecycle transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Receiver;

use crate::engine::SoundtrackEngine;

/// Pull interface an output backend drives once per render turn.
///
/// While the source is producing, `turn_handle` fills the whole buffer with
/// interleaved f32 samples and returns `true`; a source at end of data may
/// zero the tail of its final buffer before reporting `false` on the next
/// turn. When `false` is returned the buffer contents are unspecified and
/// must not be played.
///
/// `&mut self` is the single-writer rule: a turn can never run concurrently
/// with the edge transition it performs.
pub trait RenderPull: Send {
    fn turn_handle(&mut self, out: &mut [f32]) -> bool;
}

/// Activity flag pair shared between the control and render contexts.
///
/// `desired_active` is written by the control context and read by the
/// render context; `actual_active` the reverse. These are the only
/// lock-free shared values in the lifecycle protocol, and both sides use
/// release stores paired with acquire loads so that flag flips publish the
/// engine handoff (activation) and the completed engine drop (deactivation).
#[derive(Debug, Default)]
pub(crate) struct EngineFlags {
    pub(crate) desired_active: AtomicBool,
    pub(crate) actual_active: AtomicBool,
}

/// The render context's end of one engine session.
///
/// Owns the engine once adopted. Created by the lifecycle controller at
/// activation together with a bounded(1) handoff channel that already
/// contains the engine; the first turn after the desired flag flips moves
/// the engine out of the channel and into the source.
pub struct RenderSource<E: SoundtrackEngine> {
    flags: Arc<EngineFlags>,
    intake: Receiver<E>,
    engine: Option<E>,
}

impl<E: SoundtrackEngine> RenderSource<E> {
    pub(crate) fn new(flags: Arc<EngineFlags>, intake: Receiver<E>) -> Self {
        Self {
            flags,
            intake,
            engine: None,
        }
    }
}

impl<E: SoundtrackEngine> RenderPull for RenderSource<E> {
    fn turn_handle(&mut self, out: &mut [f32]) -> bool {
        let desired = self.flags.desired_active.load(Ordering::Acquire);
        let actual = self.flags.actual_active.load(Ordering::Relaxed);
        if desired != actual {
            if desired {
                // Activation edge. The engine was sent before the desired
                // flag flipped, so it must be waiting in the channel.
                debug_assert!(self.engine.is_none());
                match self.intake.try_recv() {
                    Ok(engine) => self.engine = Some(engine),
                    Err(_) => {
                        debug_assert!(false, "activation edge without a delivered engine");
                        return false;
                    }
                }
            } else {
                // Deactivation edge. Dropping the engine joins its decoder
                // threads and releases every open stream; the release store
                // below publishes that teardown to the control context.
                self.engine = None;
            }
            self.flags.actual_active.store(desired, Ordering::Release);
        }
        match self.engine.as_mut() {
            Some(engine) => engine.turn_handle(out),
            None => false,
        }
    }
}
