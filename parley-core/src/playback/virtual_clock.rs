//! `VirtualClock`: a playback clock that only moves when told to.
//!
//! Stands in for the audio device in tests and headless runs. Time advances
//! through [`VirtualClock::advance`], which also fires completion for every
//! chunk whose end has been reached. Every `play`/`stop`/`close` is recorded
//! so callers can inspect what the scheduler asked for.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{CompletionNotifier, PlaybackId, PlaybackOutput, ScheduledPlaybackHandle};
use crate::{
    buffering::chunk::DecodedAudioChunk,
    error::{ParleyError, Result},
};

/// Tolerance when deciding a chunk has ended.
const END_EPSILON: f64 = 1e-9;

#[derive(Default)]
struct ClockState {
    now: f64,
    playing: Vec<ScheduledPlaybackHandle>,
    started: Vec<ScheduledPlaybackHandle>,
    stopped: Vec<PlaybackId>,
    opened: usize,
    closed: usize,
    notifier: Option<CompletionNotifier>,
}

/// Shared, manually driven clock. Clones observe the same time.
#[derive(Clone, Default)]
pub struct VirtualClock {
    state: Arc<Mutex<ClockState>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an output on this clock. The notifier replaces any previous one.
    pub fn output(&self, notifier: Option<CompletionNotifier>) -> VirtualOutput {
        let mut state = self.state.lock();
        state.opened += 1;
        state.notifier = notifier;
        VirtualOutput {
            clock: self.clone(),
            closed: false,
        }
    }

    pub fn now(&self) -> f64 {
        self.state.lock().now
    }

    /// Move time forward and complete everything that has ended.
    /// Returns the completed ids in start order.
    pub fn advance(&self, secs: f64) -> Vec<PlaybackId> {
        let (finished, notifier) = {
            let mut state = self.state.lock();
            state.now += secs.max(0.0);
            let now = state.now;
            let (finished, still_playing): (Vec<_>, Vec<_>) = state
                .playing
                .drain(..)
                .partition(|h| h.end_time() <= now + END_EPSILON);
            state.playing = still_playing;
            (
                finished.into_iter().map(|h| h.id).collect::<Vec<_>>(),
                state.notifier.clone(),
            )
        };

        // Notify outside the lock; the receiver may query the clock.
        if let Some(notifier) = notifier {
            for id in &finished {
                notifier.notify(*id);
            }
        }
        finished
    }

    /// Every chunk ever started, in order.
    pub fn started(&self) -> Vec<ScheduledPlaybackHandle> {
        self.state.lock().started.clone()
    }

    /// Every chunk explicitly stopped, in order.
    pub fn stopped(&self) -> Vec<PlaybackId> {
        self.state.lock().stopped.clone()
    }

    pub fn playing_len(&self) -> usize {
        self.state.lock().playing.len()
    }

    pub fn opened_count(&self) -> usize {
        self.state.lock().opened
    }

    pub fn closed_count(&self) -> usize {
        self.state.lock().closed
    }
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field("now", &self.now())
            .finish_non_exhaustive()
    }
}

/// One open handle on a [`VirtualClock`].
pub struct VirtualOutput {
    clock: VirtualClock,
    closed: bool,
}

impl PlaybackOutput for VirtualOutput {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn play(&mut self, handle: &ScheduledPlaybackHandle, _chunk: DecodedAudioChunk) -> Result<()> {
        if self.closed {
            return Err(ParleyError::NoPlaybackOutput);
        }
        let mut state = self.clock.state.lock();
        state.playing.push(*handle);
        state.started.push(*handle);
        Ok(())
    }

    fn stop(&mut self, id: PlaybackId) {
        let mut state = self.clock.state.lock();
        state.playing.retain(|h| h.id != id);
        state.stopped.push(id);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.clock.state.lock();
        state.closed += 1;
        state.playing.clear();
        state.notifier = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u64, start: f64, duration: f64) -> ScheduledPlaybackHandle {
        ScheduledPlaybackHandle {
            id: PlaybackId(id),
            start_time: start,
            duration,
        }
    }

    #[test]
    fn advance_completes_only_ended_chunks() {
        let clock = VirtualClock::new();
        let mut out = clock.output(None);
        out.play(&handle(0, 0.0, 0.5), DecodedAudioChunk::new(vec![], 24_000, 1))
            .expect("play");
        out.play(&handle(1, 0.5, 0.5), DecodedAudioChunk::new(vec![], 24_000, 1))
            .expect("play");

        assert!(clock.advance(0.25).is_empty());
        assert_eq!(clock.advance(0.25), vec![PlaybackId(0)]);
        assert_eq!(clock.playing_len(), 1);
    }

    #[test]
    fn closed_output_refuses_play() {
        let clock = VirtualClock::new();
        let mut out = clock.output(None);
        out.close();
        out.close();
        assert_eq!(clock.closed_count(), 1);
        assert!(out
            .play(&handle(0, 0.0, 0.1), DecodedAudioChunk::new(vec![], 24_000, 1))
            .is_err());
    }
}
