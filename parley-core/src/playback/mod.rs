//! Gap-free scheduling of model speech.
//!
//! ## Timing
//!
//! ```text
//! clock:   ──0────────0.5──────0.75─────────1.75──►
//! chunk 1:   [  0.50 s ]
//! chunk 2:             [0.25 s]
//! chunk 3:                     [    1.00 s    ]
//! ```
//!
//! Each chunk starts at `max(next_start_time, clock.now())`, so chunks that
//! arrive early queue back-to-back and chunks that arrive late start
//! immediately instead of trying to catch up. An interrupt (barge-in) stops
//! everything in flight and rewinds `next_start_time`.
//!
//! The playback clock itself is a [`PlaybackOutput`]: the cpal device in
//! production ([`crate::audio::output`]) or [`virtual_clock::VirtualClock`]
//! in tests and headless runs.

pub mod virtual_clock;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::{
    buffering::chunk::DecodedAudioChunk,
    error::{ParleyError, Result},
};

/// Identifies one scheduled chunk for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(pub u64);

/// One in-flight playback unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlaybackHandle {
    pub id: PlaybackId,
    /// Absolute start on the playback clock (seconds).
    pub start_time: f64,
    /// Seconds.
    pub duration: f64,
}

impl ScheduledPlaybackHandle {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Callback a [`PlaybackOutput`] fires when a chunk finishes on its own.
///
/// Not fired for chunks stopped through [`PlaybackOutput::stop`].
#[derive(Clone)]
pub struct CompletionNotifier(Arc<dyn Fn(PlaybackId) + Send + Sync>);

impl CompletionNotifier {
    pub fn new(notify: impl Fn(PlaybackId) + Send + Sync + 'static) -> Self {
        Self(Arc::new(notify))
    }

    pub fn notify(&self, id: PlaybackId) {
        (self.0)(id);
    }
}

impl std::fmt::Debug for CompletionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionNotifier").finish_non_exhaustive()
    }
}

/// The playback clock resource: a monotonic time source that can start
/// chunks at absolute times on it.
pub trait PlaybackOutput: Send {
    /// Seconds since the output opened. Monotonically non-decreasing.
    fn current_time(&self) -> f64;

    /// Begin `chunk` at `handle.start_time`. The output owns the chunk until
    /// it finishes or is stopped.
    fn play(&mut self, handle: &ScheduledPlaybackHandle, chunk: DecodedAudioChunk) -> Result<()>;

    /// Stop one chunk immediately. Unknown or finished ids are ignored.
    fn stop(&mut self, id: PlaybackId);

    /// Release the device. Anything still playing is cut.
    fn close(&mut self);
}

/// Owns the active set and the `next_start_time` cursor.
pub struct PlaybackScheduler {
    output: Option<Box<dyn PlaybackOutput>>,
    next_start_time: f64,
    active: BTreeMap<PlaybackId, ScheduledPlaybackHandle>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self {
            output: None,
            next_start_time: 0.0,
            active: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Take ownership of a freshly opened playback clock. Any previous
    /// output is reset first.
    pub fn attach(&mut self, output: Box<dyn PlaybackOutput>) {
        self.reset();
        self.output = Some(output);
    }

    pub fn is_attached(&self) -> bool {
        self.output.is_some()
    }

    /// Schedule `chunk` right after everything already queued, or now if the
    /// queue has drained.
    ///
    /// # Errors
    /// `ParleyError::NoPlaybackOutput` when no clock is attached, or whatever
    /// the output reports when starting the chunk.
    pub fn enqueue(&mut self, chunk: DecodedAudioChunk) -> Result<ScheduledPlaybackHandle> {
        let output = self.output.as_mut().ok_or(ParleyError::NoPlaybackOutput)?;

        let now = output.current_time();
        let handle = ScheduledPlaybackHandle {
            id: PlaybackId(self.next_id),
            start_time: self.next_start_time.max(now),
            duration: chunk.duration_secs(),
        };
        self.next_id += 1;

        output.play(&handle, chunk)?;
        self.next_start_time = handle.end_time();
        self.active.insert(handle.id, handle);

        debug!(
            id = handle.id.0,
            start = handle.start_time,
            duration = handle.duration,
            queued = self.active.len(),
            "chunk scheduled"
        );
        Ok(handle)
    }

    /// Barge-in: stop everything in flight. Returns how many chunks were cut.
    pub fn on_interrupt(&mut self) -> usize {
        let flushed = std::mem::take(&mut self.active);
        if let Some(output) = self.output.as_mut() {
            for id in flushed.keys() {
                output.stop(*id);
            }
        }
        self.next_start_time = 0.0;
        flushed.len()
    }

    /// A chunk finished on its own. `false` if it was already gone, e.g.
    /// flushed by an interrupt that raced the completion.
    pub fn on_complete(&mut self, id: PlaybackId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Interrupt, then release the playback clock.
    pub fn reset(&mut self) {
        self.on_interrupt();
        if let Some(mut output) = self.output.take() {
            output.close();
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: PlaybackId) -> bool {
        self.active.contains_key(&id)
    }

    /// Audio still to be heard from now on, summed over the active set.
    pub fn pending_duration(&self) -> f64 {
        let now = self
            .output
            .as_ref()
            .map(|o| o.current_time())
            .unwrap_or(0.0);
        self.active
            .values()
            .map(|h| (h.end_time() - h.start_time.max(now)).max(0.0))
            .sum()
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}
