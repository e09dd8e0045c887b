//! Capture pipeline.
//!
//! ## Stages
//!
//! ```text
//! device callback ──push──► ring ──drain──► RateConverter ──► re-block ──► encode ──► sink
//!   (mono f32)                     (capture thread)   (→16 kHz)   (4096)    (i16 PCM)
//! ```
//!
//! The sink is the session's outbound path. It must not block; the session
//! hands in a closure that enqueues onto its mailbox.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::{
    audio::resample::RateConverter,
    buffering::{chunk::AudioBlock, AudioConsumer, Consumer},
    codec,
    error::Result,
};

/// Samples per outbound block.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty.
const EMPTY_SLEEP: Duration = Duration::from_millis(5);

pub type BlockSink = Box<dyn FnMut(AudioBlock) + Send>;

/// Re-blocks a 16 kHz stream and encodes every full block.
pub struct CapturePipeline {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    blocks_emitted: u64,
    sink: BlockSink,
}

impl CapturePipeline {
    pub fn new(block_size: usize, sample_rate: u32, sink: BlockSink) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            sample_rate,
            pending: Vec::with_capacity(block_size * 2),
            blocks_emitted: 0,
            sink,
        }
    }

    /// Feed samples at [`Self::sample_rate`]. Emits one block per full
    /// `block_size`; the remainder waits for the next call. Returns how many
    /// blocks were emitted.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        self.pending.extend_from_slice(samples);

        let full = self.pending.len() / self.block_size;
        if full == 0 {
            return 0;
        }
        let mut pending = std::mem::take(&mut self.pending);
        for block in pending.chunks_exact(self.block_size) {
            self.process_block(block);
        }
        pending.drain(..full * self.block_size);
        self.pending = pending;
        full
    }

    /// Encode one block and hand it to the sink.
    pub fn process_block(&mut self, block: &[f32]) {
        let encoded = codec::encode(block, self.sample_rate);
        self.blocks_emitted += 1;
        (self.sink)(encoded);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn blocks_emitted(&self) -> u64 {
        self.blocks_emitted
    }
}

/// Running capture thread. Dropping it stops the thread.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop draining. Blocks already handed to the sink are not recalled.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        // Detached: the thread exits within one drain iteration.
        self.thread.take();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the capture thread: drain `consumer` (mono samples at `input_rate`),
/// convert to the pipeline's rate and feed the pipeline.
///
/// # Errors
/// Resampler construction or thread spawn failure.
pub fn spawn(
    consumer: AudioConsumer,
    input_rate: u32,
    pipeline: CapturePipeline,
) -> Result<CaptureHandle> {
    let converter = RateConverter::new(input_rate, pipeline.sample_rate(), DRAIN_CHUNK)?;
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);

    let thread = thread::Builder::new()
        .name("parley-capture".into())
        .spawn(move || run(consumer, converter, pipeline, flag))?;

    Ok(CaptureHandle {
        running,
        thread: Some(thread),
    })
}

fn run(
    mut consumer: AudioConsumer,
    mut converter: RateConverter,
    mut pipeline: CapturePipeline,
    running: Arc<AtomicBool>,
) {
    info!(
        block_size = pipeline.block_size(),
        sample_rate = pipeline.sample_rate(),
        "capture started"
    );

    let mut raw = vec![0f32; DRAIN_CHUNK];
    while running.load(Ordering::Acquire) {
        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            thread::sleep(EMPTY_SLEEP);
            continue;
        }

        let converted = converter.process(&raw[..n]);
        if converted.is_empty() {
            // rubato is still filling its input chunk
            continue;
        }
        let emitted = pipeline.push(&converted);
        if emitted > 0 {
            debug!(emitted, pending = pipeline.pending_len(), "capture blocks");
        }
    }

    info!(blocks = pipeline.blocks_emitted(), "capture stopped");
}
