//! Playback clock on a cpal output stream.
//!
//! The render callback owns a small [`Mixer`]: scheduled chunks ("voices")
//! arrive over a bounded channel polled with `try_recv`, are placed at an
//! absolute frame on the device timeline, and are summed into the output
//! buffer. The number of frames rendered so far *is* the clock.
//!
//! Retired voices travel back through a second channel to a helper thread,
//! which runs the [`CompletionNotifier`] and frees their sample buffers off
//! the audio thread. The callback itself never allocates or frees.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread;

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::{device, resample};
use crate::{
    buffering::chunk::DecodedAudioChunk,
    error::{ParleyError, Result},
    playback::{CompletionNotifier, PlaybackId, PlaybackOutput, ScheduledPlaybackHandle},
};

const COMMAND_CAPACITY: usize = 1024;
const COMPLETION_CAPACITY: usize = 1024;
/// Voices mixed at once. Chunks beyond this are skipped, not queued.
const MAX_VOICES: usize = 64;
/// Mono scratch preallocated for the render callback.
const RENDER_SCRATCH: usize = 16_384;

enum VoiceCommand {
    Play {
        id: PlaybackId,
        start_frame: u64,
        samples: Vec<f32>,
    },
    Stop(PlaybackId),
}

struct Voice {
    id: PlaybackId,
    start_frame: u64,
    samples: Vec<f32>,
}

/// A voice leaving the mixer. Its buffer is dropped by whoever receives it.
enum Retired {
    Completed(Voice),
    Stopped(Voice),
    Skipped(Voice),
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Render-side state. Lives inside the output callback.
struct Mixer {
    commands: Receiver<VoiceCommand>,
    retired: Sender<Retired>,
    frames_rendered: Arc<AtomicU64>,
    voices: Vec<Voice>,
}

impl Mixer {
    fn new(
        commands: Receiver<VoiceCommand>,
        retired: Sender<Retired>,
        frames_rendered: Arc<AtomicU64>,
    ) -> Self {
        Self {
            commands,
            retired,
            frames_rendered,
            voices: Vec::with_capacity(MAX_VOICES),
        }
    }

    fn retire(&self, voice: Retired) {
        // A full channel means the helper is gone; the buffer drops here.
        let _ = self.retired.try_send(voice);
    }

    /// Fill `out` (mono frames) and advance the clock by `out.len()`.
    fn render(&mut self, out: &mut [f32]) {
        let base = self.frames_rendered.load(Ordering::Acquire);

        while let Ok(command) = self.commands.try_recv() {
            match command {
                VoiceCommand::Play {
                    id,
                    start_frame,
                    samples,
                } => {
                    let voice = Voice {
                        id,
                        // A start already in the past begins immediately.
                        start_frame: start_frame.max(base),
                        samples,
                    };
                    if self.voices.len() < MAX_VOICES {
                        self.voices.push(voice);
                    } else {
                        self.retire(Retired::Skipped(voice));
                    }
                }
                VoiceCommand::Stop(id) => {
                    if let Some(index) = self.voices.iter().position(|v| v.id == id) {
                        let voice = self.voices.swap_remove(index);
                        self.retire(Retired::Stopped(voice));
                    }
                }
            }
        }

        out.fill(0.0);
        let window_end = base + out.len() as u64;
        for voice in &self.voices {
            if voice.end_frame() <= base || voice.start_frame >= window_end {
                continue;
            }
            let from = voice.start_frame.max(base);
            let to = voice.end_frame().min(window_end);
            for frame in from..to {
                out[(frame - base) as usize] += voice.samples[(frame - voice.start_frame) as usize];
            }
        }

        self.frames_rendered.store(window_end, Ordering::Release);

        let mut index = 0;
        while index < self.voices.len() {
            if self.voices[index].end_frame() <= window_end {
                let voice = self.voices.swap_remove(index);
                self.retire(Retired::Completed(voice));
            } else {
                index += 1;
            }
        }
    }
}

/// Open output device plus the thread that owns its stream.
pub struct AudioOutput {
    commands: Sender<VoiceCommand>,
    frames_rendered: Arc<AtomicU64>,
    sample_rate: u32,
    stop_tx: Option<Sender<()>>,
}

impl AudioOutput {
    /// Open the preferred output device (or the default) and start rendering
    /// silence.
    ///
    /// # Errors
    /// `ParleyError::NoDefaultOutputDevice` or `ParleyError::AudioStream`.
    pub fn open(preferred_device_name: Option<&str>, notifier: CompletionNotifier) -> Result<Self> {
        let preferred = preferred_device_name.map(str::to_owned);
        let (command_tx, command_rx) = bounded(COMMAND_CAPACITY);
        let (retired_tx, retired_rx) = bounded::<Retired>(COMPLETION_CAPACITY);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (open_tx, open_rx) = bounded::<Result<u32>>(1);
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let clock = Arc::clone(&frames_rendered);

        thread::Builder::new()
            .name("parley-output".into())
            .spawn(move || {
                let mixer = Mixer::new(command_rx, retired_tx, clock);
                let stream = match build_output_stream(preferred.as_deref(), mixer) {
                    Ok((stream, rate)) => {
                        let _ = open_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };

                loop {
                    select! {
                        recv(retired_rx) -> voice => match voice {
                            Ok(Retired::Completed(voice)) => notifier.notify(voice.id),
                            Ok(Retired::Skipped(voice)) => {
                                warn!(id = voice.id.0, "mixer full, chunk skipped");
                                notifier.notify(voice.id);
                            }
                            Ok(Retired::Stopped(_)) => {}
                            Err(_) => break,
                        },
                        recv(stop_rx) -> _ => break,
                    }
                }
                drop(stream);
                info!("output device released");
            })?;

        let sample_rate = match open_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ParleyError::AudioStream(
                    "output thread exited before opening the device".into(),
                ))
            }
        };

        Ok(Self {
            commands: command_tx,
            frames_rendered,
            sample_rate,
            stop_tx: Some(stop_tx),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl PlaybackOutput for AudioOutput {
    fn current_time(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn play(&mut self, handle: &ScheduledPlaybackHandle, chunk: DecodedAudioChunk) -> Result<()> {
        let source_rate = chunk.sample_rate;
        let samples = resample::convert_block(&chunk.to_mono(), source_rate, self.sample_rate)?;
        let start_frame = (handle.start_time * self.sample_rate as f64).round() as u64;

        self.commands
            .try_send(VoiceCommand::Play {
                id: handle.id,
                start_frame,
                samples,
            })
            .map_err(|e| ParleyError::AudioStream(format!("playback queue: {e}")))
    }

    fn stop(&mut self, id: PlaybackId) {
        if self.commands.try_send(VoiceCommand::Stop(id)).is_err() {
            debug!(id = id.0, "stop dropped, output queue unavailable");
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output_stream(preferred: Option<&str>, mixer: Mixer) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = device::select_output(&host, preferred)?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );

    let supported = device
        .default_output_config()
        .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    info!(sample_rate, channels = config.channels, "output config selected");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_mixed_output::<f32>(&device, &config, mixer),
        SampleFormat::I16 => build_mixed_output::<i16>(&device, &config, mixer),
        SampleFormat::U16 => build_mixed_output::<u16>(&device, &config, mixer),
        fmt => {
            return Err(ParleyError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

    Ok((stream, sample_rate))
}

/// Output stream that renders the mixer in mono and copies it to every channel.
fn build_mixed_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut mixer: Mixer,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let ch = (config.channels as usize).max(1);
    let mut mono: Vec<f32> = Vec::with_capacity(RENDER_SCRATCH);

    device.build_output_stream(
        config,
        move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
            mono.resize(data.len() / ch, 0.0);
            mixer.render(&mut mono);
            for (frame, value) in data.chunks_exact_mut(ch).zip(mono.iter()) {
                let sample = T::from_sample(value.clamp(-1.0, 1.0));
                frame.fill(sample);
            }
        },
        |err| error!("output stream error: {err}"),
        None,
    )
}
