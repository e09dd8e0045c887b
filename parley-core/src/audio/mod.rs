//! Audio device layer: microphone capture and the playback clock.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate in steady state, block on a lock, or do I/O. It
//! downmixes to mono into a reused scratch buffer and pushes into an SPSC
//! ring producer whose `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`CpalBackend`] therefore opens every stream on a dedicated thread
//! that also drops it; the handle returned to the session only carries a
//! stop channel.
//!
//! The session engine talks to devices through [`AudioBackend`], so tests
//! and headless hosts can supply their own microphone and clock.

pub mod device;
#[cfg(feature = "audio-cpal")]
pub mod output;
pub mod resample;

use std::sync::{atomic::AtomicBool, Arc};

use crate::{
    buffering::AudioProducer,
    error::Result,
    playback::{CompletionNotifier, PlaybackOutput},
};

/// Source of microphone samples and of the playback clock.
pub trait AudioBackend: Send + Sync + 'static {
    /// Open the microphone. Mono f32 samples at
    /// [`InputStream::sample_rate`] are pushed into `producer` while
    /// `running` is set.
    ///
    /// Called from a blocking context.
    ///
    /// # Errors
    /// `ParleyError::Permission` or a device error if the microphone cannot
    /// be acquired.
    fn open_input(
        &self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> Result<Box<dyn InputStream>>;

    /// Open the playback clock. `notifier` fires for every chunk that ends
    /// on its own.
    ///
    /// Called from a blocking context.
    fn open_output(&self, notifier: CompletionNotifier) -> Result<Box<dyn PlaybackOutput>>;
}

/// An open microphone.
pub trait InputStream: Send {
    /// Rate of the samples pushed into the ring (Hz).
    fn sample_rate(&self) -> u32;

    /// Release the device. Idempotent.
    fn stop(&mut self);
}

#[cfg(feature = "audio-cpal")]
pub use self::cpal_backend::{AudioCapture, CpalBackend};

#[cfg(feature = "audio-cpal")]
mod cpal_backend {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::thread;

    use cpal::{
        traits::{DeviceTrait, StreamTrait},
        FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    };
    use crossbeam_channel::{bounded, Sender};
    use tracing::{error, info, warn};

    use super::{device, output::AudioOutput, AudioBackend, InputStream};
    use crate::{
        buffering::{AudioProducer, Producer},
        error::{ParleyError, Result},
        playback::{CompletionNotifier, PlaybackOutput},
    };

    /// Handle to an active microphone stream.
    ///
    /// **Not `Send`**: create and drop it on the same OS thread.
    pub struct AudioCapture {
        /// Kept alive so the stream is not dropped prematurely.
        _stream: Stream,
        /// Set to `false` to make the callback no-op.
        running: Arc<AtomicBool>,
        /// Rate reported by the device (Hz).
        pub sample_rate: u32,
    }

    impl AudioCapture {
        /// Open an input device by preferred name, otherwise the default
        /// input, otherwise the first available one.
        ///
        /// # Errors
        /// `ParleyError::NoDefaultInputDevice` when no microphone exists,
        /// `ParleyError::Permission` when the OS refuses access.
        pub fn open_with_preference(
            producer: AudioProducer,
            running: Arc<AtomicBool>,
            preferred_device_name: Option<&str>,
        ) -> Result<Self> {
            let host = cpal::default_host();
            let device = device::select_input(&host, preferred_device_name)?;

            info!(
                device = device.name().unwrap_or_default().as_str(),
                "opening input device"
            );

            let supported = device.default_input_config().map_err(|e| match e {
                cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                    ParleyError::Permission(e.to_string())
                }
                other => ParleyError::AudioDevice(other.to_string()),
            })?;

            let sample_rate = supported.sample_rate().0;
            let channels = supported.channels();
            info!(sample_rate, channels, "input config selected");

            let config = StreamConfig {
                channels,
                sample_rate: SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let gate = Arc::clone(&running);
            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_mono_input::<f32>(&device, &config, producer, gate),
                SampleFormat::I16 => build_mono_input::<i16>(&device, &config, producer, gate),
                SampleFormat::U16 => build_mono_input::<u16>(&device, &config, producer, gate),
                SampleFormat::U8 => build_mono_input::<u8>(&device, &config, producer, gate),
                fmt => {
                    return Err(ParleyError::AudioStream(format!(
                        "unsupported sample format: {fmt:?}"
                    )))
                }
            }
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => ParleyError::Permission(e.to_string()),
                other => ParleyError::AudioStream(other.to_string()),
            })?;

            stream
                .play()
                .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

            Ok(Self {
                _stream: stream,
                running,
                sample_rate,
            })
        }

        /// Signal the callback to no-op on its next invocation.
        pub fn stop(&self) {
            self.running.store(false, Ordering::Release);
        }
    }

    /// Input stream that averages all channels of every frame into one
    /// sample and pushes the result into the ring.
    fn build_mono_input<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> std::result::Result<Stream, cpal::BuildStreamError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let ch = (config.channels as usize).max(1);
        let mut mix_buf: Vec<f32> = Vec::new();

        device.build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                mix_buf.clear();
                mix_buf.extend(data.chunks_exact(ch).map(|frame| {
                    frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / ch as f32
                }));
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!("ring buffer full: dropped {} frames", mix_buf.len() - written);
                }
            },
            |err| error!("input stream error: {err}"),
            None,
        )
    }

    /// Real devices through cpal's default host.
    #[derive(Debug, Clone, Default)]
    pub struct CpalBackend {
        preferred_input: Option<String>,
        preferred_output: Option<String>,
    }

    impl CpalBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_input_device(mut self, name: Option<String>) -> Self {
            self.preferred_input = name;
            self
        }

        pub fn with_output_device(mut self, name: Option<String>) -> Self {
            self.preferred_output = name;
            self
        }
    }

    impl AudioBackend for CpalBackend {
        fn open_input(
            &self,
            producer: AudioProducer,
            running: Arc<AtomicBool>,
        ) -> Result<Box<dyn InputStream>> {
            let preferred = self.preferred_input.clone();
            let (open_tx, open_rx) = bounded::<Result<u32>>(1);
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let gate = Arc::clone(&running);

            thread::Builder::new()
                .name("parley-input".into())
                .spawn(move || {
                    let capture =
                        match AudioCapture::open_with_preference(producer, gate, preferred.as_deref()) {
                            Ok(capture) => {
                                let _ = open_tx.send(Ok(capture.sample_rate));
                                capture
                            }
                            Err(e) => {
                                let _ = open_tx.send(Err(e));
                                return;
                            }
                        };
                    // Held until stop() or the handle is dropped.
                    let _ = stop_rx.recv();
                    capture.stop();
                    info!("input device released");
                })?;

            match open_rx.recv() {
                Ok(Ok(sample_rate)) => Ok(Box::new(CpalInput {
                    stop_tx: Some(stop_tx),
                    running,
                    sample_rate,
                })),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ParleyError::AudioStream(
                    "input thread exited before opening the device".into(),
                )),
            }
        }

        fn open_output(&self, notifier: CompletionNotifier) -> Result<Box<dyn PlaybackOutput>> {
            let output = AudioOutput::open(self.preferred_output.as_deref(), notifier)?;
            Ok(Box::new(output))
        }
    }

    struct CpalInput {
        stop_tx: Option<Sender<()>>,
        running: Arc<AtomicBool>,
        sample_rate: u32,
    }

    impl InputStream for CpalInput {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::Release);
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    impl Drop for CpalInput {
        fn drop(&mut self) {
            self.stop();
        }
    }
}
