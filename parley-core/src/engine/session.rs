//! The session actor.
//!
//! One tokio task owns every piece of session state and processes
//! [`SessionCommand`]s from a single unbounded mailbox, one at a time:
//!
//! ```text
//!  ParleyEngine ── Start / Stop / Shutdown ──┐
//!  acquisition task ── Acquired ─────────────┤
//!  RemoteEventSender ── Remote ──────────────┼──► mailbox ──► SessionActor
//!  capture thread ── Captured ───────────────┤
//!  playback output ── PlaybackEnded ─────────┘
//! ```
//!
//! Every message produced on behalf of a session carries that session's
//! generation. Messages from an older generation are stale: they are counted,
//! dropped, and any device or remote they carry is released.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::SessionConfig;
use crate::{
    audio::{AudioBackend, InputStream},
    buffering::{chunk::AudioBlock, create_audio_ring, AudioConsumer},
    capture::{self, BlockSink, CaptureHandle, CapturePipeline},
    codec,
    error::{ParleyError, Result, TRANSPORT_MESSAGE},
    ipc::events::{ConnectionState, ConnectionStatusEvent},
    playback::{CompletionNotifier, PlaybackId, PlaybackOutput, PlaybackScheduler},
    remote::{
        protocol::{InboundEvent, RealtimeInput, ServerMessage, SessionSetup},
        RemoteConnector, RemoteEventSender, RemoteSession, RemoteSignal,
    },
    transcript::{ConversationLog, TranscriptionAccumulator},
};

pub(crate) type Mailbox = mpsc::UnboundedSender<SessionCommand>;

pub(crate) enum SessionCommand {
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Acquired {
        generation: u64,
        result: Result<Acquired>,
    },
    Remote {
        generation: u64,
        signal: RemoteSignal,
    },
    Captured {
        generation: u64,
        block: AudioBlock,
    },
    PlaybackEnded {
        generation: u64,
        id: PlaybackId,
    },
    Shutdown,
}

/// Everything a successful acquisition hands to the actor.
pub(crate) struct Acquired {
    input: Box<dyn InputStream>,
    consumer: AudioConsumer,
    output: Box<dyn PlaybackOutput>,
    remote: Box<dyn RemoteSession>,
}

impl Acquired {
    fn release(mut self) {
        self.input.stop();
        self.output.close();
        self.remote.close();
    }
}

// ---------------------------------------------------------------------------
// Shared status
// ---------------------------------------------------------------------------

/// Connection state readable from any thread, plus its broadcast channel.
#[derive(Clone)]
pub(crate) struct StatusCell {
    state: Arc<Mutex<ConnectionState>>,
    last_error: Arc<Mutex<Option<String>>>,
    tx: broadcast::Sender<ConnectionStatusEvent>,
}

impl StatusCell {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            last_error: Arc::new(Mutex::new(None)),
            tx,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionStatusEvent> {
        self.tx.subscribe()
    }

    fn set(&self, state: ConnectionState, detail: Option<String>) {
        *self.state.lock() = state;
        match state {
            ConnectionState::Error => *self.last_error.lock() = detail.clone(),
            ConnectionState::Connecting => *self.last_error.lock() = None,
            _ => {}
        }
        info!(?state, "session state changed");
        let _ = self.tx.send(ConnectionStatusEvent { state, detail });
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SessionDiagnostics {
    pub blocks_sent: AtomicUsize,
    pub send_errors: AtomicUsize,
    pub chunks_scheduled: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub turns_completed: AtomicUsize,
    pub playback_completed: AtomicUsize,
    pub stale_events: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.blocks_sent.store(0, Ordering::Relaxed);
        self.send_errors.store(0, Ordering::Relaxed);
        self.chunks_scheduled.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
        self.interrupts.store(0, Ordering::Relaxed);
        self.turns_completed.store(0, Ordering::Relaxed);
        self.playback_completed.store(0, Ordering::Relaxed);
        self.stale_events.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            blocks_sent: self.blocks_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            playback_completed: self.playback_completed.load(Ordering::Relaxed),
            stale_events: self.stale_events.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub blocks_sent: usize,
    pub send_errors: usize,
    pub chunks_scheduled: usize,
    pub decode_errors: usize,
    pub interrupts: usize,
    pub turns_completed: usize,
    pub playback_completed: usize,
    pub stale_events: usize,
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

/// Devices opened so far by an acquisition still in progress.
///
/// Dropping it stops the microphone and closes the clock, so a failed or
/// aborted acquisition never leaks a device.
#[derive(Default)]
struct PartialAcquisition {
    input: Option<Box<dyn InputStream>>,
    output: Option<Box<dyn PlaybackOutput>>,
}

impl PartialAcquisition {
    fn into_devices(mut self) -> Option<(Box<dyn InputStream>, Box<dyn PlaybackOutput>)> {
        match (self.input.take(), self.output.take()) {
            (Some(input), Some(output)) => Some((input, output)),
            (input, output) => {
                self.input = input;
                self.output = output;
                None
            }
        }
    }
}

impl Drop for PartialAcquisition {
    fn drop(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.stop();
        }
        if let Some(mut output) = self.output.take() {
            output.close();
        }
    }
}

/// Open microphone, playback clock and remote session, in that order.
/// Whatever was opened before a failure, or before the task is aborted, is
/// released.
async fn acquire<B, C>(
    generation: u64,
    backend: Arc<B>,
    connector: Arc<C>,
    setup: SessionSetup,
    gate: Arc<AtomicBool>,
    mailbox: Mailbox,
) -> Result<Acquired>
where
    B: AudioBackend,
    C: RemoteConnector,
{
    let (producer, consumer) = create_audio_ring();

    let input_backend = Arc::clone(&backend);
    let mut partial = tokio::task::spawn_blocking(move || {
        input_backend
            .open_input(producer, gate)
            .map(|input| PartialAcquisition {
                input: Some(input),
                output: None,
            })
    })
    .await
    .map_err(join_error)??;

    let completions = mailbox.clone();
    let notifier = CompletionNotifier::new(move |id| {
        let _ = completions.send(SessionCommand::PlaybackEnded { generation, id });
    });
    let output_backend = Arc::clone(&backend);
    let mut opened = tokio::task::spawn_blocking(move || {
        output_backend
            .open_output(notifier)
            .map(|output| PartialAcquisition {
                input: None,
                output: Some(output),
            })
    })
    .await
    .map_err(join_error)??;
    partial.output = opened.output.take();

    let events = RemoteEventSender::new(move |signal| {
        let _ = mailbox.send(SessionCommand::Remote { generation, signal });
    });
    let remote = connector.connect(setup, events).await?;

    match partial.into_devices() {
        Some((input, output)) => Ok(Acquired {
            input,
            consumer,
            output,
            remote,
        }),
        None => {
            remote.close();
            Err(ParleyError::Other(anyhow::anyhow!(
                "acquisition finished without both audio devices"
            )))
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> ParleyError {
    ParleyError::Other(anyhow::anyhow!("device open task failed: {e}"))
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub(crate) struct SessionActor<B, C> {
    config: SessionConfig,
    backend: Arc<B>,
    connector: Arc<C>,
    mailbox: Mailbox,
    status: StatusCell,
    log: ConversationLog,
    diagnostics: Arc<SessionDiagnostics>,

    generation: u64,
    pending_start: Option<oneshot::Sender<Result<()>>>,
    /// In-flight acquisition; aborted by teardown.
    acquisition: Option<JoinHandle<()>>,
    /// Remote opened before acquisition finished.
    open_signalled: bool,

    accumulator: TranscriptionAccumulator,
    scheduler: PlaybackScheduler,
    /// Device callback gate: samples reach the ring only while set.
    gate: Option<Arc<AtomicBool>>,
    input: Option<Box<dyn InputStream>>,
    /// Held from acquisition until the capture thread takes it.
    consumer: Option<AudioConsumer>,
    capture: Option<CaptureHandle>,
    remote: Option<Box<dyn RemoteSession>>,
}

impl<B, C> SessionActor<B, C>
where
    B: AudioBackend,
    C: RemoteConnector,
{
    pub(crate) fn new(
        config: SessionConfig,
        backend: B,
        connector: C,
        mailbox: Mailbox,
        status: StatusCell,
        log: ConversationLog,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Self {
        Self {
            config,
            backend: Arc::new(backend),
            connector: Arc::new(connector),
            mailbox,
            status,
            log,
            diagnostics,
            generation: 0,
            pending_start: None,
            acquisition: None,
            open_signalled: false,
            accumulator: TranscriptionAccumulator::new(),
            scheduler: PlaybackScheduler::new(),
            gate: None,
            input: None,
            consumer: None,
            capture: None,
            remote: None,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        info!("session actor started");
        while let Some(command) = rx.recv().await {
            match command {
                SessionCommand::Start { reply } => self.handle_start(reply),
                SessionCommand::Stop { reply } => self.handle_stop(reply),
                SessionCommand::Acquired { generation, result } => {
                    self.handle_acquired(generation, result)
                }
                SessionCommand::Remote { generation, signal } => {
                    self.handle_remote(generation, signal)
                }
                SessionCommand::Captured { generation, block } => {
                    self.handle_captured(generation, block)
                }
                SessionCommand::PlaybackEnded { generation, id } => {
                    self.handle_playback_ended(generation, id)
                }
                SessionCommand::Shutdown => {
                    self.shutdown();
                    break;
                }
            }
        }
        info!("session actor stopped");
    }

    // ── Commands ────────────────────────────────────────────────────────────

    fn handle_start(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.status.state().is_active() {
            let _ = reply.send(Err(ParleyError::AlreadyActive));
            return;
        }

        self.generation += 1;
        self.accumulator.clear();
        self.log.clear();
        self.diagnostics.reset();
        self.open_signalled = false;
        self.pending_start = Some(reply);
        self.status.set(ConnectionState::Connecting, None);

        let gate = Arc::new(AtomicBool::new(false));
        self.gate = Some(Arc::clone(&gate));

        let generation = self.generation;
        let backend = Arc::clone(&self.backend);
        let connector = Arc::clone(&self.connector);
        let setup = self.config.setup();
        let mailbox = self.mailbox.clone();
        info!(generation, model = %setup.model, "session starting");

        self.acquisition = Some(tokio::spawn(async move {
            let result = acquire(generation, backend, connector, setup, gate, mailbox.clone()).await;
            let _ = mailbox.send(SessionCommand::Acquired { generation, result });
        }));
    }

    fn handle_stop(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.status.state() == ConnectionState::Disconnected {
            let _ = reply.send(Ok(()));
            return;
        }

        self.teardown();
        if let Some(pending) = self.pending_start.take() {
            let _ = pending.send(Err(ParleyError::StartCancelled));
        }
        self.status.set(ConnectionState::Disconnected, None);
        info!("session stopped");
        let _ = reply.send(Ok(()));
    }

    fn shutdown(&mut self) {
        self.teardown();
        if let Some(pending) = self.pending_start.take() {
            let _ = pending.send(Err(ParleyError::EngineClosed));
        }
        if self.status.state().is_active() {
            self.status.set(ConnectionState::Disconnected, None);
        }
    }

    // ── Acquisition ─────────────────────────────────────────────────────────

    fn handle_acquired(&mut self, generation: u64, result: Result<Acquired>) {
        if generation != self.generation || self.status.state() != ConnectionState::Connecting {
            self.stale("acquisition result");
            if let Ok(acquired) = result {
                acquired.release();
            }
            return;
        }
        self.acquisition = None;

        match result {
            Ok(acquired) => {
                self.input = Some(acquired.input);
                self.consumer = Some(acquired.consumer);
                self.scheduler.attach(acquired.output);
                self.remote = Some(acquired.remote);
                info!("session resources acquired");
                if let Some(pending) = self.pending_start.take() {
                    let _ = pending.send(Ok(()));
                }
                if self.open_signalled {
                    self.on_open();
                }
            }
            Err(e) => {
                error!("session start failed: {e}");
                self.teardown();
                self.status
                    .set(ConnectionState::Error, Some(e.user_message()));
                match self.pending_start.take() {
                    Some(pending) => {
                        let _ = pending.send(Err(e));
                    }
                    None => warn!("start failure had no waiting caller"),
                }
            }
        }
    }

    /// Remote is open: start streaming the microphone.
    fn on_open(&mut self) {
        self.open_signalled = false;

        let (Some(consumer), Some(input)) = (self.consumer.take(), self.input.as_ref()) else {
            warn!("remote opened without acquired capture resources");
            return;
        };

        let mailbox = self.mailbox.clone();
        let generation = self.generation;
        let sink: BlockSink = Box::new(move |block| {
            let _ = mailbox.send(SessionCommand::Captured { generation, block });
        });
        let pipeline = CapturePipeline::new(
            self.config.block_size,
            self.config.capture_sample_rate,
            sink,
        );

        match capture::spawn(consumer, input.sample_rate(), pipeline) {
            Ok(handle) => {
                self.capture = Some(handle);
                if let Some(gate) = &self.gate {
                    gate.store(true, Ordering::Release);
                }
                self.status.set(ConnectionState::Connected, None);
            }
            Err(e) => {
                error!("failed to start capture: {e}");
                self.teardown();
                self.status
                    .set(ConnectionState::Error, Some(e.user_message()));
            }
        }
    }

    // ── Remote signals ──────────────────────────────────────────────────────

    fn handle_remote(&mut self, generation: u64, signal: RemoteSignal) {
        if generation != self.generation {
            self.stale("remote signal");
            return;
        }

        let state = self.status.state();
        match signal {
            RemoteSignal::Open => match state {
                ConnectionState::Connecting if self.remote.is_some() => self.on_open(),
                ConnectionState::Connecting => self.open_signalled = true,
                _ => debug!(?state, "ignoring remote open"),
            },
            RemoteSignal::Message(message) => {
                if state == ConnectionState::Connected {
                    self.dispatch(message);
                } else {
                    self.stale("inbound message");
                }
            }
            RemoteSignal::Malformed(detail) => {
                if state.is_active() {
                    SessionDiagnostics::bump(&self.diagnostics.decode_errors);
                    warn!("dropping malformed inbound frame: {detail}");
                }
            }
            RemoteSignal::Error(detail) => {
                if !state.is_active() {
                    debug!(?state, "ignoring remote error: {detail}");
                    return;
                }
                error!("remote session error: {detail}");
                self.teardown();
                self.status
                    .set(ConnectionState::Error, Some(TRANSPORT_MESSAGE.to_string()));
                if let Some(pending) = self.pending_start.take() {
                    let _ = pending.send(Err(ParleyError::Transport(detail)));
                }
            }
            RemoteSignal::Closed => {
                if !state.is_active() {
                    return;
                }
                info!("remote session closed");
                self.teardown();
                self.status.set(ConnectionState::Disconnected, None);
                if let Some(pending) = self.pending_start.take() {
                    let _ = pending.send(Err(ParleyError::Transport(
                        "session closed before it opened".into(),
                    )));
                }
            }
        }
    }

    /// Inbound dispatch, in the order the events appear in one frame.
    fn dispatch(&mut self, message: ServerMessage) {
        for event in message.into_events() {
            match event {
                InboundEvent::UserTranscript(delta) => self.accumulator.append_user(&delta),
                InboundEvent::ModelTranscript(delta) => self.accumulator.append_model(&delta),
                InboundEvent::TurnComplete => {
                    let records = self.accumulator.on_turn_complete();
                    SessionDiagnostics::bump(&self.diagnostics.turns_completed);
                    if !records.is_empty() {
                        self.log.extend(records);
                    }
                }
                InboundEvent::Audio(blob) => {
                    let decoded = codec::decode_blob(
                        &blob,
                        self.config.playback_sample_rate,
                        self.config.output_channels,
                    );
                    match decoded {
                        Ok(chunk) if chunk.is_empty() => {}
                        Ok(chunk) => match self.scheduler.enqueue(chunk) {
                            Ok(_) => SessionDiagnostics::bump(&self.diagnostics.chunks_scheduled),
                            Err(e) => warn!("failed to schedule model audio: {e}"),
                        },
                        Err(e) => {
                            SessionDiagnostics::bump(&self.diagnostics.decode_errors);
                            warn!("dropping undecodable model audio: {e}");
                        }
                    }
                }
                InboundEvent::Interrupted => {
                    let flushed = self.scheduler.on_interrupt();
                    SessionDiagnostics::bump(&self.diagnostics.interrupts);
                    info!(flushed, "model speech interrupted");
                }
            }
        }
    }

    // ── Capture & playback ──────────────────────────────────────────────────

    fn handle_captured(&mut self, generation: u64, block: AudioBlock) {
        if generation != self.generation || self.status.state() != ConnectionState::Connected {
            self.stale("captured block");
            return;
        }
        let Some(remote) = self.remote.as_ref() else {
            return;
        };
        match remote.send_realtime_input(RealtimeInput::from(block)) {
            Ok(()) => SessionDiagnostics::bump(&self.diagnostics.blocks_sent),
            Err(e) => {
                SessionDiagnostics::bump(&self.diagnostics.send_errors);
                warn!("failed to send captured block: {e}");
            }
        }
    }

    fn handle_playback_ended(&mut self, generation: u64, id: PlaybackId) {
        if generation != self.generation {
            self.stale("playback completion");
            return;
        }
        if self.scheduler.on_complete(id) {
            SessionDiagnostics::bump(&self.diagnostics.playback_completed);
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    /// Release everything the session holds. Safe on partial state and when
    /// called twice.
    fn teardown(&mut self) {
        if let Some(acquisition) = self.acquisition.take() {
            acquisition.abort();
        }
        if let Some(gate) = self.gate.take() {
            gate.store(false, Ordering::Release);
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut input) = self.input.take() {
            input.stop();
        }
        self.consumer = None;
        self.scheduler.reset();
        if let Some(remote) = self.remote.take() {
            remote.close();
        }
        self.open_signalled = false;

        let snap = self.diagnostics.snapshot();
        debug!(
            blocks_sent = snap.blocks_sent,
            chunks_scheduled = snap.chunks_scheduled,
            decode_errors = snap.decode_errors,
            "session torn down"
        );
    }

    fn stale(&self, what: &str) {
        SessionDiagnostics::bump(&self.diagnostics.stale_events);
        debug!(generation = self.generation, "dropping stale {what}");
    }
}
