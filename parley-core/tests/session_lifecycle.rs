use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use parking_lot::Mutex;
use parley_core::buffering::{chunk::pcm_mime_type, AudioProducer, Producer};
use parley_core::codec;
use parley_core::error::{PERMISSION_MESSAGE, TRANSPORT_MESSAGE};
use parley_core::playback::CompletionNotifier;
use parley_core::remote::protocol::{
    Blob, ModelTurn, RealtimeInput, ServerContent, ServerMessage, SessionSetup, Transcription,
};
use parley_core::{
    AudioBackend, ConnectionState, InputStream, ParleyEngine, ParleyError, PlaybackOutput,
    RemoteConnector, RemoteEventSender, RemoteSession, SessionConfig, Speaker, TurnEvent,
    VirtualClock,
};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Fake microphone + playback clock
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BackendState {
    clock: VirtualClock,
    deny_microphone: AtomicBool,
    fail_output: AtomicBool,
    producer: Mutex<Option<AudioProducer>>,
    gate: Mutex<Option<Arc<AtomicBool>>>,
    inputs_opened: AtomicUsize,
    inputs_stopped: AtomicUsize,
}

#[derive(Clone, Default)]
struct FakeBackend {
    state: Arc<BackendState>,
}

impl FakeBackend {
    fn clock(&self) -> &VirtualClock {
        &self.state.clock
    }

    fn deny_microphone(&self, deny: bool) {
        self.state.deny_microphone.store(deny, Ordering::SeqCst);
    }

    fn fail_output(&self, fail: bool) {
        self.state.fail_output.store(fail, Ordering::SeqCst);
    }

    /// Behave like the device callback: push only while the gate is open.
    fn feed(&self, samples: &[f32]) -> usize {
        let open = self
            .state
            .gate
            .lock()
            .as_ref()
            .map(|g| g.load(Ordering::Acquire))
            .unwrap_or(false);
        if !open {
            return 0;
        }
        self.state
            .producer
            .lock()
            .as_mut()
            .map(|p| p.push_slice(samples))
            .unwrap_or(0)
    }

    fn inputs_opened(&self) -> usize {
        self.state.inputs_opened.load(Ordering::SeqCst)
    }

    fn inputs_stopped(&self) -> usize {
        self.state.inputs_stopped.load(Ordering::SeqCst)
    }
}

struct FakeInput {
    state: Arc<BackendState>,
    stopped: bool,
}

impl InputStream for FakeInput {
    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.state.inputs_stopped.fetch_add(1, Ordering::SeqCst);
        self.state.producer.lock().take();
    }
}

impl AudioBackend for FakeBackend {
    fn open_input(
        &self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
    ) -> parley_core::Result<Box<dyn InputStream>> {
        if self.state.deny_microphone.load(Ordering::SeqCst) {
            return Err(ParleyError::Permission("denied by test".into()));
        }
        self.state.inputs_opened.fetch_add(1, Ordering::SeqCst);
        *self.state.producer.lock() = Some(producer);
        *self.state.gate.lock() = Some(running);
        Ok(Box::new(FakeInput {
            state: Arc::clone(&self.state),
            stopped: false,
        }))
    }

    fn open_output(
        &self,
        notifier: CompletionNotifier,
    ) -> parley_core::Result<Box<dyn PlaybackOutput>> {
        if self.state.fail_output.load(Ordering::SeqCst) {
            return Err(ParleyError::NoDefaultOutputDevice);
        }
        Ok(Box::new(self.state.clock.output(Some(notifier))))
    }
}

// ---------------------------------------------------------------------------
// Scripted remote
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    events: Mutex<Option<RemoteEventSender>>,
    setups: Mutex<Vec<SessionSetup>>,
    sent: Mutex<Vec<RealtimeInput>>,
    hold_connect: AtomicBool,
    release: Notify,
    open_on_connect: AtomicBool,
    refuse_connect: AtomicBool,
}

#[derive(Clone, Default)]
struct ScriptedConnector {
    state: Arc<ScriptState>,
}

impl ScriptedConnector {
    fn events(&self) -> RemoteEventSender {
        self.state
            .events
            .lock()
            .clone()
            .expect("connect was never called")
    }

    fn open(&self) {
        self.events().opened();
    }

    fn deliver(&self, content: ServerContent) {
        self.events().message(ServerMessage::from_content(content));
    }

    fn fail(&self, detail: &str) {
        self.events().error(detail);
    }

    fn close_remote(&self) {
        self.events().closed();
    }

    fn refuse(&self, refuse: bool) {
        self.state.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    fn hold(&self) {
        self.state.hold_connect.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.state.release.notify_one();
    }

    fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    fn sent(&self) -> Vec<RealtimeInput> {
        self.state.sent.lock().clone()
    }
}

struct ScriptedSession {
    state: Arc<ScriptState>,
}

impl RemoteSession for ScriptedSession {
    fn send_realtime_input(&self, input: RealtimeInput) -> parley_core::Result<()> {
        self.state.sent.lock().push(input);
        Ok(())
    }

    fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl RemoteConnector for ScriptedConnector {
    fn connect(
        &self,
        setup: SessionSetup,
        events: RemoteEventSender,
    ) -> impl Future<Output = parley_core::Result<Box<dyn RemoteSession>>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            state.connects.fetch_add(1, Ordering::SeqCst);
            state.setups.lock().push(setup);
            *state.events.lock() = Some(events.clone());
            if state.hold_connect.load(Ordering::SeqCst) {
                state.release.notified().await;
            }
            if state.refuse_connect.load(Ordering::SeqCst) {
                return Err(ParleyError::Transport("handshake refused".into()));
            }
            if state.open_on_connect.load(Ordering::SeqCst) {
                events.opened();
            }
            Ok(Box::new(ScriptedSession { state }) as Box<dyn RemoteSession>)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn spawn_engine(backend: &FakeBackend, connector: &ScriptedConnector) -> ParleyEngine {
    ParleyEngine::spawn(SessionConfig::default(), backend.clone(), connector.clone())
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn connected() -> (ParleyEngine, FakeBackend, ScriptedConnector) {
    let backend = FakeBackend::default();
    let connector = ScriptedConnector::default();
    let engine = spawn_engine(&backend, &connector);

    engine.start().await.expect("start");
    connector.open();
    wait_for("connected", || engine.state() == ConnectionState::Connected).await;
    (engine, backend, connector)
}

fn model_audio(seconds: f64) -> ServerContent {
    let samples = vec![0.2f32; (seconds * 24_000.0) as usize];
    let bytes = codec::encode(&samples, 24_000).to_le_bytes();
    ServerContent {
        model_turn: Some(ModelTurn::audio(Blob {
            data: codec::encode_base64(&bytes),
            mime_type: pcm_mime_type(24_000),
        })),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connected_only_after_open_and_blocks_flow_in_order() {
    let backend = FakeBackend::default();
    let connector = ScriptedConnector::default();
    let engine = spawn_engine(&backend, &connector);
    let mut status = engine.subscribe_status();

    engine.start().await.expect("start");
    assert_eq!(engine.state(), ConnectionState::Connecting);
    // Capture gate stays closed until the remote opens.
    assert_eq!(backend.feed(&[0.5; 64]), 0);

    connector.open();
    wait_for("connected", || engine.state() == ConnectionState::Connected).await;

    let states: Vec<ConnectionState> = std::iter::from_fn(|| status.try_recv().ok())
        .map(|e| e.state)
        .collect();
    assert_eq!(
        states,
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );

    for level in [0.1f32, 0.2, 0.3] {
        assert_eq!(backend.feed(&vec![level; 4096]), 4096);
    }
    wait_for("three blocks sent", || connector.sent().len() == 3).await;

    let firsts: Vec<f32> = connector
        .sent()
        .iter()
        .map(|input| {
            assert_eq!(input.media.mime_type, "audio/pcm;rate=16000");
            let block = codec::decode_blob(&input.media, 16_000, 1).expect("decode");
            assert_eq!(block.samples.len(), 4096);
            block.samples[0]
        })
        .collect();
    assert_relative_eq!(firsts[0], 0.1, epsilon = 1e-3);
    assert_relative_eq!(firsts[1], 0.2, epsilon = 1e-3);
    assert_relative_eq!(firsts[2], 0.3, epsilon = 1e-3);

    let setups = connector.state.setups.lock().clone();
    assert_eq!(setups.len(), 1);
    assert_eq!(setups[0].input_mime_type, "audio/pcm;rate=16000");
}

#[tokio::test]
async fn start_while_active_is_rejected_without_a_second_session() {
    let backend = FakeBackend::default();
    let connector = ScriptedConnector::default();
    let engine = spawn_engine(&backend, &connector);

    engine.start().await.expect("start");
    assert!(matches!(
        engine.start().await,
        Err(ParleyError::AlreadyActive)
    ));
    assert_eq!(engine.state(), ConnectionState::Connecting);

    connector.open();
    wait_for("connected", || engine.state() == ConnectionState::Connected).await;
    assert!(matches!(
        engine.start().await,
        Err(ParleyError::AlreadyActive)
    ));
    assert_eq!(connector.connects(), 1);
    assert_eq!(engine.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn stop_while_disconnected_is_a_no_op() {
    let backend = FakeBackend::default();
    let connector = ScriptedConnector::default();
    let engine = spawn_engine(&backend, &connector);
    let mut status = engine.subscribe_status();

    engine.stop().await.expect("stop");
    engine.stop().await.expect("stop again");

    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert!(status.try_recv().is_err());
    assert_eq!(connector.closes(), 0);
    assert_eq!(backend.clock().closed_count(), 0);
}

#[tokio::test]
async fn stop_tears_down_and_allows_restart() {
    let (engine, backend, connector) = connected().await;

    engine.stop().await.expect("stop");
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert_eq!(connector.closes(), 1);
    assert_eq!(backend.inputs_stopped(), 1);
    assert_eq!(backend.clock().closed_count(), 1);
    assert_eq!(backend.feed(&[0.1; 16]), 0);

    engine.start().await.expect("restart");
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn undecodable_audio_keeps_the_session_connected() {
    let (engine, backend, connector) = connected().await;

    connector.deliver(ServerContent {
        model_turn: Some(ModelTurn::audio(Blob {
            data: "%%% not base64 %%%".into(),
            mime_type: pcm_mime_type(24_000),
        })),
        ..Default::default()
    });
    connector.deliver(ServerContent {
        model_turn: Some(ModelTurn::audio(Blob {
            data: codec::encode_base64(&[1, 2, 3]),
            mime_type: pcm_mime_type(24_000),
        })),
        ..Default::default()
    });
    wait_for("decode errors", || {
        engine.diagnostics_snapshot().decode_errors == 2
    })
    .await;
    assert_eq!(engine.state(), ConnectionState::Connected);

    connector.deliver(model_audio(0.5));
    wait_for("chunk scheduled", || {
        engine.diagnostics_snapshot().chunks_scheduled == 1
    })
    .await;

    let started = backend.clock().started();
    assert_eq!(started.len(), 1);
    assert_relative_eq!(started[0].duration, 0.5, epsilon = 1e-9);
    assert_eq!(engine.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn turns_reach_the_log_only_on_turn_complete() {
    let (engine, _backend, connector) = connected().await;
    let mut turns = engine.subscribe_turns();

    for delta in ["Hel", "lo "] {
        connector.deliver(ServerContent {
            input_transcription: Some(Transcription::new(delta)),
            ..Default::default()
        });
    }
    for delta in ["Hi", " there"] {
        connector.deliver(ServerContent {
            output_transcription: Some(Transcription::new(delta)),
            ..Default::default()
        });
    }
    // Whitespace-only user side in the second turn yields no user record.
    connector.deliver(ServerContent {
        turn_complete: true,
        ..Default::default()
    });
    connector.deliver(ServerContent {
        input_transcription: Some(Transcription::new("   ")),
        output_transcription: Some(Transcription::new("Anything else?")),
        turn_complete: true,
        ..Default::default()
    });

    wait_for("three records", || engine.conversation().len() == 3).await;
    let log = engine.conversation();
    assert_eq!((log[0].speaker, log[0].text.as_str()), (Speaker::User, "Hello"));
    assert_eq!((log[1].speaker, log[1].text.as_str()), (Speaker::Model, "Hi there"));
    assert_eq!(
        (log[2].speaker, log[2].text.as_str()),
        (Speaker::Model, "Anything else?")
    );

    match turns.try_recv().expect("turn event") {
        TurnEvent::Appended { seq, record } => {
            assert_eq!(seq, 0);
            assert_eq!(record.speaker, Speaker::User);
        }
        other => panic!("expected an appended turn, got {other:?}"),
    }
    assert_eq!(engine.diagnostics_snapshot().turns_completed, 2);
}

#[tokio::test]
async fn restart_announces_the_cleared_log() {
    let (engine, _backend, connector) = connected().await;
    connector.deliver(ServerContent {
        input_transcription: Some(Transcription::new("Hello")),
        turn_complete: true,
        ..Default::default()
    });
    wait_for("one record", || engine.conversation().len() == 1).await;

    engine.stop().await.expect("stop");
    let mut turns = engine.subscribe_turns();
    engine.start().await.expect("restart");

    assert!(engine.conversation().is_empty());
    assert!(matches!(
        turns.try_recv(),
        Ok(TurnEvent::Cleared { seq: 1 })
    ));
}

#[tokio::test]
async fn interrupt_flushes_queued_speech() {
    let (engine, backend, connector) = connected().await;

    connector.deliver(model_audio(1.0));
    connector.deliver(model_audio(1.0));
    wait_for("two chunks scheduled", || {
        engine.diagnostics_snapshot().chunks_scheduled == 2
    })
    .await;
    assert_eq!(backend.clock().playing_len(), 2);

    backend.clock().advance(0.25);
    connector.deliver(ServerContent {
        interrupted: true,
        ..Default::default()
    });
    wait_for("interrupt", || engine.diagnostics_snapshot().interrupts == 1).await;
    assert_eq!(backend.clock().stopped().len(), 2);
    assert_eq!(backend.clock().playing_len(), 0);

    connector.deliver(model_audio(0.5));
    wait_for("third chunk", || {
        engine.diagnostics_snapshot().chunks_scheduled == 3
    })
    .await;
    let started = backend.clock().started();
    assert_relative_eq!(started[2].start_time, 0.25, epsilon = 1e-9);
}

#[tokio::test]
async fn natural_completion_is_reported_back() {
    let (engine, backend, connector) = connected().await;

    connector.deliver(model_audio(0.5));
    wait_for("scheduled", || {
        engine.diagnostics_snapshot().chunks_scheduled == 1
    })
    .await;

    assert_eq!(backend.clock().advance(0.6).len(), 1);
    wait_for("completion", || {
        engine.diagnostics_snapshot().playback_completed == 1
    })
    .await;
}

#[tokio::test]
async fn denied_microphone_enters_error_and_recovers() {
    let backend = FakeBackend::default();
    let connector = ScriptedConnector::default();
    let engine = spawn_engine(&backend, &connector);

    backend.deny_microphone(true);
    let err = engine.start().await.expect_err("start must fail");
    assert!(matches!(err, ParleyError::Permission(_)));
    assert_eq!(engine.state(), ConnectionState::Error);
    assert_eq!(engine.last_error().as_deref(), Some(PERMISSION_MESSAGE));
    assert_eq!(connector.connects(), 0);
    assert_eq!(backend.clock().opened_count(), 0);

    backend.deny_microphone(false);
    engine.start().await.expect("retry");
    assert_eq!(engine.state(), ConnectionState::Connecting);
    assert_eq!(engine.last_error(), None);
}

#[tokio::test]
async fn remote_error_tears_everything_down() {
    let (engine, backend, connector) = connected().await;
    connector.deliver(model_audio(1.0));
    wait_for("scheduled", || {
        engine.diagnostics_snapshot().chunks_scheduled == 1
    })
    .await;

    connector.fail("socket reset");
    wait_for("error state", || engine.state() == ConnectionState::Error).await;

    assert_eq!(engine.last_error().as_deref(), Some(TRANSPORT_MESSAGE));
    assert_eq!(connector.closes(), 1);
    assert_eq!(backend.inputs_stopped(), 1);
    assert_eq!(backend.clock().closed_count(), 1);
    assert_eq!(backend.clock().playing_len(), 0);
    assert_eq!(backend.feed(&[0.1; 16]), 0);

    engine.stop().await.expect("stop");
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert_eq!(connector.closes(), 1);
}

#[tokio::test]
async fn remote_close_returns_to_disconnected() {
    let (engine, backend, connector) = connected().await;

    connector.close_remote();
    wait_for("disconnected", || {
        engine.state() == ConnectionState::Disconnected
    })
    .await;

    assert_eq!(engine.last_error(), None);
    assert_eq!(backend.inputs_stopped(), 1);
    assert_eq!(backend.clock().closed_count(), 1);
}

#[tokio::test]
async fn stop_during_connecting_cancels_the_pending_start() {
    let backend = FakeBackend::default();
    let connector = ScriptedConnector::default();
    connector.hold();
    let engine = Arc::new(spawn_engine(&backend, &connector));

    let starter = Arc::clone(&engine);
    let pending = tokio::spawn(async move { starter.start().await });
    wait_for("connect entered", || connector.connects() == 1).await;
    assert_eq!(engine.state(), ConnectionState::Connecting);

    engine.stop().await.expect("stop");
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    let result = pending.await.expect("join");
    assert!(matches!(result, Err(ParleyError::StartCancelled)));

    // The abandoned acquisition gives back the devices it had opened.
    wait_for("input stopped", || backend.inputs_stopped() == 1).await;
    wait_for("output closed", || backend.clock().closed_count() == 1).await;

    connector.release();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connector.closes(), 0);
    assert_eq!(engine.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn restart_after_cancelled_start_runs_a_single_acquisition() {
    let backend = FakeBackend::default();
    let connector = ScriptedConnector::default();
    connector.hold();
    let engine = Arc::new(spawn_engine(&backend, &connector));

    let starter = Arc::clone(&engine);
    let first = tokio::spawn(async move { starter.start().await });
    wait_for("first connect entered", || connector.connects() == 1).await;
    engine.stop().await.expect("stop");
    assert!(matches!(
        first.await.expect("join"),
        Err(ParleyError::StartCancelled)
    ));
    wait_for("first input stopped", || backend.inputs_stopped() == 1).await;

    connector.state.hold_connect.store(false, Ordering::SeqCst);
    engine.start().await.expect("restart");
    connector.open();
    wait_for("connected", || engine.state() == ConnectionState::Connected).await;

    // Only the second microphone is live, and the first never produced a session.
    assert_eq!(backend.inputs_opened(), 2);
    assert_eq!(backend.inputs_stopped(), 1);
    assert_eq!(backend.clock().opened_count(), 2);
    assert_eq!(backend.clock().closed_count(), 1);
    assert_eq!(connector.closes(), 0);
    assert_eq!(engine.diagnostics_snapshot().stale_events, 0);
}

#[tokio::test]
async fn output_failure_releases_the_microphone() {
    let backend = FakeBackend::default();
    let connector = ScriptedConnector::default();
    let engine = spawn_engine(&backend, &connector);

    backend.fail_output(true);
    let err = engine.start().await.expect_err("start must fail");
    assert!(matches!(err, ParleyError::NoDefaultOutputDevice));
    assert_eq!(engine.state(), ConnectionState::Error);
    assert_eq!(engine.last_error().as_deref(), Some(PERMISSION_MESSAGE));
    assert_eq!(backend.inputs_opened(), 1);
    assert_eq!(backend.inputs_stopped(), 1);
    assert_eq!(backend.clock().opened_count(), 0);
    assert_eq!(connector.connects(), 0);
    assert_eq!(backend.feed(&[0.1; 16]), 0);

    backend.fail_output(false);
    engine.start().await.expect("retry");
    assert_eq!(engine.last_error(), None);
}

#[tokio::test]
async fn refused_connect_releases_microphone_and_clock() {
    let backend = FakeBackend::default();
    let connector = ScriptedConnector::default();
    let engine = spawn_engine(&backend, &connector);

    connector.refuse(true);
    let err = engine.start().await.expect_err("start must fail");
    assert!(matches!(err, ParleyError::Transport(_)));
    assert_eq!(engine.state(), ConnectionState::Error);
    assert_eq!(engine.last_error().as_deref(), Some(TRANSPORT_MESSAGE));
    assert_eq!(connector.connects(), 1);
    assert_eq!(backend.inputs_stopped(), backend.inputs_opened());
    assert_eq!(backend.clock().closed_count(), backend.clock().opened_count());
    assert_eq!(backend.clock().closed_count(), 1);
    assert_eq!(connector.closes(), 0);
}

#[tokio::test]
async fn open_racing_acquisition_is_remembered() {
    let backend = FakeBackend::default();
    let connector = ScriptedConnector::default();
    connector.state.open_on_connect.store(true, Ordering::SeqCst);
    let engine = spawn_engine(&backend, &connector);

    engine.start().await.expect("start");
    wait_for("connected", || engine.state() == ConnectionState::Connected).await;
    assert_eq!(backend.feed(&[0.1; 16]), 16);
}
