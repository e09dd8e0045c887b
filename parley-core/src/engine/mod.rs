//! `ParleyEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──start──► Connecting ──remote open──► Connected
//!      ▲                     │   │                       │
//!      │                     │   └──acquire fails──► Error
//!      └───────stop / remote close───────────────────────┘
//! ```
//!
//! `start()` resolves once microphone, playback clock and remote session are
//! all acquired; the state reaches `Connected` only when the remote side
//! reports open. `stop()` always lands in `Disconnected` and is a no-op when
//! already there.
//!
//! ## Threading
//!
//! All session state lives in one actor task (see [`session`]). The engine
//! handle only sends commands and reads shared status, so it is
//! `Send + Sync` and cheap to share behind an `Arc`.

pub mod session;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    audio::AudioBackend,
    buffering::chunk::pcm_mime_type,
    capture::DEFAULT_BLOCK_SIZE,
    error::{ParleyError, Result},
    ipc::events::{ConnectionState, ConnectionStatusEvent, TurnEvent},
    remote::{
        protocol::{Modality, SessionSetup},
        RemoteConnector,
    },
    transcript::{ConversationLog, TurnRecord},
};
use session::{SessionActor, SessionCommand, StatusCell};

pub use session::{DiagnosticsSnapshot, SessionDiagnostics};

/// Broadcast channel capacity for status events.
const BROADCAST_CAP: usize = 256;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a friendly and helpful creative assistant. \
Keep your responses concise and conversational.";

/// Configuration for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Rate of outbound audio (Hz). Default: 16000.
    pub capture_sample_rate: u32,
    /// Samples per outbound block. Default: 4096.
    pub block_size: usize,
    /// Rate assumed for inbound audio that does not declare one. Default: 24000.
    pub playback_sample_rate: u32,
    /// Channel count of inbound audio. Default: 1.
    pub output_channels: u16,
    pub model: String,
    /// Prebuilt voice. `None` lets the remote pick.
    pub voice_name: Option<String>,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            block_size: DEFAULT_BLOCK_SIZE,
            playback_sample_rate: 24_000,
            output_channels: 1,
            model: DEFAULT_MODEL.to_string(),
            voice_name: Some(DEFAULT_VOICE.to_string()),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            input_transcription: true,
            output_transcription: true,
        }
    }
}

impl SessionConfig {
    /// What the remote side is told when the session opens.
    pub fn setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.model.clone(),
            response_modalities: vec![Modality::Audio],
            system_instruction: self.system_instruction.clone(),
            voice_name: self.voice_name.clone(),
            input_audio_transcription: self.input_transcription,
            output_audio_transcription: self.output_transcription,
            input_mime_type: pcm_mime_type(self.capture_sample_rate),
        }
    }
}

/// The top-level engine handle.
///
/// Must be created inside a tokio runtime. Dropping it tears the session
/// down and stops the actor.
pub struct ParleyEngine {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: StatusCell,
    conversation: ConversationLog,
    diagnostics: Arc<SessionDiagnostics>,
}

impl ParleyEngine {
    /// Spawn the session actor. Nothing is acquired until [`Self::start`].
    pub fn spawn<B, C>(config: SessionConfig, backend: B, connector: C) -> Self
    where
        B: AudioBackend,
        C: RemoteConnector,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let status = StatusCell::new(BROADCAST_CAP);
        let conversation = ConversationLog::new();
        let diagnostics = Arc::new(SessionDiagnostics::default());

        let actor = SessionActor::new(
            config,
            backend,
            connector,
            commands.clone(),
            status.clone(),
            conversation.clone(),
            Arc::clone(&diagnostics),
        );
        tokio::spawn(actor.run(rx));

        Self {
            commands,
            status,
            conversation,
            diagnostics,
        }
    }

    /// Start a conversation.
    ///
    /// # Errors
    /// - `ParleyError::AlreadyActive` while Connecting or Connected.
    /// - A device or transport error if acquisition fails (state → Error).
    /// - `ParleyError::StartCancelled` if `stop()` arrives first.
    pub async fn start(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Start { reply })?;
        rx.await.map_err(|_| ParleyError::EngineClosed)?
    }

    /// Stop the conversation and release every device. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Stop { reply })?;
        rx.await.map_err(|_| ParleyError::EngineClosed)?
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state()
    }

    /// User-facing reason for the last transition into `Error`. Cleared by
    /// the next start.
    pub fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    /// Finalized turns so far, in order.
    pub fn conversation(&self) -> Vec<TurnRecord> {
        self.conversation.snapshot()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatusEvent> {
        self.status.subscribe()
    }

    pub fn subscribe_turns(&self) -> broadcast::Receiver<TurnEvent> {
        self.conversation.subscribe()
    }

    /// Snapshot of session counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ParleyError::EngineClosed)
    }
}

impl Drop for ParleyEngine {
    fn drop(&mut self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_wire_rates() {
        let config = SessionConfig::default();
        assert_eq!(config.capture_sample_rate, 16_000);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.playback_sample_rate, 24_000);
        assert_eq!(config.output_channels, 1);
    }

    #[test]
    fn setup_declares_audio_modality_and_input_format() {
        let setup = SessionConfig::default().setup();
        assert_eq!(setup.response_modalities, vec![Modality::Audio]);
        assert_eq!(setup.input_mime_type, "audio/pcm;rate=16000");
        assert_eq!(setup.voice_name.as_deref(), Some(DEFAULT_VOICE));
        assert!(setup.input_audio_transcription && setup.output_audio_transcription);
    }

    #[test]
    fn config_deserializes_with_defaults_for_missing_fields() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"voiceName":"Puck","blockSize":2048}"#).expect("parse");
        assert_eq!(config.voice_name.as_deref(), Some("Puck"));
        assert_eq!(config.block_size, 2048);
        assert_eq!(config.model, DEFAULT_MODEL);
    }
}
