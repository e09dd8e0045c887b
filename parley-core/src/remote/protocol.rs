//! Wire shapes exchanged with the remote conversational model.
//!
//! Field names follow the live-session JSON (`serverContent.modelTurn.parts[].inlineData`,
//! `realtimeInput.media`, ...) so a transport can deserialize frames directly.

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

/// Transport-encoded media payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    /// Base64 of the raw bytes.
    pub data: String,
    pub mime_type: String,
}

/// One outbound realtime audio frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media: Blob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

/// Everything the remote side needs to open a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    pub response_modalities: Vec<Modality>,
    pub system_instruction: String,
    pub voice_name: Option<String>,
    /// Ask the remote to transcribe the user's speech.
    pub input_audio_transcription: bool,
    /// Ask the remote to transcribe its own speech.
    pub output_audio_transcription: bool,
    /// Declared format of outbound audio, e.g. `audio/pcm;rate=16000`.
    pub input_mime_type: String,
}

/// One inbound frame. Every field is optional; several may be set at once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    pub turn_complete: bool,
    pub model_turn: Option<ModelTurn>,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transcription {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Part {
    pub text: Option<String>,
    pub inline_data: Option<Blob>,
}

/// A single inbound occurrence, as consumed by the session dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    UserTranscript(String),
    ModelTranscript(String),
    TurnComplete,
    Audio(Blob),
    Interrupted,
}

impl ServerMessage {
    /// Parse a raw JSON frame.
    ///
    /// # Errors
    /// `ParleyError::Decode` when the frame is not a valid server message.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ParleyError::Decode(format!("server message: {e}")))
    }

    pub fn from_content(content: ServerContent) -> Self {
        Self {
            server_content: Some(content),
        }
    }

    /// Flatten into events, in dispatch order: transcripts, turn-complete,
    /// audio parts, interrupt.
    pub fn into_events(self) -> Vec<InboundEvent> {
        let Some(content) = self.server_content else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if let Some(t) = content.input_transcription {
            events.push(InboundEvent::UserTranscript(t.text));
        }
        if let Some(t) = content.output_transcription {
            events.push(InboundEvent::ModelTranscript(t.text));
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }
        if let Some(turn) = content.model_turn {
            events.extend(
                turn.parts
                    .into_iter()
                    .filter_map(|p| p.inline_data)
                    .filter(|blob| !blob.data.is_empty())
                    .map(InboundEvent::Audio),
            );
        }
        if content.interrupted {
            events.push(InboundEvent::Interrupted);
        }
        events
    }
}

impl ModelTurn {
    pub fn audio(blob: Blob) -> Self {
        Self {
            parts: vec![Part {
                text: None,
                inline_data: Some(blob),
            }],
        }
    }
}

impl Transcription {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}
