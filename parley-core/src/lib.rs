//! # parley-core
//!
//! Real-time duplex voice-conversation engine.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioBackend input → SPSC RingBuffer → capture thread
//!                                                        │ resample → 16 kHz, 4096-sample blocks
//!                                                        ▼
//!                                               SessionActor mailbox ──► RemoteSession
//!                                                        ▲
//! RemoteEventSender ── open / message / error / close ───┘
//!        │
//!        ├─ transcripts ──► TranscriptionAccumulator ──► ConversationLog ──► broadcast<TurnEvent>
//!        └─ audio / interrupt ──► PlaybackScheduler ──► PlaybackOutput (device clock)
//! ```
//!
//! The audio callbacks never allocate in steady state and never lock; all
//! session state is owned by a single actor task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod remote;
pub mod transcript;

// Convenience re-exports for downstream crates
pub use audio::{AudioBackend, InputStream};
#[cfg(feature = "audio-cpal")]
pub use audio::CpalBackend;
pub use engine::{DiagnosticsSnapshot, ParleyEngine, SessionConfig};
pub use error::{ParleyError, Result};
pub use ipc::events::{ConnectionState, ConnectionStatusEvent, TurnEvent};
pub use playback::{
    virtual_clock::VirtualClock, CompletionNotifier, PlaybackOutput, PlaybackScheduler,
};
pub use remote::{
    loopback::LoopbackConnector, RemoteConnector, RemoteEventSender, RemoteSession, RemoteSignal,
};
pub use transcript::{ConversationLog, Speaker, TurnRecord};
