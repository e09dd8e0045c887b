use thiserror::Error;

/// Shown when the microphone (or a device it depends on) cannot be acquired.
pub const PERMISSION_MESSAGE: &str =
    "Failed to get microphone permissions. Please allow microphone access and try again.";

/// Shown when the remote session fails or drops unexpectedly.
pub const TRANSPORT_MESSAGE: &str = "An error occurred during the session. Please try again.";

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("microphone unavailable: {0}")]
    Permission(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("remote session error: {0}")]
    Transport(String),

    #[error("malformed payload: {0}")]
    Decode(String),

    #[error("session is already connecting or connected")]
    AlreadyActive,

    #[error("start was cancelled by stop")]
    StartCancelled,

    #[error("no playback output is attached")]
    NoPlaybackOutput,

    #[error("session engine has shut down")]
    EngineClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Text suitable for the presentation layer.
    pub fn user_message(&self) -> String {
        match self {
            Self::Permission(_)
            | Self::NoDefaultInputDevice
            | Self::NoDefaultOutputDevice
            | Self::AudioDevice(_)
            | Self::AudioStream(_) => PERMISSION_MESSAGE.to_string(),
            Self::Transport(_) => TRANSPORT_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
