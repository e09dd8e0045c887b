//! Remote conversational session abstraction.
//!
//! The network transport is not part of this crate. A transport implements
//! [`RemoteConnector`] and reports everything it hears through the
//! [`RemoteEventSender`] it was handed; the session engine never sees the
//! transport's own callbacks.
//!
//! [`loopback::LoopbackConnector`] is a local stand-in that echoes captured
//! speech back, so the full capture → playback path can be exercised without
//! a network peer.

pub mod loopback;
pub mod protocol;

use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use protocol::{RealtimeInput, ServerMessage, SessionSetup};

/// Opens duplex sessions.
pub trait RemoteConnector: Send + Sync + 'static {
    /// Open a session. Resolves once the transport exists; the remote side
    /// signals readiness separately via [`RemoteEventSender::opened`].
    ///
    /// The future is dropped if the session is stopped before it resolves;
    /// no session may outlive a dropped attempt.
    ///
    /// # Errors
    /// `ParleyError::Transport` if the session cannot be created.
    fn connect(
        &self,
        setup: SessionSetup,
        events: RemoteEventSender,
    ) -> impl Future<Output = Result<Box<dyn RemoteSession>>> + Send;
}

/// Outbound half of an open session.
pub trait RemoteSession: Send {
    /// Queue one realtime audio frame. Must not block.
    fn send_realtime_input(&self, input: RealtimeInput) -> Result<()>;

    /// Request close. Must not block; completion is reported via
    /// [`RemoteEventSender::closed`].
    fn close(&self);
}

/// Everything a transport can report.
#[derive(Debug, Clone)]
pub enum RemoteSignal {
    Open,
    Message(ServerMessage),
    /// An inbound frame that could not be parsed.
    Malformed(String),
    Error(String),
    Closed,
}

/// Delivery handle a transport uses to report inbound activity.
///
/// Cheap to clone. Delivery never blocks.
#[derive(Clone)]
pub struct RemoteEventSender {
    deliver: Arc<dyn Fn(RemoteSignal) + Send + Sync>,
}

impl RemoteEventSender {
    pub fn new(deliver: impl Fn(RemoteSignal) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn send(&self, signal: RemoteSignal) {
        (self.deliver)(signal);
    }

    pub fn opened(&self) {
        self.send(RemoteSignal::Open);
    }

    pub fn message(&self, message: ServerMessage) {
        self.send(RemoteSignal::Message(message));
    }

    /// Parse a raw JSON frame and deliver it, or report it as malformed.
    pub fn raw_message(&self, raw: &str) {
        match ServerMessage::from_json(raw) {
            Ok(message) => self.message(message),
            Err(e) => self.send(RemoteSignal::Malformed(e.to_string())),
        }
    }

    pub fn error(&self, detail: impl Into<String>) {
        self.send(RemoteSignal::Error(detail.into()));
    }

    pub fn closed(&self) {
        self.send(RemoteSignal::Closed);
    }
}

impl std::fmt::Debug for RemoteEventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEventSender").finish_non_exhaustive()
    }
}
