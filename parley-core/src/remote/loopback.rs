//! `LoopbackConnector`: local stand-in for a remote conversational model.
//!
//! Used by the console host and in development before a real transport is
//! wired in. It collects the user's realtime audio and, every `turn_blocks`
//! blocks, answers with one frame that carries both transcripts, the captured
//! audio played back as "model speech", and a turn-complete marker.

use std::future::Future;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    protocol::{
        Blob, ModelTurn, RealtimeInput, ServerContent, ServerMessage, SessionSetup,
        Transcription,
    },
    RemoteConnector, RemoteEventSender, RemoteSession,
};
use crate::{
    buffering::chunk::pcm_mime_type,
    codec,
    error::{ParleyError, Result},
};

/// Reply after 12 blocks: ≈ 3 s of speech at 4096 samples / 16 kHz.
pub const DEFAULT_TURN_BLOCKS: usize = 12;

/// Echo-style loopback connector.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    turn_blocks: usize,
}

impl LoopbackConnector {
    pub fn new(turn_blocks: usize) -> Self {
        Self {
            turn_blocks: turn_blocks.max(1),
        }
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new(DEFAULT_TURN_BLOCKS)
    }
}

impl RemoteConnector for LoopbackConnector {
    fn connect(
        &self,
        setup: SessionSetup,
        events: RemoteEventSender,
    ) -> impl Future<Output = Result<Box<dyn RemoteSession>>> + Send {
        let turn_blocks = self.turn_blocks;
        async move {
            info!(model = %setup.model, turn_blocks, "loopback session opening");
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run(rx, events, turn_blocks));
            Ok(Box::new(LoopbackSession { tx }) as Box<dyn RemoteSession>)
        }
    }
}

enum LoopbackInput {
    Audio(RealtimeInput),
    Close,
}

struct LoopbackSession {
    tx: mpsc::UnboundedSender<LoopbackInput>,
}

impl RemoteSession for LoopbackSession {
    fn send_realtime_input(&self, input: RealtimeInput) -> Result<()> {
        self.tx
            .send(LoopbackInput::Audio(input))
            .map_err(|_| ParleyError::Transport("loopback session is closed".into()))
    }

    fn close(&self) {
        let _ = self.tx.send(LoopbackInput::Close);
    }
}

/// One user turn's worth of captured PCM.
#[derive(Default)]
struct PendingTurn {
    pcm: Vec<u8>,
    blocks: usize,
    sample_rate: u32,
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<LoopbackInput>,
    events: RemoteEventSender,
    turn_blocks: usize,
) {
    events.opened();

    let mut turn = PendingTurn::default();
    while let Some(input) = rx.recv().await {
        match input {
            LoopbackInput::Audio(input) => {
                let bytes = match codec::decode_base64(&input.media.data) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("loopback dropped outbound frame: {e}");
                        continue;
                    }
                };
                turn.sample_rate =
                    codec::pcm_rate_from_mime(&input.media.mime_type).unwrap_or(16_000);
                turn.pcm.extend_from_slice(&bytes);
                turn.blocks += 1;

                if turn.blocks >= turn_blocks {
                    events.message(reply_for(&std::mem::take(&mut turn)));
                }
            }
            LoopbackInput::Close => break,
        }
    }

    debug!("loopback session closed");
    events.closed();
}

fn reply_for(turn: &PendingTurn) -> ServerMessage {
    let seconds = (turn.pcm.len() / 2) as f64 / turn.sample_rate.max(1) as f64;
    ServerMessage::from_content(ServerContent {
        input_transcription: Some(Transcription::new(format!(
            "[{seconds:.1} s of speech]"
        ))),
        output_transcription: Some(Transcription::new("Here is what I heard.")),
        turn_complete: true,
        model_turn: Some(ModelTurn::audio(Blob {
            data: codec::encode_base64(&turn.pcm),
            mime_type: pcm_mime_type(turn.sample_rate),
        })),
        interrupted: false,
    })
}
