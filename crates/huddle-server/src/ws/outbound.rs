use huddle_protocol::{ErrorEnvelope, PeerId, ServerMessage};
use serde::Serialize;
use tokio::sync::mpsc;

/// Write half of one signaling connection.
///
/// Frames are queued to the connection's single writer task, so the read loop,
/// the ICE emission task and the session manager never interleave partial
/// writes, and a slow socket never blocks the task that produced the frame.
#[derive(Debug, Clone)]
pub struct Outbound {
    connection_id: PeerId,
    sender: mpsc::UnboundedSender<String>,
}

impl Outbound {
    pub fn new(connection_id: PeerId, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    /// Create an outbound handle together with the receiving end of its queue
    pub fn channel(connection_id: PeerId) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(connection_id, tx), rx)
    }

    pub fn connection_id(&self) -> PeerId {
        self.connection_id
    }

    /// Queue a message. Returns false once the connection is gone.
    pub fn send(&self, message: &ServerMessage) -> bool {
        self.send_json(message)
    }

    pub fn send_error(&self, error: &ErrorEnvelope) -> bool {
        self.send_json(error)
    }

    fn send_json<T: Serialize>(&self, frame: &T) -> bool {
        let json = match serde_json::to_string(frame) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return false;
            }
        };

        if self.sender.send(json).is_err() {
            tracing::debug!("Connection {} already closed, dropping frame", self.connection_id);
            return false;
        }
        true
    }
}
