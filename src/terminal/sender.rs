//! Output Sender
//!
//! The single writer for a session's outbound transport. Heartbeats,
//! command output and dispatch replies all funnel through
//! [`OutputSender::send`], which holds an exclusive lock for the whole
//! encode-and-write so frames are never interleaved and arrive in call order.

use super::error::TransportError;
use super::protocol::OutboundMessage;
use crate::metrics;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Write half of a session transport
#[async_trait]
pub trait FrameSink: Send {
    /// Write one complete text frame
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
}

/// Anything that accepts outbound messages.
///
/// Implemented by [`OutputSender`]; the process runner only sees this
/// trait so it can be driven without a transport in tests.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: OutboundMessage);
}

/// Serialized writer over one session's transport
pub struct OutputSender {
    sink: Mutex<Box<dyn FrameSink>>,

    /// Cancelled on the first write failure; the connection is assumed dead
    session: CancellationToken,
}

impl OutputSender {
    pub fn new(sink: Box<dyn FrameSink>, session: CancellationToken) -> Self {
        Self {
            sink: Mutex::new(sink),
            session,
        }
    }

    /// Encode and write one message.
    ///
    /// A write failure cancels the owning session and is otherwise
    /// swallowed: there is nobody left to report it to.
    pub async fn send(&self, message: OutboundMessage) {
        if self.session.is_cancelled() {
            debug!("Session cancelled, dropping {} message", message.kind);
            return;
        }

        let kind = message.kind;
        let result = match serde_json::to_string(&message) {
            Ok(text) => {
                let mut sink = self.sink.lock().await;
                sink.send_text(text).await
            }
            Err(e) => Err(TransportError::from(e)),
        };

        match result {
            Ok(()) => {
                metrics::MESSAGES_SENT_TOTAL
                    .with_label_values(&[kind.as_str()])
                    .inc();
            }
            Err(e) => {
                warn!("Failed to write terminal message: {}", e);
                metrics::SEND_FAILURES_TOTAL.inc();
                self.session.cancel();
            }
        }
    }
}

#[async_trait]
impl MessageSink for OutputSender {
    async fn deliver(&self, message: OutboundMessage) {
        self.send(message).await;
    }
}
