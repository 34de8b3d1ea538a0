//! Stream transport seam
//!
//! A transport opens one server-streaming call and feeds its events into a
//! channel. The returned handle is exclusively owned by the session that
//! opened it; nothing else may drive it.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::StreamError;
use crate::config::AuthMetadata;

/// Raw events delivered by an open stream
#[derive(Debug)]
pub enum StreamEvent {
    /// Payload bytes of one upstream message
    Data(Bytes),
    /// Terminal failure with a gRPC-compatible code
    Error { code: i32, details: String },
    /// Clean end of stream
    End,
}

/// Handle to one live server-streaming call
pub struct StreamHandle {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn new(events: mpsc::UnboundedReceiver<StreamEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Next event from the transport; `None` once the reader task has exited
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Token the transport's reader observes; cancelling it stops the call
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation of the underlying call
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Opens server-streaming calls against the upstream server
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open `method` with the given request payload, attaching `metadata`
    /// to the call
    async fn open(
        &self,
        method: &str,
        request: Value,
        metadata: &AuthMetadata,
    ) -> Result<StreamHandle, StreamError>;
}
