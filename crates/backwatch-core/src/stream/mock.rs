//! Scripted transport and recording sink for session tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::StreamError;
use super::status::{SessionSink, StreamStatus};
use super::transport::{StreamEvent, StreamHandle, StreamTransport};
use crate::config::AuthMetadata;

/// Transport whose opened streams are handed to the test for scripting
pub struct MockTransport {
    opened_tx: mpsc::UnboundedSender<OpenedStream>,
    fail_next: Mutex<Vec<StreamError>>,
    opens: AtomicUsize,
}

/// Test-side view of the transport: receives every opened stream
pub struct MockController {
    opened_rx: mpsc::UnboundedReceiver<OpenedStream>,
}

pub fn mock_transport() -> (Arc<MockTransport>, MockController) {
    let (opened_tx, opened_rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockTransport {
            opened_tx,
            fail_next: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
        }),
        MockController { opened_rx },
    )
}

impl MockTransport {
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Queue an error for the next `open` call instead of a stream
    pub fn fail_next_open(&self, err: StreamError) {
        self.fail_next.lock().unwrap().push(err);
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn open(
        &self,
        method: &str,
        request: Value,
        _metadata: &AuthMetadata,
    ) -> Result<StreamHandle, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_next.lock().unwrap().pop() {
            return Err(err);
        }
        let (events, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let _ = self.opened_tx.send(OpenedStream {
            method: method.to_string(),
            request,
            events,
            cancel: cancel.clone(),
        });
        Ok(StreamHandle::new(rx, cancel))
    }
}

/// One stream opened through the mock; the test pushes its events
pub struct OpenedStream {
    pub method: String,
    pub request: Value,
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
}

impl OpenedStream {
    pub fn send_json(&self, value: &Value) {
        let bytes = serde_json::to_vec(value).unwrap();
        let _ = self.events.send(StreamEvent::Data(Bytes::from(bytes)));
    }

    pub fn send_bytes(&self, bytes: &[u8]) {
        let _ = self
            .events
            .send(StreamEvent::Data(Bytes::copy_from_slice(bytes)));
    }

    pub fn send_error(&self, code: i32, details: &str) {
        let _ = self.events.send(StreamEvent::Error {
            code,
            details: details.to_string(),
        });
    }

    pub fn send_end(&self) {
        let _ = self.events.send(StreamEvent::End);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl MockController {
    /// Wait for the next `open` call; panics if the transport is gone
    pub async fn next_open(&mut self) -> OpenedStream {
        tokio::time::timeout(Duration::from_secs(60), self.opened_rx.recv())
            .await
            .expect("timed out waiting for an open call")
            .expect("mock transport dropped")
    }

    /// Assert that no further `open` call happens within `window`
    pub async fn expect_no_open(&mut self, window: Duration) {
        if tokio::time::timeout(window, self.opened_rx.recv())
            .await
            .is_ok()
        {
            panic!("unexpected open call");
        }
    }
}

/// What a recording sink observed, in delivery order
#[derive(Debug, Clone)]
pub enum SinkCall {
    Event(Value),
    Status(StreamStatus),
}

/// Sink that forwards every delivery to a channel the test can await
pub struct RecordingSink {
    calls: mpsc::UnboundedSender<SinkCall>,
    fail_events: AtomicBool,
}

pub fn recording_sink() -> (Arc<RecordingSink>, mpsc::UnboundedReceiver<SinkCall>) {
    let (calls, rx) = mpsc::unbounded_channel();
    (
        Arc::new(RecordingSink {
            calls,
            fail_events: AtomicBool::new(false),
        }),
        rx,
    )
}

impl RecordingSink {
    /// Make every subsequent `on_event` return an error (still recorded)
    pub fn fail_events(&self) {
        self.fail_events.store(true, Ordering::SeqCst);
    }
}

impl SessionSink for RecordingSink {
    fn on_event(&self, payload: &Value) -> anyhow::Result<()> {
        let _ = self.calls.send(SinkCall::Event(payload.clone()));
        if self.fail_events.load(Ordering::SeqCst) {
            anyhow::bail!("sink rejected event");
        }
        Ok(())
    }

    fn on_status(&self, status: &StreamStatus) {
        let _ = self.calls.send(SinkCall::Status(status.clone()));
    }
}

/// Await the next sink call, with a generous timeout
pub async fn recv_call(rx: &mut mpsc::UnboundedReceiver<SinkCall>) -> SinkCall {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for a sink call")
        .expect("sink channel closed")
}

/// Await the next delivered event, skipping status updates
pub async fn recv_event(rx: &mut mpsc::UnboundedReceiver<SinkCall>) -> Value {
    loop {
        if let SinkCall::Event(value) = recv_call(rx).await {
            return value;
        }
    }
}

/// Await the next status update, skipping events
pub async fn recv_status(rx: &mut mpsc::UnboundedReceiver<SinkCall>) -> StreamStatus {
    loop {
        if let SinkCall::Status(status) = recv_call(rx).await {
            return status;
        }
    }
}
