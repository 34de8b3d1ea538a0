//! Per-operation log tail
//!
//! A consumer-owned, single-subscriber stream tied to one operation
//! reference. Each `start` supersedes the previous call's handle, so the
//! owner has at most one live stream; restart is driven by the owner
//! issuing a new request, not by an internal reconnect loop (unless a
//! reconnect-eligible policy is configured explicitly).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::StreamError;
use super::reconnect::{ReconnectPolicy, RetryDecision, TerminalCause};
use super::status::{SessionSink, StreamState, StreamStatus};
use super::transport::{StreamEvent, StreamHandle, StreamTransport};
use crate::config::AuthMetadata;

/// Method name of the log feed
pub const GET_LOGS_METHOD: &str = "GetLogs";

struct EphemeralInner {
    state: StreamState,
    active: Option<CancellationToken>,
    pending_reconnect: Option<CancellationToken>,
    manual_stop: bool,
    attempts: u32,
    /// Bumped on every start/stop; events carrying a stale cycle belong to
    /// a superseded handle and are dropped
    cycle: u64,
    /// Request of the current run, kept for reconnect-eligible sessions
    request: Option<Value>,
}

struct EphemeralCore {
    transport: Arc<dyn StreamTransport>,
    method: String,
    metadata: AuthMetadata,
    policy: ReconnectPolicy,
    sink: Arc<dyn SessionSink>,
    inner: Mutex<EphemeralInner>,
}

/// Single-owner streaming session, one live handle at a time
#[derive(Clone)]
pub struct EphemeralStreamSession {
    core: Arc<EphemeralCore>,
}

impl EphemeralStreamSession {
    /// Session that never reconnects on its own; a new `start` call is the
    /// only way to resume
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        method: impl Into<String>,
        metadata: AuthMetadata,
        sink: Arc<dyn SessionSink>,
    ) -> Self {
        Self::with_policy(transport, method, metadata, ReconnectPolicy::disabled(), sink)
    }

    /// Reconnect-eligible variant; retries follow the given policy exactly
    /// like the shared feed
    pub fn with_policy(
        transport: Arc<dyn StreamTransport>,
        method: impl Into<String>,
        metadata: AuthMetadata,
        policy: ReconnectPolicy,
        sink: Arc<dyn SessionSink>,
    ) -> Self {
        Self {
            core: Arc::new(EphemeralCore {
                transport,
                method: method.into(),
                metadata,
                policy,
                sink,
                inner: Mutex::new(EphemeralInner {
                    state: StreamState::Idle,
                    active: None,
                    pending_reconnect: None,
                    manual_stop: false,
                    attempts: 0,
                    cycle: 0,
                    request: None,
                }),
            }),
        }
    }

    /// Log tail for one operation reference
    pub fn log_tail(
        transport: Arc<dyn StreamTransport>,
        metadata: AuthMetadata,
        sink: Arc<dyn SessionSink>,
    ) -> Self {
        Self::new(transport, GET_LOGS_METHOD, metadata, sink)
    }

    /// Open a fresh stream for `request`, cancelling any previous handle
    /// first so at most one stream is ever live for this owner
    pub async fn start(&self, request: Value) {
        let cycle = {
            let mut inner = self.core.inner.lock().await;
            Self::cancel_current_locked(&mut inner);
            inner.manual_stop = false;
            inner.attempts = 0;
            inner.request = Some(request.clone());
            inner.state = StreamState::Connecting;
            inner.cycle += 1;
            inner.cycle
        };
        info!("Starting {} stream", self.core.method);
        self.core.sink.on_status(&self.status_for(StreamState::Connecting, 0));
        self.connect(cycle, request).await;
    }

    /// Cancel the active stream, if any. Idempotent; after this returns no
    /// further event or terminal callback fires for the old handle.
    pub async fn stop(&self) {
        {
            let mut inner = self.core.inner.lock().await;
            Self::cancel_current_locked(&mut inner);
            inner.manual_stop = true;
            inner.attempts = 0;
            inner.request = None;
            inner.state = StreamState::Idle;
        }
        debug!("{} stream stopped", self.core.method);
        self.core.sink.on_status(&self.status_for(StreamState::Idle, 0));
    }

    pub async fn state(&self) -> StreamState {
        self.core.inner.lock().await.state
    }

    fn cancel_current_locked(inner: &mut EphemeralInner) {
        if let Some(active) = inner.active.take() {
            active.cancel();
        }
        if let Some(timer) = inner.pending_reconnect.take() {
            timer.cancel();
        }
        inner.cycle += 1;
    }

    /// Open the feed for the given cycle; a stale cycle means a newer
    /// start/stop superseded this attempt
    async fn connect(&self, cycle: u64, request: Value) {
        let opened = self
            .core
            .transport
            .open(&self.core.method, request, &self.core.metadata)
            .await;

        let handle = {
            let mut inner = self.core.inner.lock().await;
            if inner.cycle != cycle {
                if let Ok(handle) = opened {
                    handle.cancel();
                }
                return;
            }
            match opened {
                Ok(handle) => {
                    inner.active = Some(handle.cancel_token());
                    inner.state = StreamState::Streaming;
                    handle
                }
                Err(err) => {
                    drop(inner);
                    self.handle_terminal(cycle, TerminalCause::Error(err)).await;
                    return;
                }
            }
        };
        info!("{} stream established", self.core.method);
        self.core
            .sink
            .on_status(&self.status_for(StreamState::Streaming, 0));
        self.spawn_pump(cycle, handle);
    }

    fn spawn_pump(&self, cycle: u64, mut handle: StreamHandle) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                match handle.next_event().await {
                    Some(StreamEvent::Data(payload)) => {
                        session.handle_data(cycle, &payload).await;
                    }
                    Some(StreamEvent::Error { code, details }) => {
                        let err = StreamError::from_code(code, details);
                        session
                            .handle_terminal(cycle, TerminalCause::Error(err))
                            .await;
                        break;
                    }
                    Some(StreamEvent::End) | None => {
                        session.handle_terminal(cycle, TerminalCause::End).await;
                        break;
                    }
                }
            }
        });
    }

    async fn handle_data(&self, cycle: u64, payload: &[u8]) {
        let reset = {
            let mut inner = self.core.inner.lock().await;
            if inner.cycle != cycle {
                debug!("Dropping data event from a superseded {} handle", self.core.method);
                return;
            }
            if inner.attempts > 0 {
                inner.attempts = 0;
                true
            } else {
                false
            }
        };
        if reset {
            self.core
                .sink
                .on_status(&self.status_for(StreamState::Streaming, 0));
        }

        let decoded = decode_log_payload(payload);
        if let Err(err) = self.core.sink.on_event(&decoded) {
            tracing::warn!("{} consumer failed to handle event: {:#}", self.core.method, err);
        }
    }

    async fn handle_terminal(&self, cycle: u64, cause: TerminalCause) {
        let mut inner = self.core.inner.lock().await;
        if inner.cycle != cycle {
            debug!("Ignoring terminal event from a superseded {} handle", self.core.method);
            return;
        }
        inner.active = None;

        match &cause {
            TerminalCause::Error(err) => match err {
                StreamError::Cancelled { .. } => {
                    debug!("{} stream cancelled: {}", self.core.method, err)
                }
                other => error!("{} stream error: {}", self.core.method, other),
            },
            TerminalCause::End => info!("{} stream ended", self.core.method),
        }

        // The owner always counts as one listener
        let decision = self
            .core
            .policy
            .decide(&cause, inner.manual_stop, 1, inner.attempts);
        match decision {
            RetryDecision::Retry { delay } => {
                inner.attempts += 1;
                inner.state = StreamState::Reconnecting;
                let timer = CancellationToken::new();
                inner.pending_reconnect = Some(timer.clone());
                let attempts = inner.attempts;
                info!(
                    "Reconnecting {} stream (attempt #{}) in {:?}",
                    self.core.method, attempts, delay
                );
                drop(inner);
                self.core
                    .sink
                    .on_status(&self.status_for(StreamState::Reconnecting, attempts));
                self.spawn_reconnect_timer(cycle, delay, timer);
            }
            RetryDecision::Exhausted => {
                inner.state = StreamState::Terminated;
                let attempts = inner.attempts;
                error!(
                    "Max reconnect attempts ({}) reached; giving up on {}",
                    self.core.policy.max_attempts, self.core.method
                );
                drop(inner);
                self.core
                    .sink
                    .on_status(&self.status_for(StreamState::Terminated, attempts));
            }
            RetryDecision::No => {
                let client_cancel =
                    matches!(&cause, TerminalCause::Error(err) if err.is_client_cancel());
                let state = if client_cancel {
                    StreamState::Idle
                } else {
                    StreamState::Terminated
                };
                inner.state = state;
                let attempts = inner.attempts;
                drop(inner);
                self.core.sink.on_status(&self.status_for(state, attempts));
            }
        }
    }

    fn spawn_reconnect_timer(&self, cycle: u64, delay: Duration, timer: CancellationToken) {
        let session = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            session.reconnect_fire(cycle).await;
        });
    }

    async fn reconnect_fire(&self, cycle: u64) {
        let (next_cycle, request) = {
            let mut inner = self.core.inner.lock().await;
            if inner.cycle != cycle {
                return;
            }
            inner.pending_reconnect = None;
            let request = match &inner.request {
                Some(request) => request.clone(),
                None => return,
            };
            inner.cycle += 1;
            inner.state = StreamState::Connecting;
            (inner.cycle, request)
        };
        self.connect(next_cycle, request).await;
    }

    fn status_for(&self, state: StreamState, attempts: u32) -> StreamStatus {
        StreamStatus {
            connected: state == StreamState::Streaming,
            attempt: attempts,
            max_attempts: self.core.policy.max_attempts,
            terminal: state == StreamState::Terminated,
        }
    }
}

/// Interpret payload bytes as UTF-8 text; structured records pass through
/// decoded, anything else is delivered as the raw text. Upstream log
/// streams mix both, so the fallback is routine, not exceptional.
pub fn decode_log_payload(payload: &[u8]) -> Value {
    let text = String::from_utf8_lossy(payload);
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => value,
        Err(_) => Value::String(text.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::error::code;
    use crate::stream::mock::{
        mock_transport, recording_sink, recv_event, recv_status, SinkCall,
    };
    use serde_json::json;

    #[test]
    fn test_decode_fallback() {
        assert_eq!(
            decode_log_payload(b"not-json"),
            Value::String("not-json".to_string())
        );
        assert_eq!(decode_log_payload(br#"{"a":1}"#), json!({"a": 1}));
        // Bare JSON scalars decode too
        assert_eq!(decode_log_payload(b"42"), json!(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_lines_flow_to_the_sink() {
        let (transport, mut controller) = mock_transport();
        let (sink, mut rx) = recording_sink();
        let session =
            EphemeralStreamSession::log_tail(transport, AuthMetadata::new(), sink);

        session.start(json!({"ref": "op-123"})).await;
        let opened = controller.next_open().await;
        assert_eq!(opened.method, GET_LOGS_METHOD);
        assert_eq!(opened.request, json!({"ref": "op-123"}));

        opened.send_bytes(b"restic starting backup");
        opened.send_bytes(br#"{"message_type":"summary","files_new":3}"#);

        assert_eq!(
            recv_event(&mut rx).await,
            Value::String("restic starting backup".to_string())
        );
        assert_eq!(
            recv_event(&mut rx).await,
            json!({"message_type": "summary", "files_new": 3})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_supersedes_previous_handle() {
        let (transport, mut controller) = mock_transport();
        let (sink, mut rx) = recording_sink();
        let session =
            EphemeralStreamSession::log_tail(transport.clone(), AuthMetadata::new(), sink);

        session.start(json!({"ref": "op-1"})).await;
        let first = controller.next_open().await;

        session.start(json!({"ref": "op-2"})).await;
        let second = controller.next_open().await;
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(transport.open_count(), 2);

        // Data from the superseded handle is dropped, the new one flows
        first.send_bytes(b"stale line");
        second.send_bytes(b"fresh line");
        assert_eq!(
            recv_event(&mut rx).await,
            Value::String("fresh line".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_silences_the_handle() {
        let (transport, mut controller) = mock_transport();
        let (sink, mut rx) = recording_sink();
        let session =
            EphemeralStreamSession::log_tail(transport, AuthMetadata::new(), sink);

        session.start(json!({"ref": "op-1"})).await;
        let opened = controller.next_open().await;

        session.stop().await;
        assert!(opened.is_cancelled());
        assert_eq!(session.state().await, StreamState::Idle);
        session.stop().await;
        assert_eq!(session.state().await, StreamState::Idle);

        // A terminal event still in flight after stop must be discarded
        opened.send_error(code::UNAVAILABLE, "connection reset");
        opened.send_bytes(b"late line");
        tokio::time::sleep(Duration::from_millis(10)).await;
        while let Ok(call) = rx.try_recv() {
            match call {
                SinkCall::Status(status) => assert!(!status.terminal),
                SinkCall::Event(_) => panic!("no event may arrive after stop"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_by_default() {
        let (transport, mut controller) = mock_transport();
        let (sink, mut rx) = recording_sink();
        let session =
            EphemeralStreamSession::log_tail(transport.clone(), AuthMetadata::new(), sink);

        session.start(json!({"ref": "op-1"})).await;
        let opened = controller.next_open().await;
        opened.send_error(code::UNAVAILABLE, "connection refused");

        controller.expect_no_open(Duration::from_secs(30)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(session.state().await, StreamState::Terminated);
        // The failure surfaces as a terminal status, never as an event
        loop {
            match recv_status(&mut rx).await {
                status if status.terminal => break,
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_variant_retries_with_same_request() {
        let (transport, mut controller) = mock_transport();
        let (sink, _rx) = recording_sink();
        let policy = ReconnectPolicy::new(true, Duration::from_millis(50), 1);
        let session = EphemeralStreamSession::with_policy(
            transport.clone(),
            GET_LOGS_METHOD,
            AuthMetadata::new(),
            policy,
            sink,
        );

        session.start(json!({"ref": "op-9"})).await;
        let first = controller.next_open().await;
        first.send_error(code::UNAVAILABLE, "connection refused");

        // One retry with the original request, then the budget is spent
        let second = controller.next_open().await;
        assert_eq!(second.request, json!({"ref": "op-9"}));
        second.send_error(code::UNAVAILABLE, "connection refused");

        controller.expect_no_open(Duration::from_secs(30)).await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(session.state().await, StreamState::Terminated);
    }
}
