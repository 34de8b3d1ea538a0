//! Shared operation-event feed
//!
//! One upstream server-streaming call shared by any number of subscribers.
//! The first subscriber opens the feed, the last one tears it down, and a
//! bounded reconnect loop bridges transient failures in between. All session
//! state lives behind one mutex; terminal events from superseded stream
//! handles are recognized by a cycle counter and discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::StreamError;
use super::reconnect::{ReconnectPolicy, RetryDecision, TerminalCause};
use super::status::{SessionSink, StreamState, StreamStatus};
use super::transport::{StreamEvent, StreamHandle, StreamTransport};
use crate::config::AuthMetadata;

/// Method name of the shared feed
pub const OPERATION_EVENTS_METHOD: &str = "GetOperationEvents";

type SinkList = Vec<(String, Arc<dyn SessionSink>)>;

struct SharedInner {
    state: StreamState,
    subscribers: HashMap<String, Arc<dyn SessionSink>>,
    /// Cancel token of the live handle, if any
    active: Option<CancellationToken>,
    /// Cancel token of a scheduled reconnect, if any
    pending_reconnect: Option<CancellationToken>,
    /// Reconnect attempts since the last received data event
    attempts: u32,
    manual_stop: bool,
    /// Bumped on every connect attempt and every teardown; events carrying
    /// a stale cycle belong to a superseded handle and are dropped
    cycle: u64,
}

struct SessionCore {
    transport: Arc<dyn StreamTransport>,
    method: String,
    request: Value,
    metadata: AuthMetadata,
    policy: ReconnectPolicy,
    inner: Mutex<SharedInner>,
}

/// Server-streaming feed multiplexed across independent subscribers
#[derive(Clone)]
pub struct SharedStreamSession {
    core: Arc<SessionCore>,
}

impl SharedStreamSession {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        method: impl Into<String>,
        request: Value,
        metadata: AuthMetadata,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            core: Arc::new(SessionCore {
                transport,
                method: method.into(),
                request,
                metadata,
                policy,
                inner: Mutex::new(SharedInner {
                    state: StreamState::Idle,
                    subscribers: HashMap::new(),
                    active: None,
                    pending_reconnect: None,
                    attempts: 0,
                    manual_stop: false,
                    cycle: 0,
                }),
            }),
        }
    }

    /// Session over the server's operation-event push feed
    pub fn operation_events(
        transport: Arc<dyn StreamTransport>,
        metadata: AuthMetadata,
        policy: ReconnectPolicy,
    ) -> Self {
        Self::new(
            transport,
            OPERATION_EVENTS_METHOD,
            Value::Object(Default::default()),
            metadata,
            policy,
        )
    }

    /// Register a subscriber. Idempotent: re-subscribing an existing id
    /// replaces its sink instead of duplicating it. The first subscriber
    /// (or any subscriber after the session went terminal) opens the feed;
    /// later ones attach to the stream that is already running.
    pub async fn subscribe(&self, id: impl Into<String>, sink: Arc<dyn SessionSink>) {
        let id = id.into();
        let attach_broadcast = {
            let mut inner = self.core.inner.lock().await;
            if inner.subscribers.insert(id.clone(), sink).is_none() {
                info!("Subscriber {} joined the {} feed", id, self.core.method);
            } else {
                debug!("Subscriber {} replaced its callback", id);
            }
            inner.manual_stop = false;

            let needs_connect = inner.active.is_none()
                && inner.pending_reconnect.is_none()
                && matches!(inner.state, StreamState::Idle | StreamState::Terminated);
            if needs_connect && inner.state == StreamState::Terminated {
                // Explicit resume after a terminal stop starts a fresh cycle
                inner.attempts = 0;
            }
            if needs_connect {
                None
            } else {
                Some(self.status_snapshot(&inner))
            }
        };
        match attach_broadcast {
            // First subscriber (or resume): open the feed; the connect path
            // broadcasts its own status
            None => self.connect().await,
            Some((status, sinks)) => deliver_status(&status, &sinks),
        }
    }

    /// Remove a subscriber. Unknown ids are a no-op. When the registry
    /// becomes empty the feed is cancelled, any scheduled reconnect is
    /// dropped, and the session returns to idle.
    pub async fn unsubscribe(&self, id: &str) {
        let mut inner = self.core.inner.lock().await;
        if inner.subscribers.remove(id).is_none() {
            debug!("Unsubscribe for unknown id {} ignored", id);
            return;
        }
        info!("Subscriber {} left the {} feed", id, self.core.method);
        if inner.subscribers.is_empty() {
            debug!("Last subscriber gone; stopping the {} feed", self.core.method);
            Self::teardown_locked(&mut inner);
        }
    }

    /// Cancel the feed without dropping subscribers; a later subscribe
    /// starts it again
    pub async fn stop(&self) {
        let (status, sinks) = {
            let mut inner = self.core.inner.lock().await;
            Self::teardown_locked(&mut inner);
            self.status_snapshot(&inner)
        };
        deliver_status(&status, &sinks);
    }

    pub async fn state(&self) -> StreamState {
        self.core.inner.lock().await.state
    }

    pub async fn subscriber_count(&self) -> usize {
        self.core.inner.lock().await.subscribers.len()
    }

    /// Cancel the active handle and any pending timer, and bump the cycle
    /// so in-flight events from them are discarded
    fn teardown_locked(inner: &mut SharedInner) {
        inner.manual_stop = true;
        if let Some(active) = inner.active.take() {
            active.cancel();
        }
        if let Some(timer) = inner.pending_reconnect.take() {
            timer.cancel();
        }
        inner.cycle += 1;
        inner.attempts = 0;
        inner.state = StreamState::Idle;
    }

    /// Open the upstream feed, guarded against concurrent attempts
    async fn connect(&self) {
        let cycle = {
            let mut inner = self.core.inner.lock().await;
            if inner.manual_stop || inner.subscribers.is_empty() {
                return;
            }
            // Single-flight: an open call or live handle already exists
            if inner.active.is_some() || inner.state == StreamState::Connecting {
                return;
            }
            inner.cycle += 1;
            inner.state = StreamState::Connecting;
            let (status, sinks) = self.status_snapshot(&inner);
            let cycle = inner.cycle;
            drop(inner);
            deliver_status(&status, &sinks);
            cycle
        };

        debug!("Opening {} stream (cycle {})", self.core.method, cycle);
        let opened = self
            .core
            .transport
            .open(
                &self.core.method,
                self.core.request.clone(),
                &self.core.metadata,
            )
            .await;

        match opened {
            Ok(handle) => {
                let broadcast = {
                    let mut inner = self.core.inner.lock().await;
                    if inner.cycle != cycle {
                        // A teardown raced the open; drop the fresh handle
                        handle.cancel();
                        return;
                    }
                    inner.active = Some(handle.cancel_token());
                    inner.state = StreamState::Streaming;
                    info!("{} stream established", self.core.method);
                    self.status_snapshot(&inner)
                };
                deliver_status(&broadcast.0, &broadcast.1);
                self.spawn_pump(cycle, handle);
            }
            Err(err) => {
                self.handle_terminal(cycle, TerminalCause::Error(err)).await;
            }
        }
    }

    /// Drive one stream handle; exits on the first terminal event so a
    /// racing error/end pair acts exactly once
    fn spawn_pump(&self, cycle: u64, mut handle: StreamHandle) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                match handle.next_event().await {
                    Some(StreamEvent::Data(payload)) => {
                        session.handle_data(cycle, payload).await;
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

    /// Deliver one upstream event to every current subscriber
    async fn handle_data(&self, cycle: u64, payload: Bytes) {
        let (reset_status, sinks) = {
            let mut inner = self.core.inner.lock().await;
            if inner.cycle != cycle {
                debug!("Dropping data event from a superseded stream handle");
                return;
            }
            // Receiving data proves the connection works again
            let reset_status = if inner.attempts > 0 {
                inner.attempts = 0;
                Some(self.status_of(&inner))
            } else {
                None
            };
            (reset_status, sink_list(&inner))
        };

        if let Some(status) = reset_status {
            deliver_status(&status, &sinks);
        }

        let event: Value = match serde_json::from_slice(&payload) {
            Ok(value) => value,
            Err(err) => {
                warn!("Discarding undecodable {} event: {}", self.core.method, err);
                return;
            }
        };
        debug!("Broadcasting {} event to {} subscribers", self.core.method, sinks.len());
        for (id, sink) in &sinks {
            // Failures stay with the failing subscriber
            if let Err(err) = sink.on_event(&event) {
                warn!("Subscriber {} failed to handle event: {:#}", id, err);
            }
        }
    }

    /// First (and only) terminal action for the handle of `cycle`
    async fn handle_terminal(&self, cycle: u64, cause: TerminalCause) {
        let mut inner = self.core.inner.lock().await;
        if inner.cycle != cycle {
            debug!("Ignoring terminal event from a superseded stream handle");
            return;
        }
        inner.active = None;

        match &cause {
            TerminalCause::Error(err) => self.log_terminal_error(err),
            TerminalCause::End => info!("{} stream ended", self.core.method),
        }

        let decision = self.core.policy.decide(
            &cause,
            inner.manual_stop,
            inner.subscribers.len(),
            inner.attempts,
        );
        match decision {
            RetryDecision::Retry { delay } => {
                inner.attempts += 1;
                inner.state = StreamState::Reconnecting;
                let timer = CancellationToken::new();
                inner.pending_reconnect = Some(timer.clone());
                info!(
                    "Reconnecting {} stream (attempt #{}) in {:?}",
                    self.core.method, inner.attempts, delay
                );
                let (status, sinks) = self.status_snapshot(&inner);
                drop(inner);
                deliver_status(&status, &sinks);
                self.spawn_reconnect_timer(cycle, delay, timer);
            }
            RetryDecision::Exhausted => {
                inner.state = StreamState::Terminated;
                error!(
                    "Max reconnect attempts ({}) reached; giving up on {}",
                    self.core.policy.max_attempts, self.core.method
                );
                let (status, sinks) = self.status_snapshot(&inner);
                drop(inner);
                deliver_status(&status, &sinks);
            }
            RetryDecision::No => {
                let client_cancel = matches!(&cause, TerminalCause::Error(err) if err.is_client_cancel());
                // A deliberate cancel leaves a clean stopped session; any
                // other non-retried terminal needs explicit caller action
                inner.state = if client_cancel {
                    StreamState::Idle
                } else {
                    StreamState::Terminated
                };
                let (status, sinks) = self.status_snapshot(&inner);
                drop(inner);
                deliver_status(&status, &sinks);
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

    /// Timer callback; re-validates under the lock before reconnecting
    async fn reconnect_fire(&self, cycle: u64) {
        {
            let mut inner = self.core.inner.lock().await;
            if inner.cycle != cycle {
                return;
            }
            inner.pending_reconnect = None;
        }
        self.connect().await;
    }

    fn log_terminal_error(&self, err: &StreamError) {
        match err {
            StreamError::Cancelled { .. } => {
                debug!("{} stream cancelled: {}", self.core.method, err);
            }
            StreamError::Timeout { .. } => {
                error!("{} stream timeout - server not responding", self.core.method);
            }
            StreamError::Unavailable { .. } => {
                error!("{} stream: server unavailable", self.core.method);
            }
            other => error!("{} stream error: {}", self.core.method, other),
        }
    }

    fn status_of(&self, inner: &SharedInner) -> StreamStatus {
        StreamStatus {
            connected: inner.state == StreamState::Streaming,
            attempt: inner.attempts,
            max_attempts: self.core.policy.max_attempts,
            terminal: inner.state == StreamState::Terminated,
        }
    }

    fn status_snapshot(&self, inner: &SharedInner) -> (StreamStatus, SinkList) {
        (self.status_of(inner), sink_list(inner))
    }
}

fn sink_list(inner: &SharedInner) -> SinkList {
    inner
        .subscribers
        .iter()
        .map(|(id, sink)| (id.clone(), Arc::clone(sink)))
        .collect()
}

/// Status fan-out happens outside the session lock
fn deliver_status(status: &StreamStatus, sinks: &SinkList) {
    for (_, sink) in sinks {
        sink.on_status(status);
    }
}
