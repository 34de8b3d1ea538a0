//! Session state and subscriber-facing status

use serde::Serialize;
use serde_json::Value;

/// Connection lifecycle state of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    /// No feed open and nothing pending; not an error
    Idle,
    /// Opening the upstream feed
    Connecting,
    /// Feed open, events flowing
    Streaming,
    /// Feed lost, a reconnect attempt is scheduled
    Reconnecting,
    /// No further automatic progress without an explicit new subscribe/start
    Terminated,
}

/// Connectivity status delivered to every subscriber on state changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub connected: bool,
    /// Reconnect attempts since the last received data event
    pub attempt: u32,
    /// Configured attempt budget, 0 = unlimited
    pub max_attempts: u32,
    pub terminal: bool,
}

/// Delivery callbacks for one subscriber
///
/// Sessions call these outside their internal lock; a sink that blocks only
/// delays its own session. Errors from `on_event` are isolated to the failing
/// subscriber and logged, never propagated to the others.
pub trait SessionSink: Send + Sync {
    /// One decoded upstream event
    fn on_event(&self, payload: &Value) -> anyhow::Result<()>;

    /// Connectivity status change
    fn on_status(&self, status: &StreamStatus);
}
