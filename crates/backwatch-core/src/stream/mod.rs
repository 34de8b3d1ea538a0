//! Streaming sessions for server-streaming Backrest calls
//!
//! Two session shapes cover the server's feeds:
//! - [`SharedStreamSession`]: the operation-event push feed, one upstream
//!   call multiplexed across any number of subscribers, with bounded
//!   automatic reconnect
//! - [`EphemeralStreamSession`]: a per-operation log tail owned by a single
//!   consumer, restarted by each new request
//!
//! Transports are pluggable behind [`StreamTransport`];
//! [`HttpStreamTransport`] speaks the server's HTTP streaming protocol.

mod connect;
mod ephemeral;
mod error;
#[cfg(test)]
mod mock;
mod reconnect;
mod shared;
mod status;
mod transport;

pub use connect::HttpStreamTransport;
pub use ephemeral::{decode_log_payload, EphemeralStreamSession, GET_LOGS_METHOD};
pub use error::{code, StreamError, CANCELLED_ON_CLIENT};
pub use reconnect::{
    ReconnectPolicy, RetryDecision, TerminalCause, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    EPHEMERAL_RECONNECT_INTERVAL_MS, SHARED_RECONNECT_INTERVAL_MS,
};
pub use shared::{SharedStreamSession, OPERATION_EVENTS_METHOD};
pub use status::{SessionSink, StreamState, StreamStatus};
pub use transport::{StreamEvent, StreamHandle, StreamTransport};
