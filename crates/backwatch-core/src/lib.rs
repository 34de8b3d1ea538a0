//! Backwatch core library
//!
//! Client-side access to a Backrest backup-orchestration server:
//! - a typed registry of the server's API endpoints with a one-shot query client
//! - streaming sessions for the shared operation-event feed and per-operation
//!   log tails, with subscriber multiplexing and bounded reconnect

pub mod api;
pub mod config;
pub mod stream;

pub use api::{ApiError, QueryClient};
pub use config::{AuthMetadata, ConfigError, ServerConfig};
pub use stream::{
    EphemeralStreamSession, HttpStreamTransport, ReconnectPolicy, SessionSink,
    SharedStreamSession, StreamError, StreamState, StreamStatus, StreamTransport,
};
