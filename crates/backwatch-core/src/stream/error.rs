//! Stream error classification
//!
//! Upstream failures carry a gRPC-compatible numeric code plus a details
//! string. Everything is classified here before the reconnect policy sees it;
//! transport errors never propagate to subscribers directly.

use thiserror::Error;

/// gRPC-compatible status codes the sessions care about
pub mod code {
    pub const CANCELLED: i32 = 1;
    pub const UNKNOWN: i32 = 2;
    pub const DEADLINE_EXCEEDED: i32 = 4;
    pub const UNAVAILABLE: i32 = 14;
}

/// Details string the transport attaches to a locally-requested cancel
pub const CANCELLED_ON_CLIENT: &str = "Cancelled on client";

/// Classified stream failure
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// The local side requested cancellation; not a failure
    #[error("stream cancelled by client: {details}")]
    Cancelled { details: String },

    /// Upstream did not respond within the deadline
    #[error("stream timeout - server not responding")]
    Timeout { details: String },

    /// Upstream transport or service unreachable
    #[error("server unavailable - check connection")]
    Unavailable { details: String },

    /// Any other failure code
    #[error("stream error (code {code}): {details}")]
    Unknown { code: i32, details: String },

    /// Missing server configuration; fatal, never retried
    #[error("no server configuration")]
    NoConfiguration,

    /// Client setup failed; fatal, never retried
    #[error("no upstream client available: {0}")]
    NoClient(String),

    /// Policy outcome, not a transport error: attempt budget spent
    #[error("max reconnect attempts ({0}) reached")]
    RetriesExhausted(u32),
}

impl StreamError {
    /// Classify a transport-level failure by its numeric code
    pub fn from_code(status: i32, details: impl Into<String>) -> Self {
        let details = details.into();
        match status {
            code::CANCELLED => Self::Cancelled { details },
            code::DEADLINE_EXCEEDED => Self::Timeout { details },
            code::UNAVAILABLE => Self::Unavailable { details },
            other => Self::Unknown {
                code: other,
                details,
            },
        }
    }

    /// True for the error produced by our own `cancel()` call, which is a
    /// deliberate stop signal rather than a failure
    pub fn is_client_cancel(&self) -> bool {
        matches!(self, Self::Cancelled { details } if details == CANCELLED_ON_CLIENT)
    }
}
