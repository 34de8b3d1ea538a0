//! Connect-protocol streaming transport
//!
//! Server-streaming calls over plain HTTP: the request is posted as JSON
//! and the response body arrives as enveloped frames - a 1-byte flag plus a
//! 4-byte big-endian length, then the payload. The end-of-stream envelope
//! (flag bit 0x02) carries an optional trailer object with an error code
//! and message. Frame payloads are forwarded as raw bytes; the sessions
//! decide how to decode them.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{code, StreamError, CANCELLED_ON_CLIENT};
use super::transport::{StreamEvent, StreamHandle, StreamTransport};
use crate::api::SERVICE_PREFIX;
use crate::config::{AuthMetadata, ServerConfig};

const FRAME_HEADER_LEN: usize = 5;
const END_STREAM_FLAG: u8 = 0x02;

/// Refuse absurd frames instead of buffering them (16 MiB)
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Streaming transport over the server's HTTP interface
pub struct HttpStreamTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStreamTransport {
    /// `base_url` is scheme + authority, e.g. `http://localhost:9898`
    pub fn new(base_url: impl Into<String>) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| StreamError::NoClient(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Build from a server config; a missing URL is a precondition failure,
    /// reported immediately rather than retried
    pub fn from_config(config: &ServerConfig) -> Result<Self, StreamError> {
        if config.url.trim().is_empty() {
            return Err(StreamError::NoConfiguration);
        }
        Self::new(config.http_base_url())
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(
        &self,
        method: &str,
        request: Value,
        metadata: &AuthMetadata,
    ) -> Result<StreamHandle, StreamError> {
        let url = format!("{}{}{}", self.base_url, SERVICE_PREFIX, method);
        debug!("Opening stream against {}", url);

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        for (name, value) in metadata.iter() {
            builder = builder.header(name, value);
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::from_code(
                code_for_http_status(status.as_u16()),
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }

        let (events, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut body = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer = BytesMut::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = events.send(StreamEvent::Error {
                            code: code::CANCELLED,
                            details: CANCELLED_ON_CLIENT.to_string(),
                        });
                        return;
                    }
                    chunk = body.next() => match chunk {
                        Some(Ok(bytes)) => {
                            buffer.extend_from_slice(&bytes);
                            match drain_frames(&mut buffer) {
                                Ok(frames) => {
                                    for frame in frames {
                                        match frame {
                                            Frame::Data(payload) => {
                                                let _ = events.send(StreamEvent::Data(payload));
                                            }
                                            Frame::EndStream(trailer) => {
                                                let _ = events.send(end_event(trailer));
                                                return;
                                            }
                                        }
                                    }
                                }
                                Err(details) => {
                                    warn!("Stream framing error: {}", details);
                                    let _ = events.send(StreamEvent::Error {
                                        code: code::UNKNOWN,
                                        details,
                                    });
                                    return;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            let classified = classify_request_error(err);
                            let (code, details) = error_parts(&classified);
                            let _ = events.send(StreamEvent::Error { code, details });
                            return;
                        }
                        None => {
                            let _ = events.send(StreamEvent::End);
                            return;
                        }
                    }
                }
            }
        });

        Ok(StreamHandle::new(rx, cancel))
    }
}

/// One de-enveloped frame
#[derive(Debug)]
enum Frame {
    Data(Bytes),
    /// Trailer payload of the end-of-stream envelope, if any
    EndStream(Option<Value>),
}

/// Extract every complete frame from `buffer`, leaving partial data in place
fn drain_frames(buffer: &mut BytesMut) -> Result<Vec<Frame>, String> {
    let mut frames = Vec::new();
    while buffer.len() >= FRAME_HEADER_LEN {
        let flags = buffer[0];
        let len = u32::from_be_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(format!("frame of {} bytes exceeds the limit", len));
        }
        if buffer.len() < FRAME_HEADER_LEN + len {
            break;
        }
        buffer.advance(FRAME_HEADER_LEN);
        let payload = buffer.split_to(len).freeze();
        if flags & END_STREAM_FLAG != 0 {
            let trailer = if payload.is_empty() {
                None
            } else {
                serde_json::from_slice(&payload).ok()
            };
            frames.push(Frame::EndStream(trailer));
            break;
        }
        frames.push(Frame::Data(payload));
    }
    Ok(frames)
}

/// Map the end-of-stream trailer onto a terminal event
fn end_event(trailer: Option<Value>) -> StreamEvent {
    let Some(trailer) = trailer else {
        return StreamEvent::End;
    };
    let Some(error) = trailer.get("error") else {
        return StreamEvent::End;
    };
    let code = error
        .get("code")
        .map(trailer_code)
        .unwrap_or(code::UNKNOWN);
    let details = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("stream closed with an error")
        .to_string();
    StreamEvent::Error { code, details }
}

/// Trailer codes arrive either numeric or as Connect-style strings
fn trailer_code(value: &Value) -> i32 {
    if let Some(numeric) = value.as_i64() {
        return numeric as i32;
    }
    match value.as_str() {
        Some("canceled") | Some("cancelled") => code::CANCELLED,
        Some("deadline_exceeded") => code::DEADLINE_EXCEEDED,
        Some("unavailable") => code::UNAVAILABLE,
        _ => code::UNKNOWN,
    }
}

fn classify_request_error(err: reqwest::Error) -> StreamError {
    if err.is_timeout() {
        StreamError::from_code(code::DEADLINE_EXCEEDED, err.to_string())
    } else if err.is_connect() {
        StreamError::from_code(code::UNAVAILABLE, err.to_string())
    } else {
        StreamError::from_code(code::UNKNOWN, err.to_string())
    }
}

fn code_for_http_status(status: u16) -> i32 {
    match status {
        408 | 504 => code::DEADLINE_EXCEEDED,
        502 | 503 => code::UNAVAILABLE,
        _ => code::UNKNOWN,
    }
}

fn error_parts(err: &StreamError) -> (i32, String) {
    match err {
        StreamError::Cancelled { details } => (code::CANCELLED, details.clone()),
        StreamError::Timeout { details } => (code::DEADLINE_EXCEEDED, details.clone()),
        StreamError::Unavailable { details } => (code::UNAVAILABLE, details.clone()),
        StreamError::Unknown { code, details } => (*code, details.clone()),
        other => (code::UNKNOWN, other.to_string()),
    }
}
