//! Muxrpc: method calls and streams multiplexed over one boxstream.
//!
//! An [`Endpoint`] is one side of a session. Inbound requests are dispatched
//! through a [`HandlerMux`] by dotted method name; outbound calls are made
//! with [`Endpoint::call_async`], [`Endpoint::source`] and
//! [`Endpoint::duplex`]. Every stream gets a cancellation token derived from
//! the session token.

mod endpoint;
mod mux;
mod stream;

pub use endpoint::{start_session, Endpoint};
pub use mux::{AsyncHandler, Authorizer, DuplexHandler, HandlerMux, SinkHandler, SourceHandler};
pub use stream::{Body, ByteSink, ByteSource};

use crate::boxstream::BoxStreamError;
use crate::frame::FrameError;
use crate::FeedRef;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A method name such as `tunnel.connect`, kept as its path segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Method(Vec<String>);

impl Method {
    /// Build from path segments.
    #[must_use]
    pub fn new(parts: &[&str]) -> Self {
        Self(parts.iter().map(|p| (*p).to_string()).collect())
    }

    /// Path segments.
    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for Method {
    fn from(dotted: &str) -> Self {
        Self(dotted.split('.').map(str::to_string).collect())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// The four call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// One request, one reply. Legacy peers call this `sync`.
    #[serde(alias = "sync")]
    Async,
    /// The callee streams values back.
    Source,
    /// The caller streams values to the callee.
    Sink,
    /// Both sides stream.
    Duplex,
}

impl CallType {
    /// Whether packets of this call carry the stream flag.
    #[must_use]
    pub const fn is_stream(self) -> bool {
        !matches!(self, Self::Async)
    }

    /// Name used in manifests and request bodies.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Source => "source",
            Self::Sink => "sink",
            Self::Duplex => "duplex",
        }
    }
}

/// Error object carried in terminating packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error class, `Error` for everything we send.
    pub name: String,
    /// Human readable message.
    pub message: String,
    /// Optional stack trace. Never filled in by this crate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Stream-level failures returned by handlers or received from the peer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// No handler registered for the method.
    #[error("method not found")]
    MethodNotFound,
    /// A handler exists but for another call shape.
    #[error("wrong call type")]
    WrongCallType,
    /// The caller is not allowed to use the method.
    #[error("{0}")]
    Unauthorized(String),
    /// Arguments did not validate.
    #[error("{0}")]
    Invalid(String),
    /// A resource the call depends on is not reachable right now.
    #[error("{0}")]
    Unavailable(String),
    /// Any other handler failure.
    #[error("{0}")]
    Failed(String),
    /// The peer answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
}

impl CallError {
    /// Encode for the wire.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            Self::Remote(msg) => msg.clone(),
            other => other.to_string(),
        };
        ErrorBody {
            name: "Error".to_string(),
            message,
            stack: None,
        }
    }

    /// Serialize the wire error object.
    #[must_use]
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(&self.to_body()).unwrap_or_else(|_| b"{}".to_vec())
    }

    /// Decode an error received from the peer.
    #[must_use]
    pub fn from_wire(data: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorBody>(data) {
            Ok(body) => Self::Remote(body.message),
            Err(_) => Self::Remote(String::from_utf8_lossy(data).into_owned()),
        }
    }
}

/// Failures observed on a [`ByteSource`] or [`ByteSink`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// This side already ended the stream.
    #[error("stream closed")]
    Closed,
    /// The stream context was cancelled.
    #[error("stream cancelled")]
    Cancelled,
    /// The session went away.
    #[error("session ended")]
    SessionEnded,
    /// The peer ended the stream with an error.
    #[error("{0}")]
    Remote(String),
    /// The reader fell too far behind and the stream was failed.
    #[error("stream buffer overflow")]
    Overflow,
    /// A body did not decode as the expected JSON.
    #[error("invalid json body: {0}")]
    Json(String),
}

impl From<StreamError> for CallError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Remote(msg) => Self::Remote(msg),
            StreamError::Json(msg) => Self::Invalid(msg),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Session-fatal failures.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The boxstream underneath failed.
    #[error("boxstream: {0}")]
    BoxStream(#[from] BoxStreamError),
    /// A packet could not be parsed.
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    /// The boxstream ended in the middle of a packet.
    #[error("session ended mid-packet")]
    Truncated,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RequestBody {
    pub(crate) name: Method,
    #[serde(default)]
    pub(crate) args: Value,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub(crate) call_type: Option<CallType>,
}

/// An inbound call as seen by a handler.
pub struct Request {
    /// Method that was called.
    pub method: Method,
    /// Shape the caller asked for.
    pub call_type: CallType,
    /// Raw JSON arguments, normally an array.
    pub args: Value,
    endpoint: Endpoint,
    ctx: CancellationToken,
}

impl Request {
    /// Identity of the caller.
    #[must_use]
    pub fn remote(&self) -> &FeedRef {
        self.endpoint.remote()
    }

    /// The caller's session.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Cancellation token scoped to this stream.
    #[must_use]
    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    /// Decode the whole argument array.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Invalid`] when the arguments have another shape.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, CallError> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| CallError::Invalid(format!("{}: bad request: {e}", self.method)))
    }

    /// Decode the first argument.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Invalid`] when there is no first argument or it
    /// has another shape.
    pub fn first_arg<T: DeserializeOwned>(&self) -> Result<T, CallError> {
        let first = self
            .args
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .ok_or_else(|| CallError::Invalid(format!("{}: expected an argument", self.method)))?;
        serde_json::from_value(first)
            .map_err(|e| CallError::Invalid(format!("{}: bad request: {e}", self.method)))
    }
}
