use std::io;

use thiserror::Error;

/// Errors surfaced by the registry and its links.
///
/// Transport and codec failures are fatal to the link that produced them and
/// are returned from the `link*` call that bound it. The per-call kinds
/// (`CallTimedOut`, `Remote`, `Cancelled`, `ChannelClosed`) are delivered to
/// the calling stub only and leave the link running.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid return, a remote method can only return an error or a value and an error")]
    InvalidReturn,
    #[error("invalid arguments, the first parameter must be the call context")]
    InvalidArgs,
    #[error("can not call non function")]
    CannotCallNonFunction,
    #[error("call timed out")]
    CallTimedOut,
    /// The peer answered with a non-blank `err` string. `message` carries it
    /// verbatim; `partial` holds the raw value blob when the response also
    /// carried one.
    #[error("{message}")]
    Remote {
        message: String,
        partial: Option<Vec<u8>>,
    },
    #[error("transport failed: {0}")]
    Transport(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("link context cancelled")]
    Cancelled,
    #[error("link channel closed unexpectedly")]
    ChannelClosed,
}

/// A marshal or unmarshal failure from the link's [`Codec`](crate::Codec).
#[derive(Clone, Debug, Error)]
#[error("codec failed: {0}")]
pub struct CodecError(String);

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// The error half of a handler or closure result.
///
/// Only the message crosses the wire; the calling stub reconstructs it as
/// [`RpcError::Remote`] with the text intact.
#[derive(Clone, Debug, Error)]
#[error("{0}")]
pub struct CallError(String);

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for CallError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for CallError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<RpcError> for CallError {
    fn from(err: RpcError) -> Self {
        Self(err.to_string())
    }
}

impl From<CodecError> for CallError {
    fn from(err: CodecError) -> Self {
        Self(err.to_string())
    }
}
