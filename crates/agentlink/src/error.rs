//! Error types for the command and event channels.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Which side of the link an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    /// Request-reply endpoint carrying commands.
    Command,
    /// Subscribe-only endpoint carrying events.
    Event,
}

impl EndpointRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failures. Never retried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid channel address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The peer closed the connection or the endpoint was shut down.
    #[error("connection closed")]
    Closed,

    /// The endpoint was never opened or has already been torn down.
    #[error("{0} endpoint is not open")]
    NotOpen(EndpointRole),

    /// A socket option was rejected before dialing.
    #[error("invalid socket option: {0}")]
    InvalidOption(String),

    /// Operation not valid in the socket's current state.
    #[error("protocol state: {0}")]
    ProtocolState(&'static str),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure of a single socket operation.
///
/// Timeouts are kept apart from everything else so the channel layer can
/// absorb them up to its retry budget.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("deadline of {0:?} elapsed")]
    Timeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SocketError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Errors returned to callers of the channel manager.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The command could not be serialized. Never retried.
    #[error("failed to encode command: {0}")]
    Encode(String),

    /// A payload could not be deserialized.
    #[error("failed to decode command: {0}")]
    Decode(String),

    #[error("send timed out {attempts} times")]
    SendTimeoutExceeded { attempts: u32 },

    #[error("receive timed out {attempts} times")]
    RecvTimeoutExceeded { attempts: u32 },

    #[error("no event within {deadline:?}")]
    EventTimeout { deadline: Duration },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Endpoint construction failed. Any socket opened on the way was closed.
    #[error("failed to open {role} endpoint at {address}: {source}")]
    Initialization {
        role: EndpointRole,
        address: String,
        #[source]
        source: TransportError,
    },
}

impl ChannelError {
    pub fn encode(reason: impl Into<String>) -> Self {
        Self::Encode(reason.into())
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode(reason.into())
    }

    /// True for every deadline-driven failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::SendTimeoutExceeded { .. }
                | Self::RecvTimeoutExceeded { .. }
                | Self::EventTimeout { .. }
        )
    }

    /// True when the endpoint is gone (shut down, never opened, peer closed).
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::Closed | TransportError::NotOpen(_))
        )
    }
}
