//! # Runtime Errors
//!
//! Every failure a session, dispatcher or caller can observe. Local failures
//! (a bad reference, a missing method, a method that fails) travel back to the
//! caller as `error` envelopes and leave the session open. Protocol failures
//! (undecodable frames, reused correlation ids, negative reference counts) are
//! fatal to their session only.

use ternwire::ErrorKind;
use ternwire::WireError;

use crate::channel::ChannelError;
use crate::handles::ObjectId;
use crate::value::Value;

/// A failure reported by the other side of a session, or by an application method.
///
/// This is what a method body returns on failure and what a caller receives
/// when its call is answered with an `error` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    pub data: Option<Box<Value>>,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), data: None }
    }

    /// An application failure of the default `InvocationError` kind.
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invocation, message)
    }

    /// An application failure with its own kind name.
    pub fn custom(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Custom(kind.into()), message)
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(Box::new(data.into()));
        self
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Clone)]
pub enum Error {
    /// Malformed or truncated envelope. Fatal to the session.
    Decode(String),
    /// A value could not be encoded (too deep, oversized blob).
    Encode(String),
    /// A reference named an id that is not exported to this peer.
    UnknownReference(ObjectId),
    /// The target exists but has no such method.
    NoSuchMethod { target: ObjectId, method: String },
    /// The method ran and failed.
    Invocation(RemoteError),
    /// A sequencing rule was broken. Fatal to the session.
    Protocol(String),
    /// The session closed before the call resolved.
    SessionClosed,
    /// No reply arrived within the configured call timeout.
    Timeout,
    /// The channel failed underneath the session.
    Transport(ChannelError),
    /// The peer answered the call with an `error` envelope.
    Remote(RemoteError),
}

impl Error {
    /// The wire kind this error is reported under.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode(_) => ErrorKind::Decode,
            Self::Encode(_) => ErrorKind::Custom("EncodeError".into()),
            Self::UnknownReference(_) => ErrorKind::UnknownReference,
            Self::NoSuchMethod { .. } => ErrorKind::NoSuchMethod,
            Self::Invocation(e) | Self::Remote(e) => e.kind.clone(),
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::SessionClosed | Self::Transport(_) => ErrorKind::SessionClosed,
            Self::Timeout => ErrorKind::Custom("TimeoutError".into()),
        }
    }

    /// Whether this error must tear down the session that observed it.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Protocol(_) | Self::Transport(_))
    }

    /// Converts the error into the form a remote caller receives.
    pub fn into_remote(self) -> RemoteError {
        match self {
            Self::Invocation(e) | Self::Remote(e) => e,
            other => RemoteError::new(other.kind(), other.to_string()),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
            Self::Encode(msg) => write!(f, "encode error: {}", msg),
            Self::UnknownReference(id) => write!(f, "unknown reference {}", id),
            Self::NoSuchMethod { target, method } => write!(f, "{} has no method '{}'", target, method),
            Self::Invocation(e) => write!(f, "invocation failed: {}", e),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::SessionClosed => write!(f, "session closed"),
            Self::Timeout => write!(f, "call timed out"),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Remote(e) => write!(f, "remote error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Invocation(e) | Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Self { Self::Transport(e) }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self { Self::Decode(e.to_string()) }
}

impl From<ternpack::Error> for Error {
    fn from(e: ternpack::Error) -> Self { Self::Decode(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, Error>;
