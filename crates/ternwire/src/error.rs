//! # Error Definitions
//!
//! Failures of the framing layer itself, and the wire names of the failure
//! kinds a peer reports inside `error` envelopes.

use ternpack::Error as PackError;

/// Operational failures while framing or unframing an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The underlying ternpack encoding failed.
    Serialization(PackError),
    /// The top-level frame name is not one of the known envelope kinds.
    UnknownFrame(String),
    /// A required field was absent from the frame map.
    MissingField(&'static str),
    /// The frame is structurally valid but semantically broken.
    ProtocolViolation(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization failed: {}", e),
            Self::UnknownFrame(kind) => write!(f, "unknown frame kind '{}'", kind),
            Self::MissingField(field) => write!(f, "frame is missing field '{}'", field),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PackError> for WireError {
    fn from(e: PackError) -> Self { Self::Serialization(e) }
}

/// A specialized Result type for framing operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// The kind carried by an `error` envelope or an error value.
///
/// The runtime's own failures have fixed names; applications may report any
/// other kind string, which round-trips as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or truncated envelope.
    Decode,
    /// A reference named an id the receiver does not know.
    UnknownReference,
    /// The target has no method with the requested name.
    NoSuchMethod,
    /// The method itself failed.
    Invocation,
    /// A sequencing rule was broken.
    Protocol,
    /// The session closed before the call resolved.
    SessionClosed,
    /// An application-defined kind.
    Custom(String),
}

impl ErrorKind {
    pub fn as_tag(&self) -> &str {
        match self {
            Self::Decode => "DecodeError",
            Self::UnknownReference => "UnknownReferenceError",
            Self::NoSuchMethod => "NoSuchMethodError",
            Self::Invocation => "InvocationError",
            Self::Protocol => "ProtocolError",
            Self::SessionClosed => "SessionClosedError",
            Self::Custom(kind) => kind,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "DecodeError" => Self::Decode,
            "UnknownReferenceError" => Self::UnknownReference,
            "NoSuchMethodError" => Self::NoSuchMethod,
            "InvocationError" => Self::Invocation,
            "ProtocolError" => Self::Protocol,
            "SessionClosedError" => Self::SessionClosed,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}
