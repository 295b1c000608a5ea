//! # Value Markers
//!
//! Names of the special variants a value may contain besides plain data.
//!
//! ```text
//! ref   { oid: u64, origin: "sender" | "receiver" }
//! error { kind: str, message: str, data?: any }
//! ```
//!
//! `origin` is relative to the envelope carrying the marker: `sender` means the
//! sender exported the object and the receiver should hold a proxy to it;
//! `receiver` means the object already belongs to the receiver and is coming home.

pub const REF: &str = "ref";
pub const ERROR: &str = "error";

/// Which side of the connection owns a referenced object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Sender,
    Receiver,
}

impl Origin {
    pub fn as_tag(self) -> &'static str {
        match self {
            Origin::Sender => "sender",
            Origin::Receiver => "receiver",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "sender" => Some(Origin::Sender),
            "receiver" => Some(Origin::Receiver),
            _ => None,
        }
    }
}
