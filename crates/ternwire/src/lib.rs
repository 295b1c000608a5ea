//! # Ternwire
//!
//! Envelope framing for the tern object protocol, layered on `ternpack`.
//!
//! ## Architecture
//!
//! Frames know correlation ids, targets and method names, but treat every value
//! they carry as an opaque encoded item. This keeps the framing layer free of
//! any notion of objects, proxies or reference tables; the runtime's codec owns
//! those and hands frames pre-encoded bytes.

pub mod error;
pub mod frame;
pub mod marker;

pub use error::ErrorKind;
pub use error::Result;
pub use error::WireError;
pub use frame::CallEncoder;
pub use frame::CallFrame;
pub use frame::Delta;
pub use frame::ErrorEncoder;
pub use frame::ErrorFrame;
pub use frame::Frame;
pub use frame::RefDeltaEncoder;
pub use frame::RefDeltaFrame;
pub use frame::ResultEncoder;
pub use frame::ResultFrame;
pub use marker::Origin;
