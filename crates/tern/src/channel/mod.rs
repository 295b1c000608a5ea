//! # Channel Abstraction
//!
//! A minimal, async interface for moving whole messages between two runtimes.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: A channel knows nothing about frames, values or
//!   references. It moves opaque buffers, one message per `send`.
//! - **Ordered**: Messages arrive in send order. Sessions rely on this for
//!   reference releases never overtaking the frames that carried the reference.
//! - **Not a socket**: Opening connections is the host's business. Sessions are
//!   handed an already-connected channel; servers are handed a `Listener`.

use std::fmt;

mod memory;
mod stream;

pub use memory::MemoryChannel;
pub use memory::MemoryConnector;
pub use memory::MemoryListener;
pub use memory::memory_listener;
pub use stream::StreamChannel;
pub use stream::DEFAULT_MAX_FRAME;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The other end is gone.
    Closed,
    /// A message exceeded the channel's size limit.
    FrameTooLarge(usize),
    /// Generic I/O failure.
    Io(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed"),
            Self::FrameTooLarge(n) => write!(f, "frame of {} bytes exceeds limit", n),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// An ordered, bidirectional message channel to one peer.
///
/// This trait is object-safe (`Arc<dyn Channel>`). A session sends and receives
/// concurrently from two tasks, so both methods take `&self`.
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Sends one message.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next message. `Ok(None)` means the peer closed cleanly.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the sending half; the peer observes end-of-stream.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A source of freshly connected channels.
#[async_trait::async_trait]
pub trait Listener: Send + 'static {
    /// Waits for the next connection. `None` means the listener is exhausted.
    async fn accept(&mut self) -> Option<Box<dyn Channel>>;
}
