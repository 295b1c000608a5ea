//! Session configuration.

use std::time::Duration;

use crate::channel::DEFAULT_MAX_FRAME;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `call` waits for a reply. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Deepest container nesting the codec accepts in either direction.
    pub max_depth: usize,
    /// Largest envelope the session will put on the wire.
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(30)),
            max_depth: 64,
            max_frame_size: DEFAULT_MAX_FRAME,
        }
    }
}

impl SessionConfig {
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}
