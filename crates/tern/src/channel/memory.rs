//! In-process channels over tokio mpsc queues.

use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use super::Channel;
use super::ChannelError;
use super::Listener;
use super::Result;

/// One end of an in-process duplex channel.
///
/// Messages sent on one end appear on the other end's `recv()` and vice versa.
pub struct MemoryChannel {
    tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryChannel {
    /// Creates a pair of channels connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: StdMutex::new(Some(tx_a)),
            rx: Mutex::new(rx_b),
        };
        let b = Self {
            tx: StdMutex::new(Some(tx_b)),
            rx: Mutex::new(rx_a),
        };
        (a, b)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let tx = self.sender().ok_or(ChannelError::Closed)?;
        tx.send(payload.to_vec()).map_err(|_| ChannelError::Closed)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        Ok(())
    }
}

/// Accepting half of an in-process listener.
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryChannel>,
}

/// Dialing half of an in-process listener. Cheap to clone.
#[derive(Clone)]
pub struct MemoryConnector {
    outgoing: mpsc::UnboundedSender<MemoryChannel>,
}

/// Creates a listener and the connector that dials it.
///
/// The listener is exhausted once every connector has been dropped.
pub fn memory_listener() -> (MemoryListener, MemoryConnector) {
    let (outgoing, incoming) = mpsc::unbounded_channel();
    (MemoryListener { incoming }, MemoryConnector { outgoing })
}

impl MemoryConnector {
    /// Opens a new connection; the listener receives the other end.
    pub fn connect(&self) -> Result<MemoryChannel> {
        let (local, remote) = MemoryChannel::pair();
        self.outgoing.send(remote).map_err(|_| ChannelError::Closed)?;
        Ok(local)
    }
}

#[async_trait::async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Option<Box<dyn Channel>> {
        let channel = self.incoming.recv().await?;
        Some(Box::new(channel))
    }
}
