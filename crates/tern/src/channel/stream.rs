//! Length-prefixed framing over any byte stream.
//!
//! Each message is written as a 4-byte big-endian length followed by the
//! payload. End-of-stream exactly on a frame boundary is a clean close; anywhere
//! else it is an I/O error.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::Channel;
use super::ChannelError;
use super::Listener;
use super::Result;

/// Default upper bound on a single message: 16 MiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

pub struct StreamChannel<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    max_frame: usize,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self::with_max_frame(stream, DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(stream: S, max_frame: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_frame,
        }
    }
}

#[async_trait::async_trait]
impl<S> Channel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_frame {
            return Err(ChannelError::FrameTooLarge(payload.len()));
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| ChannelError::FrameTooLarge(payload.len()))?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;

        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                return match filled {
                    0 => Ok(None),
                    _ => Err(ChannelError::Io("stream ended inside a frame header".into())),
                };
            }
            filled += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame {
            return Err(ChannelError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// How long to wait before retrying after `error`.
///
/// A connection that died before it was accepted only affects itself, so the
/// next accept runs at once. Anything else (out of descriptors, out of memory)
/// backs off briefly.
fn accept_backoff(error: &io::Error) -> Duration {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => Duration::ZERO,
        _ => ACCEPT_BACKOFF,
    }
}

/// Runs `accept` until it succeeds, logging each failure.
async fn accept_retrying<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                let pause = accept_backoff(&e);
                tracing::warn!(error = %e, ?pause, "accept failed, retrying");
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}

/// Never exhausted: failed accepts are retried.
#[async_trait::async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> Option<Box<dyn Channel>> {
        let listener: &TcpListener = self;
        let (stream, addr) = accept_retrying(move || TcpListener::accept(listener)).await;
        tracing::debug!(%addr, "accepted tcp connection");
        let _ = stream.set_nodelay(true);
        Some(Box::new(StreamChannel::<TcpStream>::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_a_byte_stream() {
        let (a, b) = tokio::io::duplex(4096);
        let a = StreamChannel::new(a);
        let b = StreamChannel::new(b);

        let big = vec![7u8; 1000];
        a.send(b"short").await.unwrap();
        a.send(&big).await.unwrap();
        a.send(b"").await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(b"short".to_vec()));
        assert_eq!(b.recv().await.unwrap(), Some(big));
        assert_eq!(b.recv().await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_clean_eof_on_boundary() {
        let (a, b) = tokio::io::duplex(64);
        let a = StreamChannel::new(a);
        let b = StreamChannel::new(b);

        a.send(b"bye").await.unwrap();
        a.close().await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(b"bye".to_vec()));
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut raw, b) = tokio::io::duplex(64);
        let b = StreamChannel::new(b);

        raw.write_all(&10u32.to_be_bytes()).await.unwrap();
        raw.write_all(b"abc").await.unwrap();
        drop(raw);
        assert!(matches!(b.recv().await, Err(ChannelError::Io(_))));
    }

    #[tokio::test]
    async fn test_frame_limit() {
        let (a, b) = tokio::io::duplex(64);
        let a = StreamChannel::with_max_frame(a, 8);
        let b = StreamChannel::with_max_frame(b, 4);

        assert_eq!(a.send(&[0u8; 9]).await, Err(ChannelError::FrameTooLarge(9)));
        a.send(&[0u8; 6]).await.unwrap();
        assert_eq!(b.recv().await, Err(ChannelError::FrameTooLarge(6)));
    }

    #[tokio::test]
    async fn test_accept_retries_past_failed_connections() {
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let accepted = accept_retrying(|| {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let outcome = match n {
                0 => Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                1 => Err(io::Error::other("too many open files")),
                _ => Ok(n),
            };
            std::future::ready(outcome)
        })
        .await;
        assert_eq!(accepted, 2);
        assert_eq!(attempts.into_inner(), 3);
    }

    #[test]
    fn test_accept_backoff_by_error_kind() {
        assert_eq!(accept_backoff(&io::ErrorKind::ConnectionReset.into()), Duration::ZERO);
        assert_eq!(accept_backoff(&io::Error::other("emfile")), ACCEPT_BACKOFF);
    }
}
