//! The outbound half of a replica connection.
//!
//! Frames are written whole under an async mutex. The stream publishes its
//! closed state on a watch channel that the master's close watcher waits on.
//! Every write races that channel, so [`ReplStream::shutdown`] completes even
//! while a write is blocked on a peer that stopped reading. A frame cut off
//! that way is detectable by the replica through its length prefix.

use std::fmt;
use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};

use crate::replication::protocol::{ProtocolError, ReplMessage};

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ReplStream {
    id: u64,
    writer: Mutex<Option<BoxWriter>>,
    closed: watch::Sender<bool>,
}

impl ReplStream {
    pub fn new(id: u64, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            id,
            writer: Mutex::new(Some(Box::new(writer))),
            closed: watch::Sender::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Encode and write one message. A write failure closes the stream, and
    /// closing the stream abandons a write in progress.
    pub async fn send(&self, message: &ReplMessage) -> Result<(), StreamError> {
        let frame = message.encode().map_err(StreamError::Encode)?;

        let mut writer = tokio::select! {
            biased;
            () = self.closed() => return Err(StreamError::Closed),
            writer = self.writer.lock() => writer,
        };
        let Some(conn) = writer.as_mut() else {
            return Err(StreamError::Closed);
        };
        let outcome = tokio::select! {
            biased;
            result = write_frame(conn, &frame) => Some(result),
            () = self.closed() => None,
        };

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                *writer = None;
                drop(writer);
                self.mark_closed();
                Err(StreamError::Io(e))
            }
            None => {
                // The writer may hold part of a frame; nothing more goes out on it.
                *writer = None;
                tracing::debug!(stream = self.id, "abandoned a write on a closed replica stream");
                Err(StreamError::Closed)
            }
        }
    }

    /// Mark the stream closed, then close the writer.
    ///
    /// Marking first aborts any write blocked on the peer, so this never waits
    /// on the replica.
    pub async fn shutdown(&self) {
        self.mark_closed();
        let taken = self.writer.lock().await.take();
        if let Some(mut conn) = taken {
            if let Err(e) = conn.shutdown().await {
                tracing::debug!(stream = self.id, error = %e, "error shutting down replica stream");
            }
        }
    }

    /// Record that the peer went away without touching the writer.
    pub fn mark_closed(&self) {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the stream is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

async fn write_frame(conn: &mut BoxWriter, frame: &[u8]) -> io::Result<()> {
    conn.write_all(frame).await?;
    conn.flush().await
}

impl fmt::Debug for ReplStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplStream")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum StreamError {
    Closed,
    Encode(ProtocolError),
    Io(io::Error),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "replica stream is closed"),
            Self::Encode(e) => write!(f, "failed to encode message: {e}"),
            Self::Io(e) => write!(f, "replica stream I/O error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Closed => None,
            Self::Encode(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::replication::protocol::read_message;
    use crate::timestamp::ReplTimestamp;

    fn nop(t: u64) -> ReplMessage {
        ReplMessage::Nop {
            timestamp: ReplTimestamp::new(t),
        }
    }

    #[tokio::test]
    async fn test_send_writes_whole_frames() {
        let (local, mut remote) = tokio::io::duplex(256);
        let stream = ReplStream::new(1, local);

        stream.send(&nop(5)).await.expect("should send");
        stream.send(&nop(6)).await.expect("should send");

        let first = read_message(&mut remote).await.expect("should read");
        let second = read_message(&mut remote).await.expect("should read");
        assert_eq!(first, Some(nop(5)));
        assert_eq!(second, Some(nop(6)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_rejects_sends() {
        let (local, mut remote) = tokio::io::duplex(256);
        let stream = ReplStream::new(2, local);
        assert!(!stream.is_closed());

        stream.shutdown().await;
        assert!(stream.is_closed());
        assert!(matches!(stream.send(&nop(1)).await, Err(StreamError::Closed)));

        let end = read_message(&mut remote).await.expect("clean eof");
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_write_failure_marks_closed() {
        let (local, remote) = tokio::io::duplex(256);
        let stream = ReplStream::new(3, local);
        drop(remote);

        assert!(matches!(stream.send(&nop(1)).await, Err(StreamError::Io(_))));
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_write_blocked_on_peer() {
        let (local, _remote) = tokio::io::duplex(4);
        let stream = std::sync::Arc::new(ReplStream::new(5, local));

        let blocked = {
            let stream = std::sync::Arc::clone(&stream);
            tokio::spawn(async move { stream.send(&nop(1)).await })
        };
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_secs(5), stream.shutdown())
            .await
            .expect("shutdown should not wait for the peer");
        let result = tokio::time::timeout(Duration::from_secs(5), blocked)
            .await
            .expect("blocked send should give up")
            .expect("task should not panic");
        assert!(matches!(result, Err(StreamError::Closed)));
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_mark_closed() {
        let (local, _remote) = tokio::io::duplex(256);
        let stream = std::sync::Arc::new(ReplStream::new(4, local));

        let waiter = {
            let stream = std::sync::Arc::clone(&stream);
            tokio::spawn(async move { stream.closed().await })
        };
        stream.mark_closed();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() should resolve")
            .expect("task should not panic");
    }
}
