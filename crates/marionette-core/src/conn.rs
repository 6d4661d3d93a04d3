//! Buffered, peekable connection.
//!
//! Actions must decide whether the bytes currently on the wire match a
//! guard pattern, or decrypt cleanly, *before* consuming them: a failed
//! match means "try another transition", and the bytes must stay available
//! for the next candidate. `BufferedConn` gives that commit protocol:
//! [`BufferedConn::peek`] is idempotent, and only
//! [`BufferedConn::seek_forward`] discards input.
//!
//! Reads can also be fed from an ingress queue, used by machine listeners
//! to surface bytes from accepted sub-connections as if they had arrived
//! on the transport.

use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::config::Config;
use crate::error::{Error, Result};

/// Byte channel requirements for the transport under a machine.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

enum Filled {
    Cancelled,
    Ingress(Option<Vec<u8>>),
    Transport(io::Result<usize>),
}

/// A peekable cursor over a bidirectional byte channel.
pub struct BufferedConn {
    inner: Box<dyn Conn>,
    buf: BytesMut,
    max_len: usize,
    read_deadline: Option<Duration>,
    write_deadline: Option<Duration>,
    cancel: watch::Receiver<bool>,
    ingress: mpsc::UnboundedReceiver<Vec<u8>>,
    // Held so the ingress channel outlives listeners that come and go.
    ingress_tx: mpsc::UnboundedSender<Vec<u8>>,
    eof: bool,
}

impl BufferedConn {
    /// Wraps `inner` with a read cursor bounded at the configured maximum
    /// cell length.
    pub fn new(inner: Box<dyn Conn>, config: &Config, cancel: watch::Receiver<bool>) -> Self {
        let (ingress_tx, ingress) = mpsc::unbounded_channel();
        Self {
            inner,
            buf: BytesMut::with_capacity(config.max_cell_len.min(64 * 1024)),
            max_len: config.max_cell_len,
            read_deadline: config.read_deadline,
            write_deadline: config.write_deadline,
            cancel,
            ingress,
            ingress_tx,
            eof: false,
        }
    }

    /// Handle for feeding listener bytes into the read cursor.
    pub(crate) fn ingress_sender(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.ingress_tx.clone()
    }

    /// Bytes currently buffered ahead of the cursor.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Sets the deadline applied to blocking reads. `None` blocks
    /// indefinitely.
    pub fn set_read_deadline(&mut self, deadline: Option<Duration>) {
        self.read_deadline = deadline;
    }

    /// Sets the deadline applied to writes.
    pub fn set_write_deadline(&mut self, deadline: Option<Duration>) {
        self.write_deadline = deadline;
    }

    /// Returns exactly `n` bytes without consuming them. Blocks until the
    /// bytes arrive; a configured read deadline turns the wait into a
    /// timeout error.
    ///
    /// # Errors
    ///
    /// Fails on cancellation, on end of input before `n` bytes, and on
    /// deadline expiry.
    pub async fn peek(&mut self, n: usize) -> Result<Bytes> {
        debug_assert!(n <= self.max_len);
        while self.buf.len() < n {
            if self.eof {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-peek",
                )));
            }
            if self.fill_one().await? == 0 && !self.eof {
                return Err(Error::Io(io::ErrorKind::TimedOut.into()));
            }
        }
        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }

    /// Returns whatever is buffered, blocking until at least one byte
    /// arrives, the deadline expires (empty result), or input ends.
    pub async fn peek_any(&mut self) -> Result<Bytes> {
        if self.buf.is_empty() && !self.eof {
            self.fill_one().await?;
        } else {
            self.try_fill().await;
        }
        if self.buf.is_empty() && self.eof {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        Ok(Bytes::copy_from_slice(&self.buf[..]))
    }

    /// Returns whatever is buffered without blocking, draining any bytes
    /// the transport already has ready.
    pub async fn peek_available(&mut self) -> Result<Bytes> {
        if *self.cancel.borrow() {
            return Err(Error::Cancelled);
        }
        self.try_fill().await;
        Ok(Bytes::copy_from_slice(&self.buf[..]))
    }

    /// Advances the cursor by `n`, discarding peeked bytes.
    ///
    /// # Errors
    ///
    /// Fails when `n` exceeds what has been buffered by a peek.
    pub fn seek_forward(&mut self, n: usize) -> Result<()> {
        if n > self.buf.len() {
            return Err(Error::SeekBeyondBuffer { n, buffered: self.buf.len() });
        }
        self.buf.advance(n);
        Ok(())
    }

    /// Writes a prefix of `data`, returning the byte count accepted. A
    /// configured write deadline reports expiry as `Ok(0)`; callers retry
    /// the unsent suffix.
    ///
    /// # Errors
    ///
    /// Non-timeout transport failures and cancellation are fatal.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self.write_deadline {
            Some(deadline) => match timeout(deadline, self.write_inner(data)).await {
                Ok(result) => result,
                Err(_) => Ok(0),
            },
            None => self.write_inner(data).await,
        }
    }

    /// Writes all of `data`, retrying recoverable timeouts from the unsent
    /// suffix.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            sent += self.write(&data[sent..]).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the write half of the underlying channel.
    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn write_inner(&mut self, data: &[u8]) -> Result<usize> {
        if *self.cancel.borrow() {
            return Err(Error::Cancelled);
        }
        let mut cancel = self.cancel.clone();
        let wrote = tokio::select! {
            _ = cancel.changed() => return Err(Error::Cancelled),
            wrote = self.inner.write(data) => wrote?,
        };
        if wrote == 0 && !data.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "connection closed mid-write",
            )));
        }
        Ok(wrote)
    }

    /// One blocking fill under the read deadline. Deadline expiry reports
    /// zero bytes added.
    async fn fill_one(&mut self) -> Result<usize> {
        match self.read_deadline {
            Some(deadline) => match timeout(deadline, self.fill_some()).await {
                Ok(result) => result,
                Err(_) => Ok(0),
            },
            None => self.fill_some().await,
        }
    }

    /// Drains whatever is immediately available without blocking.
    async fn try_fill(&mut self) {
        while let Ok(Ok(n)) = timeout(Duration::ZERO, self.fill_some()).await {
            if n == 0 {
                break;
            }
        }
    }

    /// Waits for input from the transport or the listener ingress queue.
    async fn fill_some(&mut self) -> Result<usize> {
        if *self.cancel.borrow() {
            return Err(Error::Cancelled);
        }
        let room = self.max_len.saturating_sub(self.buf.len());
        if room == 0 {
            return Ok(0);
        }

        let mut cancel = self.cancel.clone();
        let mut limited = (&mut *self.inner).take(room as u64);
        let filled = tokio::select! {
            _ = cancel.changed() => Filled::Cancelled,
            chunk = self.ingress.recv() => Filled::Ingress(chunk),
            read = limited.read_buf(&mut self.buf) => {
                Filled::Transport(read)
            },
        };

        match filled {
            Filled::Cancelled => Err(Error::Cancelled),
            Filled::Ingress(Some(chunk)) => {
                self.buf.extend_from_slice(&chunk);
                Ok(chunk.len())
            },
            Filled::Ingress(None) => Ok(0),
            Filled::Transport(read) => {
                let n = read?;
                if n == 0 {
                    self.eof = true;
                }
                Ok(n)
            },
        }
    }
}
