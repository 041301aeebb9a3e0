//! Rewindable connection used for protocol sniffing.
//!
//! Until [`RewindConn::rewind`] is called every byte read from the inner
//! stream is also appended to a pooled record buffer. After the rewind,
//! reads drain the record buffer first and then continue from the inner
//! stream, so the consumer sees the connection from its first byte with no
//! gap and no duplicate.
//!
//! ```text
//! Recording:  inner --read--> caller
//!                  \--tee---> record
//!
//! Replaying:  record --read--> caller   (until drained)
//! Live:       inner  --read--> caller
//! ```

use crate::pool::{BufferPool, PooledBuffer};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Recording,
    Replaying { pos: usize },
    Live,
}

/// Stream wrapper that records reads until rewound.
///
/// Reads and rewinds take `&mut self`, so one instance always has exactly
/// one reader.
#[derive(Debug)]
pub struct RewindConn<S> {
    inner: S,
    record: Option<PooledBuffer>,
    mode: Mode,
}

impl<S> RewindConn<S> {
    /// Wrap `inner`, recording into a buffer checked out of `pool`.
    pub fn new(inner: S, pool: &Arc<BufferPool>) -> Self {
        Self {
            inner,
            record: Some(pool.get()),
            mode: Mode::Recording,
        }
    }

    /// Stop recording and replay everything read so far.
    ///
    /// Calling this again once replay has started does nothing.
    pub fn rewind(&mut self) {
        if self.mode != Mode::Recording {
            return;
        }
        if self.recorded_len() == 0 {
            self.release();
        } else {
            self.mode = Mode::Replaying { pos: 0 };
        }
    }

    /// Number of bytes currently held for replay.
    pub fn recorded_len(&self) -> usize {
        match self.mode {
            Mode::Recording => self.record.as_deref().map_or(0, <[u8]>::len),
            Mode::Replaying { pos } => self.record.as_deref().map_or(0, |r| r.len() - pos),
            Mode::Live => 0,
        }
    }

    /// Reference to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwrap, discarding anything not yet replayed.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn release(&mut self) {
        self.record = None;
        self.mode = Mode::Live;
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.mode {
            Mode::Recording => {
                let before = buf.filled().len();
                ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
                let fresh = &buf.filled()[before..];
                if !fresh.is_empty() {
                    if let Some(record) = this.record.as_mut() {
                        record.as_vec_mut().extend_from_slice(fresh);
                    }
                }
                Poll::Ready(Ok(()))
            }
            Mode::Replaying { pos } => {
                let (copied, total) = {
                    let recorded = this.record.as_deref().unwrap_or(&[]);
                    let n = buf.remaining().min(recorded.len().saturating_sub(pos));
                    buf.put_slice(&recorded[pos..pos + n]);
                    (n, recorded.len())
                };

                if pos + copied >= total {
                    // Record buffer drained: hand it back to the pool now.
                    this.release();
                    if copied == 0 {
                        return Pin::new(&mut this.inner).poll_read(cx, buf);
                    }
                } else {
                    this.mode = Mode::Replaying { pos: pos + copied };
                }
                Poll::Ready(Ok(()))
            }
            Mode::Live => Pin::new(&mut this.inner).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
