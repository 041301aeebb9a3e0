//! Instrumented bidirectional relay.
//!
//! ```text
//!   client --read--> [32 KiB pooled buf] --Traffic(Upstream)--> write --> upstream
//!   client <--write-- [32 KiB pooled buf] <--Traffic(Downstream)-- read -- upstream
//! ```
//!
//! Each direction runs until EOF, an I/O error, its idle timeout, or
//! cancellation. EOF half-closes the opposite writer so the peer can finish;
//! an error or idle timeout stops both directions. Both streams are dropped
//! (and therefore closed) when [`Relay::run`] returns.

use crate::events::{Direction, Event, EventStream};
use crate::pool::BufferPool;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes moved in each direction by one relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to upstream.
    pub upstream: u64,
    /// Upstream to client.
    pub downstream: u64,
}

/// Copies bytes between a client and an upstream connection.
#[derive(Clone)]
pub struct Relay {
    pool: Arc<BufferPool>,
    events: Arc<dyn EventStream>,
    idle_timeout: Duration,
}

impl Relay {
    /// Create a relay drawing buffers from `pool`.
    ///
    /// # Arguments
    /// * `pool` - Pool of fixed-size relay buffers
    /// * `events` - Sink for per-chunk traffic events
    /// * `idle_timeout` - A direction with no data for this long stops the relay
    pub fn new(
        pool: Arc<BufferPool>,
        events: Arc<dyn EventStream>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            events,
            idle_timeout,
        }
    }

    /// Relay until both directions finish or `cancel` fires.
    pub async fn run<C, U>(
        &self,
        cancel: &CancellationToken,
        stream_id: &str,
        client: C,
        upstream: U,
    ) -> RelayStats
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
        U: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let stop = cancel.child_token();

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let (up, down) = tokio::join!(
            self.pump(
                cancel,
                &stop,
                stream_id,
                Direction::Upstream,
                &mut client_read,
                &mut upstream_write,
            ),
            self.pump(
                cancel,
                &stop,
                stream_id,
                Direction::Downstream,
                &mut upstream_read,
                &mut client_write,
            ),
        );

        RelayStats {
            upstream: up,
            downstream: down,
        }
    }

    async fn pump<R, W>(
        &self,
        cancel: &CancellationToken,
        stop: &CancellationToken,
        stream_id: &str,
        direction: Direction,
        reader: &mut R,
        writer: &mut W,
    ) -> u64
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = self.pool.get();
        let mut total = 0u64;

        let outcome: io::Result<()> = loop {
            let read = tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                r = tokio::time::timeout(self.idle_timeout, reader.read(&mut buf)) => r,
            };

            let n = match read {
                Ok(Ok(0)) => {
                    // Best-effort half-close; the peer sees a reset if this fails.
                    let _ = writer.shutdown().await;
                    return total;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => break Err(e),
                Err(_) => break Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            };

            self.events.send(
                cancel,
                Event::Traffic {
                    stream_id: stream_id.to_string(),
                    bytes: n,
                    direction,
                },
            );

            let written = tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                w = writer.write_all(&buf[..n]) => w,
            };
            if let Err(e) = written {
                break Err(e);
            }
            total += n as u64;
        };

        if let Err(e) = outcome {
            match e.kind() {
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {}
                _ => debug!(%stream_id, %direction, error = %e, "relay direction failed"),
            }
        }
        stop.cancel();
        total
    }
}
