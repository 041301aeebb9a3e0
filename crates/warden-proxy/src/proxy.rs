//! Per-connection admission and relay pipeline.
//!
//! # Connection Flow
//!
//! ```text
//! Accepted
//!     |
//!     +-- blocklisted / not allowlisted? --> Aborted (no dial)
//!     v
//! AccessChecked --RewindConn--> sniff (bounded by handshake timeout)
//!     |                             |
//!     |                             +-- not recognised --> rewind --> domain fronting?
//!     |                                                                 |-- yes: relay as-is
//!     v                                                                 +-- no:  Aborted
//! Sniffed --rewind, skip header--> anti-replay
//!     |                               |
//!     |                               +-- seen before --> Aborted
//!     v
//! ReplayChecked --dial target (cancellable)--> Dialed --> Relaying --> Closed
//! ```
//!
//! Every outcome is local to the connection: failures are logged at `debug`
//! and reported as events, never returned to the accept loop.

use crate::antireplay::AntiReplayCache;
use crate::dialer::{Dialer, NetworkKind};
use crate::events::{Event, EventStream};
use crate::iplist::IpList;
use crate::pool::BufferPool;
use crate::relay::Relay;
use crate::rewind::RewindConn;
use crate::sniff::{SniffError, Sniffer};
use crate::{ProxyError, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};

/// Shared, immutable state every connection task runs against.
pub(crate) struct ConnectionPipeline {
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) sniffer: Arc<dyn Sniffer>,
    pub(crate) anti_replay: Arc<dyn AntiReplayCache>,
    pub(crate) blocklist: Arc<IpList>,
    pub(crate) allowlist: Arc<IpList>,
    pub(crate) events: Arc<dyn EventStream>,
    pub(crate) relay: Relay,
    pub(crate) rewind_pool: Arc<BufferPool>,
    pub(crate) domain_fronting: Option<String>,
    pub(crate) handshake_timeout: Duration,
}

impl ConnectionPipeline {
    /// Run one accepted connection to completion.
    ///
    /// # Arguments
    /// * `cancel` - Process-wide shutdown signal
    /// * `client` - The accepted connection
    /// * `remote` - Peer address used for access control
    pub(crate) async fn handle<S>(&self, cancel: &CancellationToken, client: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let ip = remote.ip();
        if self.blocklist.contains(ip) {
            debug!(peer = %remote, "peer is blocklisted");
            self.events.send(cancel, Event::IpBlocklisted { remote: ip });
            return;
        }
        if !self.allowlist.contains(ip) {
            debug!(peer = %remote, "peer is not allowlisted");
            self.events.send(cancel, Event::IpNotAllowlisted { remote: ip });
            return;
        }

        let stream_id = new_stream_id();
        let span = debug_span!("conn", %stream_id, peer = %remote);

        async {
            self.events.send(
                cancel,
                Event::Start {
                    stream_id: stream_id.clone(),
                    remote,
                },
            );

            if let Err(e) = self.serve(cancel, &stream_id, client).await {
                debug!(error = %e, "connection aborted");
            }

            self.events.send(cancel, Event::Finish { stream_id: stream_id.clone() });
        }
        .instrument(span)
        .await
    }

    async fn serve<S>(&self, cancel: &CancellationToken, stream_id: &str, client: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conn = RewindConn::new(client, &self.rewind_pool);

        let sniffed = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProxyError::Shutdown("cancelled during handshake".to_string()));
            }
            r = tokio::time::timeout(self.handshake_timeout, self.sniffer.sniff(&mut conn)) => {
                r.unwrap_or_else(|_| {
                    let timed_out = io::Error::new(io::ErrorKind::TimedOut, "handshake timeout");
                    Err(SniffError::Io(timed_out))
                })
            }
        };
        conn.rewind();

        let handshake = match sniffed {
            Ok(handshake) => handshake,
            Err(e) => return self.front(cancel, stream_id, conn, e).await,
        };

        if self.anti_replay.seen_before(&handshake.fingerprint) {
            self.events.send(
                cancel,
                Event::ReplayAttack {
                    stream_id: stream_id.to_string(),
                },
            );
            return Err(ProxyError::ReplayAttack);
        }

        // Replay starts from the first byte; drop the handshake itself.
        let skipped = tokio::io::copy(
            &mut (&mut conn).take(handshake.header_len as u64),
            &mut tokio::io::sink(),
        )
        .await
        .map_err(|e| ProxyError::Internal(format!("failed to skip handshake: {e}")))?;
        if skipped != handshake.header_len as u64 {
            return Err(ProxyError::Internal("handshake replay truncated".to_string()));
        }

        let upstream = self
            .dialer
            .dial_with_cancel(cancel, NetworkKind::Tcp, &handshake.target)
            .await?;
        self.events.send(
            cancel,
            Event::Connected {
                stream_id: stream_id.to_string(),
                target: handshake.target.clone(),
            },
        );
        debug!(target = %handshake.target, "upstream connected");

        let stats = self.relay.run(cancel, stream_id, conn, upstream).await;
        debug!(upstream = stats.upstream, downstream = stats.downstream, "relay finished");
        Ok(())
    }

    /// Relay an unrecognised client, unchanged, to the fronting address.
    async fn front<S>(
        &self,
        cancel: &CancellationToken,
        stream_id: &str,
        conn: RewindConn<S>,
        reason: SniffError,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(fronting) = &self.domain_fronting else {
            return Err(reason.into());
        };
        debug!(error = %reason, %fronting, "handshake not recognised, fronting");

        self.events.send(
            cancel,
            Event::DomainFronting {
                stream_id: stream_id.to_string(),
            },
        );
        let upstream = self
            .dialer
            .dial_with_cancel(cancel, NetworkKind::Tcp, fronting)
            .await?;
        self.relay.run(cancel, stream_id, conn, upstream).await;
        Ok(())
    }
}

/// Random 128-bit hex identifier.
pub(crate) fn new_stream_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
