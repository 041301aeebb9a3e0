//! Telemetry events and the sinks that receive them.
//!
//! Every stage of a connection publishes an [`Event`] through an
//! [`EventStream`]. Publishing is fire-and-forget: a sink must never block
//! the connection task, and the no-op sink is always a valid choice.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Which way bytes moved through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to upstream.
    Upstream,
    /// Upstream to client.
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => f.write_str("upstream"),
            Self::Downstream => f.write_str("downstream"),
        }
    }
}

/// A single measured occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Connection accepted and admitted past access control.
    Start { stream_id: String, remote: SocketAddr },
    /// Upstream connection established.
    Connected { stream_id: String, target: String },
    /// Unrecognised client relayed to the fronting address.
    DomainFronting { stream_id: String },
    /// Bytes read from one side of the relay.
    Traffic {
        stream_id: String,
        bytes: usize,
        direction: Direction,
    },
    /// Connection closed.
    Finish { stream_id: String },
    /// Connection dropped because the concurrency limit was reached.
    ConcurrencyLimited,
    /// Peer matched the blocklist.
    IpBlocklisted { remote: IpAddr },
    /// Peer did not match the allowlist.
    IpNotAllowlisted { remote: IpAddr },
    /// Handshake fingerprint seen before.
    ReplayAttack { stream_id: String },
    /// An access list was replaced.
    IpListSize { size: usize, is_blocklist: bool },
}

/// Sink for [`Event`]s.
pub trait EventStream: Send + Sync {
    /// Publish an event. Must return promptly.
    fn send(&self, cancel: &CancellationToken, event: Event);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStream;

impl EventStream for NoopStream {
    fn send(&self, _cancel: &CancellationToken, _event: Event) {}
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelStream {
    tx: mpsc::Sender<Event>,
}

impl ChannelStream {
    /// Create a sink and the receiver that drains it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventStream for ChannelStream {
    fn send(&self, cancel: &CancellationToken, event: Event) {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            tracing::trace!(?event, "event channel full, dropping");
        }
    }
}

/// Emits each event as a `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStream;

impl EventStream for LogStream {
    fn send(&self, _cancel: &CancellationToken, event: Event) {
        match event {
            Event::Start { stream_id, remote } => {
                tracing::debug!(%stream_id, %remote, "stream started");
            }
            Event::Connected { stream_id, target } => {
                tracing::debug!(%stream_id, %target, "upstream connected");
            }
            Event::DomainFronting { stream_id } => {
                tracing::info!(%stream_id, "domain fronting");
            }
            Event::Traffic {
                stream_id,
                bytes,
                direction,
            } => {
                tracing::trace!(%stream_id, bytes, %direction, "traffic");
            }
            Event::Finish { stream_id } => {
                tracing::debug!(%stream_id, "stream finished");
            }
            Event::ConcurrencyLimited => {
                tracing::warn!("concurrency limit reached");
            }
            Event::IpBlocklisted { remote } => {
                tracing::info!(%remote, "peer is blocklisted");
            }
            Event::IpNotAllowlisted { remote } => {
                tracing::info!(%remote, "peer is not allowlisted");
            }
            Event::ReplayAttack { stream_id } => {
                tracing::warn!(%stream_id, "replay attack detected");
            }
            Event::IpListSize { size, is_blocklist } => {
                let list = if is_blocklist { "blocklist" } else { "allowlist" };
                tracing::info!(list, size, "ip list updated");
            }
        }
    }
}
