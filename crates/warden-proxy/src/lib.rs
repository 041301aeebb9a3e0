//! Connection admission and relay pipeline for the warden forward proxy.
//!
//! `warden-proxy` accepts client connections, decides whether each one may
//! pass, and relays it to its target through a configurable upstream path.
//!
//! # Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! Proxy::serve (one task per connection, bounded by a semaphore)
//!   |
//!   +-- IpList blocklist / allowlist   (ArcSwap, refreshed in background)
//!   +-- RewindConn + Sniffer           (handshake, or domain fronting)
//!   +-- AntiReplayCache                (stable Bloom filter or no-op)
//!   +-- Network (Dialer)
//!   |      +-- CachingResolver -> DoH
//!   |      +-- Direct | SOCKS5 | round-robin SOCKS5 pool
//!   +-- Relay                          (pooled 32 KiB buffers, traffic events)
//!   |
//!   v
//! Target
//! ```
//!
//! # Components
//!
//! - [`Proxy`]: Accept loop, concurrency limit, graceful shutdown
//! - [`RewindConn`]: Replays bytes consumed while sniffing
//! - [`Relay`]: Instrumented bidirectional copy
//! - [`Network`]: DNS-caching dialer over the configured upstream path
//! - [`IpList`]: Refreshable IP range set
//! - [`StableBloomFilter`]: Fixed-memory replay detector
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use warden_proxy::{Network, NetworkConfig, PreambleSniffer, Proxy, ProxyOpts};
//!
//! let network = Network::new(&NetworkConfig::default())?;
//! let sniffer = PreambleSniffer::new(secret, std::time::Duration::from_secs(5))?;
//! let proxy = Proxy::new(ProxyOpts::new(Arc::new(network), Arc::new(sniffer)))?;
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3128").await?;
//! proxy.serve(listener).await?;
//! ```

mod antireplay;
mod dialer;
mod dns;
mod events;
mod iplist;
mod network;
mod pool;
mod proxy;
mod relay;
mod rewind;
mod server;
mod sniff;
mod socks5;

pub use antireplay::{AntiReplayCache, NoopCache, StableBloomFilter, MAX_GENERATION_BITS};
pub use dialer::{
    make_dialer, DialError, Dialer, DirectDialer, LoadBalancedDialer, NetworkKind, Socks5Dialer,
    UpstreamDialer, DEFAULT_TCP_TIMEOUT,
};
pub use dns::{CachingResolver, DohResolver, RecordType, Resolve, DNS_CACHE_TTL};
pub use events::{ChannelStream, Direction, Event, EventStream, LogStream, NoopStream};
pub use iplist::{IpList, IpRangeSet, ListError, ListKind, ListSource, DEFAULT_UPDATE_INTERVAL};
pub use network::{make_http_client, Network, NetworkConfig, PreferIp, USER_AGENT};
pub use pool::{BufferKind, BufferPool, PoolStats, PooledBuffer, RELAY_BUFFER_SIZE};
pub use relay::{Relay, RelayStats};
pub use rewind::RewindConn;
pub use server::{
    initial_refresh, Proxy, ProxyOpts, DEFAULT_CONCURRENCY, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_IDLE_TIMEOUT,
};
pub use sniff::{
    Fingerprint, Handshake, Preamble, PreambleSniffer, SniffError, Sniffer, DEFAULT_TIME_SKEW,
    MIN_SECRET_LEN,
};
pub use socks5::{Credentials, Socks5Error, TargetAddr};

use std::net::SocketAddr;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Upstream connection failed.
    #[error(transparent)]
    Dial(#[from] DialError),

    /// Client handshake not recognised.
    #[error(transparent)]
    Sniff(#[from] SniffError),

    /// Handshake fingerprint seen before.
    #[error("Replay attack detected")]
    ReplayAttack,

    /// Access list could not be built.
    #[error(transparent)]
    List(#[from] ListError),

    /// HTTP client construction failed.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Operation abandoned because of shutdown.
    #[error("Shutdown: {0}")]
    Shutdown(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}
