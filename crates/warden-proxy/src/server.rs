//! Proxy lifecycle: accept loop, concurrency limit, background list
//! refresh and graceful shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! initial_refresh(blocklist, allowlist)   (both awaited, failure is fatal)
//!         |
//!         v
//! Proxy::new(opts) --> Proxy::serve(listener)
//!                         |
//!                         +-- list refresh tasks (every update interval)
//!                         +-- accept --> permit? --no--> ConcurrencyLimited
//!                                          |
//!                                          yes --> pipeline task (tracked)
//!
//! Proxy::shutdown() --> cancel token --> accept loop, relays, refresh tasks
//!                   --> wait for every tracked task
//! ```

use crate::antireplay::{AntiReplayCache, NoopCache};
use crate::dialer::Dialer;
use crate::events::{Event, EventStream, NoopStream};
use crate::iplist::{IpList, ListKind, DEFAULT_UPDATE_INTERVAL};
use crate::pool::BufferPool;
use crate::proxy::ConnectionPipeline;
use crate::relay::Relay;
use crate::sniff::Sniffer;
use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Default maximum number of in-flight connections.
pub const DEFAULT_CONCURRENCY: usize = 8192;

/// Default relay idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default time a client has to present its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a [`Proxy`] is built from.
pub struct ProxyOpts {
    /// Outbound path for targets and the fronting address.
    pub network: Arc<dyn Dialer>,

    /// Client handshake recogniser.
    pub sniffer: Arc<dyn Sniffer>,

    /// Replay detector.
    /// Default: [`NoopCache`]
    pub anti_replay: Arc<dyn AntiReplayCache>,

    /// Peers to reject.
    /// Default: [`IpList::noop`]
    pub blocklist: Arc<IpList>,

    /// Peers to accept.
    /// Default: [`IpList::allow_all`]
    pub allowlist: Arc<IpList>,

    /// Event sink.
    /// Default: [`NoopStream`]
    pub event_stream: Arc<dyn EventStream>,

    /// Maximum in-flight connections.
    /// Default: 8192
    pub concurrency: usize,

    /// `host:port` that unrecognised clients are relayed to.
    /// Default: none (drop them)
    pub domain_fronting: Option<String>,

    /// Relay idle timeout.
    /// Default: 60 seconds
    pub idle_timeout: Duration,

    /// Handshake read timeout.
    /// Default: 10 seconds
    pub handshake_timeout: Duration,

    /// Blocklist refresh interval.
    /// Default: 24 hours
    pub blocklist_update: Duration,

    /// Allowlist refresh interval.
    /// Default: 24 hours
    pub allowlist_update: Duration,
}

impl ProxyOpts {
    /// Options with defaults for everything but the dialer and sniffer.
    pub fn new(network: Arc<dyn Dialer>, sniffer: Arc<dyn Sniffer>) -> Self {
        Self {
            network,
            sniffer,
            anti_replay: Arc::new(NoopCache),
            blocklist: Arc::new(IpList::noop(ListKind::Blocklist)),
            allowlist: Arc::new(IpList::allow_all()),
            event_stream: Arc::new(NoopStream),
            concurrency: DEFAULT_CONCURRENCY,
            domain_fronting: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            blocklist_update: DEFAULT_UPDATE_INTERVAL,
            allowlist_update: DEFAULT_UPDATE_INTERVAL,
        }
    }
}

/// Populate both access lists concurrently before serving.
///
/// # Errors
/// `ProxyError::List` if either list cannot be built.
pub async fn initial_refresh(blocklist: &IpList, allowlist: &IpList) -> Result<()> {
    let (blocked, allowed) = tokio::try_join!(blocklist.refresh(), allowlist.refresh())?;
    info!(blocklist = blocked, allowlist = allowed, "access lists loaded");
    Ok(())
}

/// The forward proxy.
pub struct Proxy {
    pipeline: Arc<ConnectionPipeline>,
    events: Arc<dyn EventStream>,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    list_updates: [Duration; 2],
}

impl Proxy {
    /// Create a proxy from `opts`.
    ///
    /// # Errors
    /// * `ProxyError::Config` - Zero concurrency or a zero timeout.
    pub fn new(opts: ProxyOpts) -> Result<Self> {
        if opts.concurrency == 0 {
            return Err(ProxyError::Config("concurrency must be positive".to_string()));
        }
        if opts.idle_timeout.is_zero() || opts.handshake_timeout.is_zero() {
            return Err(ProxyError::Config("timeouts must be positive".to_string()));
        }

        let relay = Relay::new(
            BufferPool::relay(),
            Arc::clone(&opts.event_stream),
            opts.idle_timeout,
        );
        let pipeline = ConnectionPipeline {
            dialer: opts.network,
            sniffer: opts.sniffer,
            anti_replay: opts.anti_replay,
            blocklist: opts.blocklist,
            allowlist: opts.allowlist,
            events: Arc::clone(&opts.event_stream),
            relay,
            rewind_pool: BufferPool::rewind(),
            domain_fronting: opts.domain_fronting,
            handshake_timeout: opts.handshake_timeout,
        };

        Ok(Self {
            pipeline: Arc::new(pipeline),
            events: opts.event_stream,
            limiter: Arc::new(Semaphore::new(opts.concurrency)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            list_updates: [opts.blocklist_update, opts.allowlist_update],
        })
    }

    /// Number of connection slots currently free.
    pub fn available_slots(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Whether [`Proxy::shutdown`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Accept connections on `listener` until shutdown.
    ///
    /// Also starts the periodic refresh of both access lists.
    ///
    /// # Errors
    /// Currently infallible once running; accept errors are logged and
    /// the loop continues.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let lists = [&self.pipeline.blocklist, &self.pipeline.allowlist];
        for (list, interval) in lists.into_iter().zip(self.list_updates) {
            if list.sources().is_empty() {
                continue;
            }
            let list = Arc::clone(list);
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move { list.run(interval, cancel).await });
        }

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "proxy listening");
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "TCP accept error");
                        continue;
                    }
                },
            };

            let permit = match Arc::clone(&self.limiter).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(%peer, "concurrency limit reached, rejecting");
                    self.events.send(&self.cancel, Event::ConcurrencyLimited);
                    drop(stream);
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "failed to set TCP_NODELAY");
            }

            let pipeline = Arc::clone(&self.pipeline);
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                pipeline.handle(&cancel, stream, peer).await;
            });
        }

        debug!("accept loop stopped");
        Ok(())
    }

    /// Stop accepting, cancel every connection and refresh task, and wait
    /// for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("proxy stopped");
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("available_slots", &self.available_slots())
            .field("tasks", &self.tracker.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
