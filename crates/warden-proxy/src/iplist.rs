//! IP block/allow lists with atomic background refresh.
//!
//! # Refresh Cycle
//!
//! ```text
//!   every update interval (and once at startup):
//!
//!   Remote URLs --(buffer_unordered(concurrency))--+
//!   Local files ------------------------------------+--> merge --> IpRangeSet
//!   In-memory networks -----------------------------+                  |
//!                                                                      v
//!                                       any source failed? --yes--> keep old set
//!                                                 |
//!                                                 no
//!                                                 v
//!                                   ArcSwap::store(new set), size callback
//! ```
//!
//! Readers call [`IpList::contains`], which loads the current set with one
//! atomic pointer read; they never wait for a refresh and never see a
//! half-built set.

use crate::events::{Event, EventStream};
use arc_swap::ArcSwap;
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

/// Default interval between list refreshes.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors from building or refreshing an IP list.
#[derive(Debug, thiserror::Error)]
pub enum ListError {
    /// A line is neither an IP, a CIDR, a comment nor blank.
    #[error("{origin}:{line}: invalid IP range {text:?}")]
    Parse {
        origin: String,
        line: usize,
        text: String,
    },

    /// Remote source could not be fetched.
    #[error("Failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Local source could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Refresh abandoned because of shutdown.
    #[error("Refresh cancelled")]
    Cancelled,
}

/// Sorted, merged IPv4 and IPv6 ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpRangeSet {
    v4: Vec<(u32, u32)>,
    v6: Vec<(u128, u128)>,
}

impl IpRangeSet {
    /// Set matching nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set matching every IPv4 and IPv6 address.
    pub fn everything() -> Self {
        Self {
            v4: vec![(0, u32::MAX)],
            v6: vec![(0, u128::MAX)],
        }
    }

    /// Build from networks, merging overlaps and adjacent ranges.
    pub fn from_nets(nets: impl IntoIterator<Item = IpNet>) -> Self {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for net in nets {
            match net {
                IpNet::V4(n) => v4.push((u32::from(n.network()), u32::from(n.broadcast()))),
                IpNet::V6(n) => v6.push((u128::from(n.network()), u128::from(n.broadcast()))),
            }
        }
        Self {
            v4: merge(v4),
            v6: merge(v6),
        }
    }

    /// Parse list text: one IP or CIDR per line, `#`/`;` comments.
    ///
    /// # Errors
    /// [`ListError::Parse`] naming `origin` and the 1-based line number.
    pub fn parse(origin: &str, text: &str) -> Result<Vec<IpNet>, ListError> {
        let mut nets = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw
                .split(|c| c == '#' || c == ';')
                .next()
                .unwrap_or_default()
                .trim();
            if line.is_empty() {
                continue;
            }

            let net = line
                .parse::<IpNet>()
                .map(|n| n.trunc())
                .or_else(|_| line.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| ListError::Parse {
                    origin: origin.to_string(),
                    line: idx + 1,
                    text: line.to_string(),
                })?;
            nets.push(net);
        }
        Ok(nets)
    }

    /// Whether `ip` falls in any range. IPv4-mapped IPv6 addresses are
    /// matched against the IPv4 ranges.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip.to_canonical() {
            IpAddr::V4(v4) => in_ranges(&self.v4, u32::from(v4)),
            IpAddr::V6(v6) => in_ranges(&self.v6, u128::from(v6)),
        }
    }

    /// Number of merged ranges.
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn merge<T>(mut ranges: Vec<(T, T)>) -> Vec<(T, T)>
where
    T: Ord + Copy + MergeStep,
{
    ranges.sort_unstable();
    let mut merged: Vec<(T, T)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1.next_or_max() => {
                if end > last.1 {
                    last.1 = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

fn in_ranges<T: Ord + Copy>(ranges: &[(T, T)], x: T) -> bool {
    let idx = ranges.partition_point(|&(start, _)| start <= x);
    idx > 0 && ranges[idx - 1].1 >= x
}

trait MergeStep {
    fn next_or_max(self) -> Self;
}

impl MergeStep for u32 {
    fn next_or_max(self) -> Self {
        self.saturating_add(1)
    }
}

impl MergeStep for u128 {
    fn next_or_max(self) -> Self {
        self.saturating_add(1)
    }
}

/// Where list entries come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListSource {
    /// Plain-text list fetched over HTTP(S).
    Remote(Url),
    /// Plain-text list on disk.
    File(PathBuf),
    /// Fixed networks.
    Memory(Vec<IpNet>),
}

impl ListSource {
    /// `http(s)://` URLs are remote sources; anything else is a path.
    pub fn parse(raw: &str) -> Self {
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Remote(url),
            _ => Self::File(PathBuf::from(raw)),
        }
    }
}

impl fmt::Display for ListSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(url) => write!(f, "{url}"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Memory(nets) => write!(f, "<{} in-memory networks>", nets.len()),
        }
    }
}

/// Which way a list's matches are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Blocklist,
    Allowlist,
}

impl ListKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Blocklist => "blocklist",
            Self::Allowlist => "allowlist",
        }
    }
}

type SizeCallback = Box<dyn Fn(usize) + Send + Sync>;

/// A refreshable IP range set.
pub struct IpList {
    kind: ListKind,
    sources: Vec<ListSource>,
    current: ArcSwap<IpRangeSet>,
    http: reqwest::Client,
    concurrency: usize,
    on_update: Option<SizeCallback>,
}

impl IpList {
    /// Empty list fed by `sources`; call [`IpList::refresh`] to populate it.
    ///
    /// # Arguments
    /// * `kind` - Block or allow semantics (for logs and size events)
    /// * `sources` - Remote, file and in-memory sources merged on refresh
    /// * `http` - Client used for remote sources
    /// * `concurrency` - Maximum parallel downloads
    pub fn new(
        kind: ListKind,
        sources: Vec<ListSource>,
        http: reqwest::Client,
        concurrency: usize,
    ) -> Self {
        Self {
            kind,
            sources,
            current: ArcSwap::from_pointee(IpRangeSet::empty()),
            http,
            concurrency: concurrency.max(1),
            on_update: None,
        }
    }

    /// List that never matches and has nothing to refresh.
    pub fn noop(kind: ListKind) -> Self {
        Self::new(kind, Vec::new(), reqwest::Client::new(), 1)
    }

    /// Allowlist matching every address through the normal refresh path.
    pub fn allow_all() -> Self {
        let nets = vec![
            IpNet::V4(ipnet::Ipv4Net::default()),
            IpNet::V6(ipnet::Ipv6Net::default()),
        ];
        let list = Self::new(
            ListKind::Allowlist,
            vec![ListSource::Memory(nets)],
            reqwest::Client::new(),
            1,
        );
        list.current.store(Arc::new(IpRangeSet::everything()));
        list
    }

    /// Invoke `callback` with the new size after every successful swap.
    pub fn with_update_callback(
        mut self,
        callback: impl Fn(usize) + Send + Sync + 'static,
    ) -> Self {
        self.on_update = Some(Box::new(callback));
        self
    }

    /// Report every swap to `events` as [`Event::IpListSize`].
    pub fn report_to(self, events: Arc<dyn EventStream>) -> Self {
        let is_blocklist = self.kind == ListKind::Blocklist;
        let token = CancellationToken::new();
        self.with_update_callback(move |size| {
            events.send(&token, Event::IpListSize { size, is_blocklist });
        })
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    pub fn sources(&self) -> &[ListSource] {
        &self.sources
    }

    /// Whether `ip` is in the active set.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.current.load().contains(ip)
    }

    /// The active set.
    pub fn snapshot(&self) -> Arc<IpRangeSet> {
        self.current.load_full()
    }

    /// Fetch every source and swap in the merged set.
    ///
    /// All-or-nothing: if any source fails the active set is left as is.
    ///
    /// # Errors
    /// The first [`ListError`] encountered.
    pub async fn refresh(&self) -> Result<usize, ListError> {
        // Boxed up front so the refresh future stays Send when spawned.
        let pending: Vec<_> = self
            .sources
            .iter()
            .filter_map(|s| match s {
                ListSource::Remote(url) => Some(self.download(url).boxed()),
                _ => None,
            })
            .collect();

        let downloads: Vec<Result<Vec<IpNet>, ListError>> = stream::iter(pending)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut nets = Vec::new();
        for result in downloads {
            nets.extend(result?);
        }

        for source in &self.sources {
            match source {
                ListSource::Remote(_) => {}
                ListSource::File(path) => {
                    let text = tokio::fs::read_to_string(path)
                        .await
                        .map_err(|source| ListError::Read {
                            path: path.clone(),
                            source,
                        })?;
                    nets.extend(IpRangeSet::parse(&path.display().to_string(), &text)?);
                }
                ListSource::Memory(fixed) => nets.extend(fixed.iter().copied()),
            }
        }

        let set = IpRangeSet::from_nets(nets);
        let size = set.len();
        self.current.store(Arc::new(set));

        if let Some(callback) = &self.on_update {
            callback(size);
        }
        Ok(size)
    }

    async fn download(&self, url: &Url) -> Result<Vec<IpNet>, ListError> {
        let wrap = |source| ListError::Download {
            url: url.to_string(),
            source,
        };
        let text = self
            .http
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(wrap)?
            .text()
            .await
            .map_err(wrap)?;
        debug!(%url, bytes = text.len(), "downloaded list");
        IpRangeSet::parse(url.as_str(), &text)
    }

    /// Refresh every `interval` until `cancel` fires.
    ///
    /// Failed cycles are logged and keep the previous set.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let span = info_span!("iplist", name = self.kind.name());
        async {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; startup already refreshed.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(ListError::Cancelled),
                    r = self.refresh() => r,
                };
                match result {
                    Ok(size) => info!(size, "list refreshed"),
                    Err(ListError::Cancelled) => break,
                    Err(e) => warn!(error = %e, "list refresh failed, keeping previous set"),
                }
            }
            debug!("refresh task stopped");
        }
        .instrument(span)
        .await
    }
}

impl fmt::Debug for IpList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpList")
            .field("kind", &self.kind)
            .field("sources", &self.sources)
            .field("ranges", &self.current.load().len())
            .finish()
    }
}
