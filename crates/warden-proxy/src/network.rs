//! Outbound network: dialer + caching resolver + HTTP client.
//!
//! ```text
//! Network::dial("host:port")
//!      |
//!      +-- IP literal --------------------------> inner dialer
//!      |
//!      +-- hostname --> CachingResolver (A/AAAA, PreferIp order)
//!                             |
//!                             v
//!                   for each address: inner dialer
//!                   (first success wins, else last error)
//! ```

use crate::dialer::{make_dialer, DialError, Dialer, DirectDialer, NetworkKind};
use crate::dns::{CachingResolver, DohResolver, RecordType};
use crate::socks5::TargetAddr;
use crate::{ProxyError, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// `User-Agent` sent on every HTTP request.
pub const USER_AGENT: &str = concat!("warden/", env!("CARGO_PKG_VERSION"));

/// Address family policy for resolved hostnames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferIp {
    /// IPv4 first, then IPv6.
    #[default]
    PreferIpv4,
    /// IPv6 first, then IPv4.
    PreferIpv6,
    /// IPv4 only.
    OnlyIpv4,
    /// IPv6 only.
    OnlyIpv6,
}

impl PreferIp {
    fn record_order(self) -> &'static [RecordType] {
        match self {
            Self::PreferIpv4 => &[RecordType::A, RecordType::Aaaa],
            Self::PreferIpv6 => &[RecordType::Aaaa, RecordType::A],
            Self::OnlyIpv4 => &[RecordType::A],
            Self::OnlyIpv6 => &[RecordType::Aaaa],
        }
    }
}

/// Inputs for [`Network::new`].
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP connect (and SOCKS5 handshake) timeout.
    /// Default: 10 seconds
    pub tcp_timeout: Duration,

    /// Whole-request timeout for HTTP (DoH and list downloads).
    /// Default: 10 seconds
    pub http_timeout: Duration,

    /// DNS-over-HTTPS resolver address.
    /// Default: `1.1.1.1`
    pub doh_ip: IpAddr,

    /// Upstream SOCKS5 hops: 0 = direct, 1 = single hop, more = round-robin.
    pub proxies: Vec<Url>,

    /// Address family policy.
    pub prefer_ip: PreferIp,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(10),
            doh_ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            proxies: Vec::new(),
            prefer_ip: PreferIp::default(),
        }
    }
}

/// The outbound side of the proxy.
pub struct Network {
    dialer: Arc<dyn Dialer>,
    resolver: Arc<CachingResolver>,
    http: reqwest::Client,
    prefer_ip: PreferIp,
}

impl Network {
    /// Build the dialer, HTTP client and DoH resolver from `config`.
    ///
    /// # Errors
    /// * `ProxyError::Dial` - A proxy URL is unusable.
    /// * `ProxyError::Http` - The HTTP client cannot be built.
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let dialer = make_dialer(DirectDialer::new(config.tcp_timeout), &config.proxies)?;
        let http = make_http_client(config.http_timeout, &config.proxies)?;
        let doh = DohResolver::new(http.clone(), config.doh_ip);
        let resolver = CachingResolver::new(Arc::new(doh));

        Ok(Self::with_parts(
            Arc::new(dialer),
            Arc::new(resolver),
            http,
            config.prefer_ip,
        ))
    }

    /// Assemble from already-built parts.
    pub fn with_parts(
        dialer: Arc<dyn Dialer>,
        resolver: Arc<CachingResolver>,
        http: reqwest::Client,
        prefer_ip: PreferIp,
    ) -> Self {
        Self {
            dialer,
            resolver,
            http,
            prefer_ip,
        }
    }

    /// Shared HTTP client (DoH, list downloads).
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Shared resolver.
    pub fn resolver(&self) -> &Arc<CachingResolver> {
        &self.resolver
    }

    /// Resolve `host` into dial candidates for `network`, in preference order.
    ///
    /// Only record types allowed by both `network` and the prefer-IP policy
    /// are looked up.
    pub async fn resolve(&self, network: NetworkKind, host: &str) -> Vec<IpAddr> {
        let wanted = |record: RecordType| {
            self.prefer_ip.record_order().contains(&record) && family_allowed(network, record)
        };
        let v4 = async {
            if wanted(RecordType::A) {
                self.resolver.lookup_a(host).await
            } else {
                Vec::new()
            }
        };
        let v6 = async {
            if wanted(RecordType::Aaaa) {
                self.resolver.lookup_aaaa(host).await
            } else {
                Vec::new()
            }
        };
        let (v4, v6) = tokio::join!(v4, v6);
        candidates(network, self.prefer_ip, v4, v6)
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("resolver", &self.resolver)
            .field("prefer_ip", &self.prefer_ip)
            .finish()
    }
}

#[async_trait]
impl Dialer for Network {
    async fn dial_with_cancel(
        &self,
        cancel: &CancellationToken,
        network: NetworkKind,
        address: &str,
    ) -> std::result::Result<TcpStream, DialError> {
        let target =
            TargetAddr::parse(address).map_err(|_| DialError::InvalidAddress(address.to_string()))?;

        let (host, port) = match target {
            TargetAddr::Ip(_) => {
                return self.dialer.dial_with_cancel(cancel, network, address).await;
            }
            TargetAddr::Domain(host, port) => (host, port),
        };

        let ips = tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            ips = self.resolve(network, &host) => ips,
        };

        let mut last_error = None;
        for ip in ips {
            let candidate = SocketAddr::new(ip, port).to_string();
            match self.dialer.dial_with_cancel(cancel, network, &candidate).await {
                Ok(stream) => return Ok(stream),
                Err(DialError::Cancelled) => return Err(DialError::Cancelled),
                Err(e) => {
                    debug!(%host, address = %candidate, error = %e, "dial attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(DialError::NoAddresses { host }))
    }
}

fn candidates(
    network: NetworkKind,
    prefer: PreferIp,
    v4: Vec<IpAddr>,
    v6: Vec<IpAddr>,
) -> Vec<IpAddr> {
    let mut out = Vec::with_capacity(v4.len() + v6.len());
    for &record in prefer.record_order() {
        if !family_allowed(network, record) {
            continue;
        }
        match record {
            RecordType::A => out.extend(&v4),
            RecordType::Aaaa => out.extend(&v6),
        }
    }
    out
}

fn family_allowed(network: NetworkKind, record: RecordType) -> bool {
    matches!(
        (network, record),
        (NetworkKind::Tcp, _)
            | (NetworkKind::Tcp4, RecordType::A)
            | (NetworkKind::Tcp6, RecordType::Aaaa)
    )
}

/// HTTP client with timeout, user agent and (optionally) round-robin SOCKS5
/// upstreams.
///
/// # Errors
/// Returns the builder error if TLS initialisation fails.
pub fn make_http_client(timeout: Duration, proxies: &[Url]) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(USER_AGENT);

    if !proxies.is_empty() {
        let hops: Arc<[Url]> = proxies.into();
        let cursor = Arc::new(AtomicUsize::new(0));
        builder = builder.proxy(reqwest::Proxy::custom(move |_target| {
            let idx = cursor.fetch_add(1, Ordering::Relaxed) % hops.len();
            Some(hops[idx].clone())
        }));
    }

    builder.build().map_err(ProxyError::Http)
}
