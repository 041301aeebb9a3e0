//! Caching DNS resolver with DNS-over-HTTPS upstream.
//!
//! Dialing a hostname goes through [`CachingResolver`], which answers from
//! an in-memory cache while an entry is younger than [`DNS_CACHE_TTL`] and
//! otherwise performs a live lookup through a [`Resolve`] backend.
//!
//! # Resolution Flow
//!
//! ```text
//! lookup_a("example.com")
//!      |
//!      v
//! cache[(host, A)] fresh? --yes--> return cached addresses
//!      |
//!      no
//!      v
//! Resolve::lookup (DoH JSON query)
//!      |
//!      +-- ok    --> replace cache entry, return addresses
//!      +-- error --> return empty, cache untouched
//! ```
//!
//! A failed lookup never serves a stale entry; the next call simply tries
//! again.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a successful resolution is served from cache.
pub const DNS_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// DNS record type requested from a resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// IPv4 address record.
    A,
    /// IPv6 address record.
    Aaaa,
}

impl RecordType {
    /// Numeric RR type as used on the wire and in DoH JSON answers.
    pub fn code(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Aaaa => 28,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live name resolution backend.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve `host` to addresses of the given record type.
    async fn lookup(&self, host: &str, record: RecordType) -> io::Result<Vec<IpAddr>>;
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// DNS-over-HTTPS resolver using the JSON API (`application/dns-json`).
#[derive(Debug, Clone)]
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl DohResolver {
    /// Resolver querying `https://<doh_ip>/dns-query`.
    pub fn new(client: reqwest::Client, doh_ip: IpAddr) -> Self {
        let endpoint = match doh_ip {
            IpAddr::V4(ip) => format!("https://{ip}/dns-query"),
            IpAddr::V6(ip) => format!("https://[{ip}]/dns-query"),
        };
        Self::with_endpoint(client, endpoint)
    }

    /// Resolver querying an explicit endpoint URL.
    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// The endpoint queries are sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Resolve for DohResolver {
    async fn lookup(&self, host: &str, record: RecordType) -> io::Result<Vec<IpAddr>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("name", host), ("type", record.as_str())])
            .header(reqwest::header::ACCEPT, "application/dns-json")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(io::Error::other)?;

        let body: DohResponse = response.json().await.map_err(io::Error::other)?;
        if body.status != 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host}: DNS status {}", body.status),
            ));
        }

        Ok(answers_of(body, record))
    }
}

fn answers_of(body: DohResponse, record: RecordType) -> Vec<IpAddr> {
    body.answer
        .unwrap_or_default()
        .into_iter()
        .filter(|a| a.record_type == record.code())
        .filter_map(|a| a.data.parse::<IpAddr>().ok())
        .collect()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    addresses: Vec<IpAddr>,
    created_at: Instant,
}

/// Resolver front-end with a per-(host, record type) cache.
pub struct CachingResolver {
    backend: Arc<dyn Resolve>,
    entries: RwLock<HashMap<(String, RecordType), CacheEntry>>,
    ttl: Duration,
}

impl CachingResolver {
    /// Cache lookups from `backend` for [`DNS_CACHE_TTL`].
    pub fn new(backend: Arc<dyn Resolve>) -> Self {
        Self::with_ttl(backend, DNS_CACHE_TTL)
    }

    /// Cache lookups from `backend` for `ttl`.
    pub fn with_ttl(backend: Arc<dyn Resolve>, ttl: Duration) -> Self {
        Self {
            backend,
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// IPv4 addresses of `host`; empty on failure.
    pub async fn lookup_a(&self, host: &str) -> Vec<IpAddr> {
        self.lookup(host, RecordType::A).await
    }

    /// IPv6 addresses of `host`; empty on failure.
    pub async fn lookup_aaaa(&self, host: &str) -> Vec<IpAddr> {
        self.lookup(host, RecordType::Aaaa).await
    }

    /// Cached or live addresses of `host`; empty on failure.
    pub async fn lookup(&self, host: &str, record: RecordType) -> Vec<IpAddr> {
        let key = (host.to_ascii_lowercase(), record);

        if let Some(addresses) = self.fresh(&key) {
            return addresses;
        }

        match self.backend.lookup(host, record).await {
            Ok(addresses) => {
                // Use unwrap_or_else to recover from poisoned lock - the data is still valid
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                entries.insert(
                    key,
                    CacheEntry {
                        addresses: addresses.clone(),
                        created_at: Instant::now(),
                    },
                );
                addresses
            }
            Err(e) => {
                debug!(%host, %record, error = %e, "DNS lookup failed");
                Vec::new()
            }
        }
    }

    /// Number of cached entries, fresh or stale.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true if nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh(&self, key: &(String, RecordType)) -> Option<Vec<IpAddr>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| entry.created_at.elapsed() < self.ttl)
            .map(|entry| entry.addresses.clone())
    }
}

impl fmt::Debug for CachingResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingResolver")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
