//! TOML configuration for the warden forward proxy.
//!
//! Every key is optional; missing keys take the defaults documented on each
//! field. Parsing only checks shape; [`WardenConfig::validate`] checks values
//! and must pass before the proxy is built.
//!
//! # Example
//!
//! ```no_run
//! use warden_settings::{ConfigLoader, WardenConfig};
//!
//! let path = ConfigLoader::resolve(None).unwrap();
//! let config = WardenConfig::load(&path).unwrap();
//! config.validate().unwrap();
//! println!("{}", config.bind_to);
//! ```

mod loader;

pub use loader::{ConfigLoader, CONFIG_FILE_NAME};

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Minimum secret length in bytes.
pub const MIN_SECRET_BYTES: usize = 16;

/// Largest anti-replay generation accepted, in bits (1 GiB).
pub const MAX_ANTI_REPLAY_GENERATION_BITS: u64 = 8 << 30;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value is present but unusable.
    #[error("Invalid `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    /// No config file in any searched location.
    #[error("No config file found (searched: {searched})")]
    NotFound { searched: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Address family policy for resolved targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreferIp {
    /// Try IPv4 first, then IPv6.
    #[default]
    PreferIpv4,
    /// Try IPv6 first, then IPv4.
    PreferIpv6,
    /// IPv4 only.
    OnlyIpv4,
    /// IPv6 only.
    OnlyIpv6,
}

/// `[defense.anti-replay]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct AntiReplaySettings {
    /// Default: false
    pub enabled: bool,

    /// Fingerprints remembered per generation.
    /// Default: 1048576
    pub max_size: usize,

    /// Target false-positive rate.
    /// Default: 0.001
    pub error_rate: f64,
}

impl AntiReplaySettings {
    /// Bits one filter generation needs for `max-size` entries, each
    /// generation holding half of `error-rate`.
    pub fn generation_bits(&self) -> f64 {
        let n = self.max_size as f64;
        let p = self.error_rate / 2.0;
        (-n * p.ln() / (std::f64::consts::LN_2 * std::f64::consts::LN_2))
            .ceil()
            .max(64.0)
    }
}

impl Default for AntiReplaySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: 1024 * 1024,
            error_rate: 0.001,
        }
    }
}

/// `[defense.blocklist]` / `[defense.allowlist]` sections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ListSettings {
    /// Default: false
    pub enabled: bool,

    /// `http(s)://` URLs or local file paths.
    pub urls: Vec<String>,

    /// Parallel downloads during a refresh.
    /// Default: 1
    pub download_concurrency: usize,

    /// Refresh interval in seconds.
    /// Default: 86400
    pub update_each_secs: u64,
}

impl Default for ListSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            urls: Vec::new(),
            download_concurrency: 1,
            update_each_secs: 24 * 60 * 60,
        }
    }
}

impl ListSettings {
    pub fn update_each(&self) -> Duration {
        Duration::from_secs(self.update_each_secs)
    }

    fn validate(&self, section: &str) -> Result<(), SettingsError> {
        if !self.enabled {
            return Ok(());
        }
        let field = |name: &str| format!("defense.{section}.{name}");
        if self.urls.is_empty() {
            return Err(invalid(&field("urls"), "an enabled list needs at least one source"));
        }
        for entry in &self.urls {
            check_list_source(entry).map_err(|reason| invalid(&field("urls"), reason))?;
        }
        if self.download_concurrency == 0 {
            return Err(invalid(&field("download-concurrency"), "must be positive"));
        }
        if self.update_each_secs == 0 {
            return Err(invalid(&field("update-each-secs"), "must be positive"));
        }
        Ok(())
    }
}

fn check_list_source(entry: &str) -> Result<(), String> {
    if entry.trim().is_empty() {
        return Err("empty source".to_string());
    }
    if !entry.contains("://") {
        return Ok(());
    }
    let url = Url::parse(entry).map_err(|e| format!("{entry}: {e}"))?;
    match url.scheme() {
        "http" | "https" if url.host().is_some() => Ok(()),
        "http" | "https" => Err(format!("{entry}: missing host")),
        other => Err(format!("{entry}: unsupported scheme {other}")),
    }
}

/// `[defense]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DefenseSettings {
    pub anti_replay: AntiReplaySettings,
    pub blocklist: ListSettings,
    pub allowlist: ListSettings,
}

/// `[network.timeout]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct TimeoutSettings {
    /// TCP connect and SOCKS5 handshake timeout.
    /// Default: 10
    pub tcp_secs: u64,

    /// HTTP request timeout (DoH, list downloads).
    /// Default: 10
    pub http_secs: u64,

    /// Relay idle timeout.
    /// Default: 60
    pub idle_secs: u64,

    /// Time a client has to send its handshake.
    /// Default: 10
    pub handshake_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            tcp_secs: 10,
            http_secs: 10,
            idle_secs: 60,
            handshake_secs: 10,
        }
    }
}

/// `[network]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct NetworkSettings {
    /// DNS-over-HTTPS resolver address.
    /// Default: `1.1.1.1`
    pub doh_ip: IpAddr,

    /// Upstream SOCKS5 proxies, `socks5://[user:pass@]host:port`.
    /// None: dial directly. One: single hop. More: round-robin.
    pub proxies: Vec<String>,

    pub timeout: TimeoutSettings,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            doh_ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            proxies: Vec::new(),
            timeout: TimeoutSettings::default(),
        }
    }
}

/// Top-level configuration, corresponding to `warden.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct WardenConfig {
    /// Raise the default log level to debug.
    pub debug: bool,

    /// Shared secret, hex encoded. Required.
    pub secret: String,

    /// Listen address.
    /// Default: `0.0.0.0:3128`
    pub bind_to: String,

    /// Maximum in-flight connections.
    /// Default: 8192
    pub concurrency: usize,

    pub prefer_ip: PreferIp,

    /// `host:port` receiving unrecognised clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_fronting: Option<String>,

    /// Accepted handshake clock difference in seconds.
    /// Default: 5
    pub tolerate_time_skewness_secs: u64,

    pub defense: DefenseSettings,

    pub network: NetworkSettings,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            debug: false,
            secret: String::new(),
            bind_to: "0.0.0.0:3128".to_string(),
            concurrency: 8192,
            prefer_ip: PreferIp::default(),
            domain_fronting: None,
            tolerate_time_skewness_secs: 5,
            defense: DefenseSettings::default(),
            network: NetworkSettings::default(),
        }
    }
}

impl WardenConfig {
    /// Parse a `WardenConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `WardenConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check every value.
    ///
    /// # Errors
    /// The first `SettingsError::Invalid` found.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.secret_bytes()?;
        self.bind_addr()?;
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be positive"));
        }
        if let Some(fronting) = &self.domain_fronting {
            check_host_port(fronting).map_err(|reason| invalid("domain-fronting", reason))?;
        }

        let replay = &self.defense.anti_replay;
        if replay.enabled {
            if replay.max_size == 0 {
                return Err(invalid("defense.anti-replay.max-size", "must be positive"));
            }
            if !(replay.error_rate > 0.0 && replay.error_rate < 1.0) {
                return Err(invalid(
                    "defense.anti-replay.error-rate",
                    format!("must be in (0, 1), got {}", replay.error_rate),
                ));
            }
            let bits = replay.generation_bits();
            if !bits.is_finite() || bits > MAX_ANTI_REPLAY_GENERATION_BITS as f64 {
                return Err(invalid(
                    "defense.anti-replay.max-size",
                    format!(
                        "{} entries at error-rate {} need more than {} MiB per generation",
                        replay.max_size,
                        replay.error_rate,
                        MAX_ANTI_REPLAY_GENERATION_BITS / 8 / 1024 / 1024
                    ),
                ));
            }
        }
        self.defense.blocklist.validate("blocklist")?;
        self.defense.allowlist.validate("allowlist")?;

        self.proxy_urls()?;
        let timeout = &self.network.timeout;
        for (name, secs) in [
            ("network.timeout.tcp-secs", timeout.tcp_secs),
            ("network.timeout.http-secs", timeout.http_secs),
            ("network.timeout.idle-secs", timeout.idle_secs),
            ("network.timeout.handshake-secs", timeout.handshake_secs),
        ] {
            if secs == 0 {
                return Err(invalid(name, "must be positive"));
            }
        }
        Ok(())
    }

    /// Decoded shared secret.
    ///
    /// # Errors
    /// `SettingsError::Invalid` if missing, not hex, or too short.
    pub fn secret_bytes(&self) -> Result<Vec<u8>, SettingsError> {
        if self.secret.is_empty() {
            return Err(invalid("secret", "required"));
        }
        let bytes = hex::decode(self.secret.trim()).map_err(|e| invalid("secret", e.to_string()))?;
        if bytes.len() < MIN_SECRET_BYTES {
            return Err(invalid(
                "secret",
                format!("must be at least {MIN_SECRET_BYTES} bytes, got {}", bytes.len()),
            ));
        }
        Ok(bytes)
    }

    /// Parsed listen address.
    ///
    /// # Errors
    /// `SettingsError::Invalid` if `bind-to` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, SettingsError> {
        self.bind_to
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                invalid("bind-to", format!("{}: {e}", self.bind_to))
            })
    }

    /// Parsed upstream proxy URLs.
    ///
    /// # Errors
    /// `SettingsError::Invalid` for a URL that is not `socks5://host:port`.
    pub fn proxy_urls(&self) -> Result<Vec<Url>, SettingsError> {
        self.network
            .proxies
            .iter()
            .map(|raw| {
                let url = Url::parse(raw)
                    .map_err(|e| invalid("network.proxies", format!("{raw}: {e}")))?;
                if url.scheme() != "socks5" {
                    return Err(invalid(
                        "network.proxies",
                        format!("{raw}: unsupported scheme {}", url.scheme()),
                    ));
                }
                if url.host_str().map_or(true, str::is_empty) || url.port().is_none() {
                    return Err(invalid(
                        "network.proxies",
                        format!("{raw}: host and port required"),
                    ));
                }
                Ok(url)
            })
            .collect()
    }

    pub fn tolerate_time_skewness(&self) -> Duration {
        Duration::from_secs(self.tolerate_time_skewness_secs)
    }
}

impl TimeoutSettings {
    pub fn tcp(&self) -> Duration {
        Duration::from_secs(self.tcp_secs)
    }

    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }
}

fn check_host_port(value: &str) -> Result<(), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("{value}: expected host:port"))?;
    if host.trim_start_matches('[').trim_end_matches(']').is_empty() {
        return Err(format!("{value}: missing host"));
    }
    port.parse::<u16>()
        .map(|_| ())
        .map_err(|_| format!("{value}: invalid port"))
}

/// Resolve `~/` in list paths to the user's home directory.
pub fn expand_home(entry: &str) -> PathBuf {
    match entry.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(entry)),
        None => PathBuf::from(entry),
    }
}
