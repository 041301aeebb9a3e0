pub mod check;
pub mod config;
pub mod generate_secret;
pub mod run;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use warden_proxy::{
    AntiReplayCache, EventStream, IpList, ListKind, ListSource, Network, NetworkConfig, NoopCache,
    PreferIp, StableBloomFilter,
};
use warden_settings::{expand_home, ConfigLoader, ListSettings, WardenConfig};

use crate::error::CliError;

/// Resolve and parse the config file. Values are not validated here.
pub fn load_config(explicit: Option<&Path>) -> Result<(PathBuf, WardenConfig), CliError> {
    let path = ConfigLoader::resolve(explicit)?;
    let config = WardenConfig::load(&path)?;
    Ok((path, config))
}

/// Outbound network: DoH-caching resolver over the configured dialer.
pub fn build_network(config: &WardenConfig) -> Result<Network, CliError> {
    let timeout = &config.network.timeout;
    let network_config = NetworkConfig {
        tcp_timeout: timeout.tcp(),
        http_timeout: timeout.http(),
        doh_ip: config.network.doh_ip,
        proxies: config.proxy_urls()?,
        prefer_ip: match config.prefer_ip {
            warden_settings::PreferIp::PreferIpv4 => PreferIp::PreferIpv4,
            warden_settings::PreferIp::PreferIpv6 => PreferIp::PreferIpv6,
            warden_settings::PreferIp::OnlyIpv4 => PreferIp::OnlyIpv4,
            warden_settings::PreferIp::OnlyIpv6 => PreferIp::OnlyIpv6,
        },
    };
    Ok(Network::new(&network_config)?)
}

/// Blocklist and allowlist, reporting their sizes to `events`.
///
/// A disabled blocklist matches nothing; a disabled allowlist matches
/// everything.
pub fn build_lists(
    config: &WardenConfig,
    http: &reqwest::Client,
    events: &Arc<dyn EventStream>,
) -> (IpList, IpList) {
    let build = |settings: &ListSettings, kind: ListKind| {
        IpList::new(
            kind,
            list_sources(&settings.urls),
            http.clone(),
            settings.download_concurrency,
        )
        .report_to(Arc::clone(events))
    };

    let defense = &config.defense;
    let blocklist = if defense.blocklist.enabled {
        build(&defense.blocklist, ListKind::Blocklist)
    } else {
        IpList::noop(ListKind::Blocklist)
    };
    let allowlist = if defense.allowlist.enabled {
        build(&defense.allowlist, ListKind::Allowlist)
    } else {
        IpList::allow_all().report_to(Arc::clone(events))
    };
    (blocklist, allowlist)
}

fn list_sources(urls: &[String]) -> Vec<ListSource> {
    urls.iter()
        .map(|entry| match ListSource::parse(entry) {
            ListSource::File(_) => ListSource::File(expand_home(entry)),
            remote => remote,
        })
        .collect()
}

/// Stable Bloom filter when enabled, otherwise a cache that never matches.
pub fn build_anti_replay(config: &WardenConfig) -> Result<Arc<dyn AntiReplayCache>, CliError> {
    let settings = &config.defense.anti_replay;
    if !settings.enabled {
        return Ok(Arc::new(NoopCache));
    }
    let filter = StableBloomFilter::new(settings.max_size, settings.error_rate)?;
    Ok(Arc::new(filter))
}
