use std::sync::Arc;

use warden_proxy::{EventStream, IpList, NoopStream, StableBloomFilter};
use warden_settings::WardenConfig;

use super::{build_lists, build_network, load_config};
use crate::cli::CheckArgs;
use crate::error::CliError;

pub async fn check(args: CheckArgs) -> Result<(), CliError> {
    let mut all_ok = true;

    // 1. Config file
    let (path, config) = load_config(args.config.as_deref())?;
    println!("Config: {}", path.display());
    match config.validate() {
        Ok(()) => println!("Config valid: OK"),
        Err(e) => {
            println!("Config valid: FAIL - {e}");
            return Err(CliError::Other("One or more checks failed".to_string()));
        }
    }

    // 2. Listener and upstream path
    println!("Bind: {}", config.bind_to);
    let upstream = match config.network.proxies.len() {
        0 => "direct".to_string(),
        1 => "single SOCKS5 hop".to_string(),
        n => format!("{n} SOCKS5 proxies (round-robin)"),
    };
    println!("Upstream: {upstream}");
    println!("DNS over HTTPS: {}", config.network.doh_ip);

    print!("Network: ");
    let network = match build_network(&config) {
        Ok(network) => {
            println!("OK");
            Some(network)
        }
        Err(e) => {
            println!("FAIL - {e}");
            all_ok = false;
            None
        }
    };

    // 3. Defenses
    print_anti_replay(&config);
    if let Some(network) = network {
        let events: Arc<dyn EventStream> = Arc::new(NoopStream);
        let (blocklist, allowlist) = build_lists(&config, network.http_client(), &events);
        all_ok &= check_list("Blocklist", config.defense.blocklist.enabled, &blocklist).await;
        all_ok &= check_list("Allowlist", config.defense.allowlist.enabled, &allowlist).await;
    }

    if !all_ok {
        return Err(CliError::Other("One or more checks failed".to_string()));
    }

    Ok(())
}

fn print_anti_replay(config: &WardenConfig) {
    let settings = &config.defense.anti_replay;
    if !settings.enabled {
        println!("Anti-replay: disabled");
        return;
    }
    match StableBloomFilter::new(settings.max_size, settings.error_rate) {
        Ok(filter) => println!(
            "Anti-replay: {} entries, {} bits x 2 generations, {} hashes",
            settings.max_size,
            filter.bits_per_generation(),
            filter.hash_count()
        ),
        Err(e) => println!("Anti-replay: FAIL - {e}"),
    }
}

async fn check_list(label: &str, enabled: bool, list: &IpList) -> bool {
    if !enabled {
        println!("{label}: disabled");
        return true;
    }
    match list.refresh().await {
        Ok(size) => {
            println!("{label}: OK ({size} ranges from {} sources)", list.sources().len());
            true
        }
        Err(e) => {
            println!("{label}: FAIL - {e}");
            false
        }
    }
}
