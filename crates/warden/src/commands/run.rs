use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use warden_proxy::{
    initial_refresh, EventStream, LogStream, PreambleSniffer, Proxy, ProxyError, ProxyOpts,
};
use warden_settings::WardenConfig;

use super::{build_anti_replay, build_lists, build_network};
use crate::cli::RunArgs;
use crate::error::CliError;

pub async fn run(args: RunArgs, path: PathBuf, mut config: WardenConfig) -> Result<(), CliError> {
    // 1. Validate: configuration errors stop here, before anything binds.
    if let Some(bind) = args.bind {
        config.bind_to = bind;
    }
    config.validate()?;
    info!(config = %path.display(), "configuration loaded");

    // 2. Outbound network, events, access lists (both loaded before serving).
    let network = Arc::new(build_network(&config)?);
    let events: Arc<dyn EventStream> = Arc::new(LogStream);
    let (blocklist, allowlist) = build_lists(&config, network.http_client(), &events);
    initial_refresh(&blocklist, &allowlist).await?;

    // 3. Pipeline.
    let sniffer = PreambleSniffer::new(config.secret_bytes()?, config.tolerate_time_skewness())
        .map_err(ProxyError::from)?;
    let timeout = &config.network.timeout;
    let mut opts = ProxyOpts::new(network, Arc::new(sniffer));
    opts.anti_replay = build_anti_replay(&config)?;
    opts.blocklist = Arc::new(blocklist);
    opts.allowlist = Arc::new(allowlist);
    opts.event_stream = events;
    opts.concurrency = config.concurrency;
    opts.domain_fronting = config.domain_fronting.clone();
    opts.idle_timeout = timeout.idle();
    opts.handshake_timeout = timeout.handshake();
    opts.blocklist_update = config.defense.blocklist.update_each();
    opts.allowlist_update = config.defense.allowlist.update_each();
    let proxy = Arc::new(Proxy::new(opts)?);

    // 4. Serve until a signal arrives.
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyError::Bind { addr, source })?;
    let serving = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.serve(listener).await })
    };

    shutdown_signal().await?;
    info!("signal received, shutting down");
    proxy.shutdown().await;

    serving
        .await
        .map_err(|e| CliError::Other(format!("Proxy task failed: {e}")))??;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<(), CliError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<(), CliError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
