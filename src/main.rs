use frontgate::config::Config;
use frontgate::proxy::ProxyState;
use frontgate::server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::load()?;
    let listen_addr = cfg.listen_addr.clone();
    let proxy = ProxyState::from_config(cfg)?;

    spawn_reload_on_hangup(proxy.clone());

    tokio::select! {
        res = server::listener::run(&listen_addr, proxy) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}

/// Reloads configuration on SIGHUP. The listen address is not rebound.
#[cfg(unix)]
fn spawn_reload_on_hangup(proxy: ProxyState) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                tracing::warn!(error = %e, "SIGHUP handler unavailable; reload disabled");
                return;
            }
        };

        while hangup.recv().await.is_some() {
            match proxy.reload() {
                Ok(()) => tracing::info!("Configuration reloaded"),
                Err(e) => tracing::warn!(error = %e, "Reload failed; keeping previous configuration"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_proxy: ProxyState) {}
