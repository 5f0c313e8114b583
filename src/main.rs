use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use relay_gateway::config::{default_config_path, load_config};
use relay_gateway::gateway::GatewayService;
use relay_gateway::server::{self, TlsConfig};
use relay_gateway::{keystore, util};

const REGISTRATION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "relay-gateway", version, about = "Gateway for peer-hosted Nostr relays")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    data_dir: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if std::env::var("RUST_LOG").is_err() {
        let level = util::normalize_log_level(&args.log_level)
            .ok_or_else(|| anyhow!("invalid log level: {}", args.log_level))?;
        std::env::set_var("RUST_LOG", level);
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = args.config.unwrap_or_else(default_config_path);
    let mut cfg = load_config(&config_path).map_err(|e| anyhow!("config error ({}): {}", config_path.display(), e))?;
    if let Some(dir) = args.data_dir {
        cfg.data_dir = dir;
    }

    let (secrets, key_source) = keystore::load_or_init(PathBuf::from(&cfg.data_dir).as_path())
        .map_err(|e| anyhow!("keystore error: {}", e))?;
    info!(source = %key_source, data_dir = %cfg.data_dir, "keystore opened");

    let gateway = GatewayService::build(cfg.clone(), &secrets).await?;
    drop(secrets);

    let http = TcpListener::bind(&cfg.bind).await?;
    info!(bind = %cfg.bind, "registration endpoint ready");
    let router = gateway.router();
    tokio::spawn(async move {
        if let Err(err) = axum::serve(http, router).await {
            warn!(error = %err, "registration server stopped");
        }
    });

    let tls = match (non_empty(&cfg.relay_tls_cert_path), non_empty(&cfg.relay_tls_key_path)) {
        (Some(cert_path), Some(key_path)) => Some(TlsConfig { cert_path, key_path }),
        _ => None,
    };
    let _listeners = server::start_listeners(
        non_empty(&cfg.relay_bind),
        non_empty(&cfg.relay_bind_tls),
        tls,
        gateway.session_context(),
    )
    .await?;

    let _sweep = gateway
        .leases()
        .spawn_expiry_sweep(Duration::from_secs(cfg.lease.sweep_interval_secs.max(1)));
    let _gc = gateway.blind_peers().spawn_gc();
    let store = gateway.store().clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REGISTRATION_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "expired registrations purged");
            }
        }
    });

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let wipe = gateway.leases().spawn_shutdown_wipe(async move {
        let _ = stop_rx.await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    let _ = stop_tx.send(());
    if let Some(wipe) = wipe {
        if let Err(err) = wipe.await {
            warn!(error = %err, "lease wipe task failed");
        }
    }
    gateway.shutdown();
    Ok(())
}
