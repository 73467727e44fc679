use servicegate::config::Config;
use servicegate::pool::{ConnectionPool, PoolConfig};
use servicegate::proxy::GatewayServer;
use servicegate::registry::StaticRegistry;
use servicegate::session::SessionContext;
use servicegate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("servicegate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gateway.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Built once, then shared read-only by every session
    let registry = Arc::new(StaticRegistry::from_config(&config.services));
    let services = registry.service_names();
    if services.is_empty() {
        warn!("No services registered; every request will be answered with 404");
    } else {
        info!(services = ?services, "Service registry initialized");
    }

    let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.client)));
    let context = Arc::new(SessionContext::from_config(&config, registry, pool.clone())?);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GatewayServer::new(addr, context, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    let stats = pool.stats();
    info!(
        total_requests = stats.get_total_requests(),
        failed_requests = stats.get_failed_requests(),
        "Gateway stopped"
    );

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        prefix = %config.server.gateway_prefix,
        backend_host = %config.server.backend_host_header,
        pump_buffer_chunks = config.server.pump_buffer_chunks,
        "Server configuration"
    );
    info!(
        connect_timeout_ms = config.client.connect_timeout_ms,
        pool_max_idle = config.client.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.client.pool_idle_timeout_secs,
        keep_alive = config.client.keep_alive,
        "Backend client settings"
    );
}
