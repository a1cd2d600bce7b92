use axum_server::Handle;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pd_sidecar::config::{Args, ProxyConfig};
use pd_sidecar::logging;
use pd_sidecar::server::ProxyServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args = Args::parse();
    let config = ProxyConfig::from_args(args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        connector = ?config.connector,
        "sidecar starting"
    );
    if config.enable_ssrf_protection {
        info!(
            namespace = %config.inference_pool_namespace,
            pool = %config.inference_pool_name,
            "SSRF protection enabled"
        );
    }

    let server = ProxyServer::new(config)?;

    let handle = Handle::new();
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    server.start(handle, shutdown).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("received terminate signal, starting graceful shutdown");
        },
    }
}
