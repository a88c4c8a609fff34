use std::sync::Arc;

use anyhow::Context;
use docflow_infra::AppConfig;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    info!(?config, "starting docflow");

    let services = Arc::new(docflow_api::app::build_services(config).await?);
    let background = services.start();

    let bind_addr = services.config.bind_addr;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, docflow_api::app::build_app(services))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    background.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested; draining workers");
}
