//! Node agent binary
//!
//! Wires the panel client, the in-process data plane and the certificate
//! renewer into a controller, then supervises it until a shutdown signal.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use std::sync::Arc;

use server_node_r::business::{
    CommandCertRenewer, Controller, PanelClient, PanelConfig, RestartSignal,
};
use server_node_r::config::{CliArgs, NodeOptions};
use server_node_r::core::CertRenewer;
use server_node_r::dataplane::{MemoryDataPlane, MemoryLimiter};
use server_node_r::logger::{self, log};

/// Resolves with the name of the first termination signal received
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM")?;

        tokio::select! {
            _ = sigint.recv() => Ok("SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
        Ok("ctrl-c")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(&cli.log_mode);

    log::info!(
        api_host = %cli.api_host,
        node = cli.node,
        "Starting node agent"
    );

    let options = NodeOptions::load(&cli)?;

    // The live registry outlives controller restarts
    let data_plane = Arc::new(MemoryDataPlane::new());
    let limiter = Arc::new(MemoryLimiter::new());
    let cert_renewer: Option<Arc<dyn CertRenewer>> = CommandCertRenewer::from_cli(&cli)
        .map(|renewer| Arc::new(renewer) as Arc<dyn CertRenewer>);
    if cert_renewer.is_none() {
        log::info!("No cert_email set, automatic certificate renewal disabled");
    }
    let restart = RestartSignal::new();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        // A fresh client per generation so startup never sees a stale ETag
        let panel = Arc::new(PanelClient::new(PanelConfig::from_cli(&cli))?);
        let mut builder = Controller::builder()
            .panel(panel)
            .data_plane(data_plane.clone())
            .limiter(limiter.clone())
            .restart(Arc::new(restart.clone()))
            .options(options.clone());
        if let Some(renewer) = &cert_renewer {
            builder = builder.cert_renewer(Arc::clone(renewer));
        }

        let mut controller = builder.build()?;
        controller.start().await?;

        tokio::select! {
            signal = &mut shutdown => {
                let signal = signal?;
                log::info!(signal = signal, "Shutdown signal received, stopping...");
                controller.close().await;
                return Ok(());
            }
            _ = restart.requested() => {
                log::warn!("Restarting node controller");
                controller.close().await;
            }
        }
    }
}
