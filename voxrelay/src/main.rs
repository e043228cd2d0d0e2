mod config;
mod logging;
mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use voxrelay_sfu::{DenyListPolicy, LocalEngine, RoomRegistry, SignalingService};

use crate::config::Config;
use crate::server::AppState;

/// VoxRelay - audio SFU signaling server
#[derive(Parser, Debug)]
#[command(name = "voxrelay")]
#[command(about = "Room admission and media session signaling for an audio SFU", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "VOXRELAY_CONFIG")]
    config: Option<String>,

    /// Listen host, overrides server.host
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overrides server.port
    #[arg(long)]
    port: Option<u16>,

    /// Log level, overrides logging.level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("VoxRelay server starting...");

    // 4. Initialize media engine, registry and signaling
    let engine = Arc::new(LocalEngine::new());
    let registry = Arc::new(RoomRegistry::new(config.sfu.clone(), engine));
    let admission = Arc::new(DenyListPolicy::from(&config.admission));
    info!(
        denied_users = config.admission.denied_users.len(),
        room_denylists = config.admission.room_denylist.len(),
        "Admission policy loaded"
    );
    let signaling = SignalingService::new(Arc::clone(&registry), admission);

    // 5. Start HTTP server with graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router = server::create_router(AppState {
        signaling,
        max_message_size: config.server.max_message_size,
        shutdown: shutdown_rx,
    });

    let http_address = config.http_address();
    let listener = tokio::net::TcpListener::bind(&http_address).await?;
    info!("HTTP server listening on {}", http_address);

    let graceful = async move {
        shutdown_signal().await;
        info!("Shutdown signal received, closing connections...");
        let _ = shutdown_tx.send(true);
    };
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(graceful)
        .await
    {
        error!("HTTP server error: {}", e);
    }

    // 6. Release whatever is left
    let report = registry.shutdown();
    info!(
        transports = report.transports,
        failures = report.failures,
        "VoxRelay server stopped"
    );
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
