//! Relay hub entry point

mod cli;

use crate::cli::{load_rules, Cli, Commands, ServeArgs};
use anyhow::Result;
use clap::Parser;
use relayhub::RelayServer;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Check { rules } => {
            let rules = load_rules(&rules)?;
            for rule in &rules {
                println!("{}  {} -> {}", rule.id, rule.stream, rule.destination);
            }
            println!("{} rule(s) OK", rules.len());
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.to_config()?;
    let startup_rules = match &args.rules {
        Some(path) => load_rules(path)?,
        None => Vec::new(),
    };

    let shutdown = CancellationToken::new();
    let server = RelayServer::start(config, shutdown.clone()).await?;

    if !startup_rules.is_empty() {
        let count = server.apply_rules(startup_rules).await?;
        info!(count, "Startup rules applied");
    }

    let signals = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping server");
        signals.cancel();
    });

    server.serve().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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
}
