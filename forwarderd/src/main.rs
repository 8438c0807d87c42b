use anyhow::Result;
use clap::Parser;
use tokio::signal;

mod config;
mod logger;

use config::Cli;
use forwarder::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    logger::setup_logging(&cli.log_dir, &cli.log_level)?;

    let endpoints = config::load_endpoints(&cli)?;
    log::info!("loaded {} endpoint(s) from {}", endpoints.len(), cli.config_path.display());

    let orchestrator = Orchestrator::init(endpoints, None)?;
    orchestrator.start().await?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate()).unwrap();
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }

    orchestrator.stop(cli.shutdown_timeout()).await?;
    log::info!("Shutdown complete.");
    Ok(())
}
