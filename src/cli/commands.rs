use anyhow::{Context, Result};
use tracing::info;

use crate::config::AppConfig;
use crate::server::ProxyServer;

use super::config::check_config;
use super::{cert, template};

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config } => {
            run_proxy(config).await?;
        }
        Commands::Check { config, format } => {
            check_config(config, format)?;
        }
        Commands::Ca {
            cert_out,
            key_out,
            common_name,
        } => {
            cert::generate_ca_files(cert_out, key_out, common_name)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
    }

    Ok(())
}

/// Run the proxy front end until Ctrl-C
async fn run_proxy(config: &str) -> Result<()> {
    info!("Loading configuration from: {}", config);
    let app_config = AppConfig::load(config)?;

    let server = ProxyServer::from_config(&app_config)?;
    server.start(&app_config.listeners).await?;
    info!(
        "split-tunnel started with {} listener(s) and {} backend(s)",
        server.local_addrs().len(),
        server.registry().len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, shutting down");

    server.stop();
    server.wait().await;

    Ok(())
}
