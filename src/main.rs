//! signalrtc-core server binary

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use signalrtc_core::{config::ServerConfig, host::HostService, utils::setup_logging, Result};

#[derive(Parser)]
#[command(name = "signalrtc-server")]
#[command(about = "SIP signalling server: registrar, B2BUA, abuse filter, WebRTC relay")]
#[command(version = signalrtc_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default)
    Start,
    /// Validate a configuration file and exit
    ValidateConfig,
    /// Print the default configuration as TOML
    GenerateConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_configuration(&cli)?;
    setup_logging(&config.logging)?;

    info!("starting {} v{}", signalrtc_core::NAME, signalrtc_core::VERSION);

    match &cli.command {
        Some(Commands::Start) | None => run_server(config).await,
        Some(Commands::ValidateConfig) => validate_configuration(&config),
        Some(Commands::GenerateConfig { output }) => generate_default_config(output.clone()),
    }
}

fn load_configuration(cli: &Cli) -> Result<ServerConfig> {
    let config = if let Some(path) = &cli.config {
        info!(path = %path.display(), "loading configuration from file");
        ServerConfig::load_from_file(path)?
    } else {
        info!("no configuration file specified, trying environment variables");
        ServerConfig::load_from_env().unwrap_or_else(|_| {
            info!("no environment configuration found, using defaults");
            ServerConfig::default_config()
        })
    };
    config.validate()?;
    Ok(config)
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let mut host = HostService::boot(config).await?;
    host.start_http_relay().await?;

    match signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "unable to listen for shutdown signal"),
    }

    host.stop().await;
    info!("shutdown complete");
    Ok(())
}

fn validate_configuration(config: &ServerConfig) -> Result<()> {
    config.validate()?;
    println!("Configuration is valid");
    println!("  SIP domain: {}", config.general.sip_domain);
    println!("  SIP listen port: {}", config.transport.sip_listen_port);
    println!("  WebRTC relay: {}", config.webrtc_relay.listen_addr);
    Ok(())
}

fn generate_default_config(output: Option<PathBuf>) -> Result<()> {
    let config = ServerConfig::default_config();
    let toml_text = toml::to_string_pretty(&config)
        .map_err(|e| signalrtc_core::Error::internal(format!("failed to serialize config: {e}")))?;
    match output {
        Some(path) => {
            std::fs::write(&path, toml_text)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{toml_text}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = ServerConfig::default_config();
        assert!(validate_configuration(&config).is_ok());
    }

    #[test]
    fn generates_config_to_stdout() {
        assert!(generate_default_config(None).is_ok());
    }
}
