use anyhow::Result;
use clap::{Parser, Subcommand};
use forkline::api::ApiServer;
use forkline::config::AppConfig;
use std::env;
use std::path::PathBuf;

/// Branchable conversation graphs over HTTP
#[derive(Parser)]
#[command(name = "forkline")]
#[command(about = "Branchable, versioned conversation graphs with streamed generation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override server.host
        #[arg(long)]
        host: Option<String>,
        /// Override server.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Load and validate the configuration, then print a summary
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(config: &AppConfig) {
    let default_directive = format!("forkline={}", config.logging.level.to_lowercase());
    let env_override = env::var("RUST_LOG").unwrap_or_default();
    let combined_filter = if env_override.trim().is_empty() {
        default_directive
    } else if env_override.contains("forkline") {
        env_override
    } else {
        format!("{},{}", env_override, default_directive)
    };

    tracing_subscriber::fmt()
        .with_env_filter(combined_filter)
        .with_target(true)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, host, port } => {
            let mut config = AppConfig::resolve(config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            init_tracing(&config);
            tracing::debug!("{}", config.summary());

            let server = ApiServer::from_app_config(&config)?;
            server.run_with_shutdown(shutdown_signal()).await
        }
        Command::CheckConfig { config } => {
            let config = AppConfig::resolve(config.as_deref())?;
            print!("{}", config.summary());
            Ok(())
        }
    }
}
