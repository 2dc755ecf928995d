use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use shipyard::config::PlatformConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(version, about = "Self-hosted deployment platform server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bootstrap the platform and serve HTTP and WebSocket traffic (default)
    Serve {
        /// Port to listen on. Overrides PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Apply pending database migrations and exit
    Migrate,
    /// Provision directories, proxy config, network and managed containers, then exit
    Setup,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    // A missing .env is normal; only the process environment is used then.
    let _ = dotenvy::dotenv();

    let config = match PlatformConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[shipyard] {}", e);
            std::process::exit(1);
        }
    };
    let _log_guard = shipyard::logging::init(&config.log);

    if let Err(e) = run(cli, config).await {
        tracing::error!(error = %format!("{:#}", e), "Main server error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, mut config: PlatformConfig) -> Result<()> {
    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            cmd::cmd_serve(config).await
        }
        Commands::Migrate => cmd::cmd_migrate(&config)
            .await
            .context("Migration failed"),
        Commands::Setup => cmd::cmd_setup(&config).await,
    }
}
