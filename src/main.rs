use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use shipwright::config::AppConfig;
use shipwright::db::DbHandle;
use shipwright::orchestrator;

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version, about = "Job orchestration for AI coding engines")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "shipwright.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration service
    Serve {
        /// Override the configured listen port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Initialize the database and exit
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shipwright=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            orchestrator::run(config).await?;
        }
        Commands::Init => {
            let path = PathBuf::from(&config.database.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            DbHandle::open(&path)?;
            println!("Database initialized at {}", path.display());
        }
    }
    Ok(())
}
