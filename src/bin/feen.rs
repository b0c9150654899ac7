//! Feen gateway CLI binary.
//!
//! # Commands
//!
//! - `serve` - Start the gateway
//! - `config-check` - Validate a configuration file and exit
//! - `session-token` - Mint an admin session bearer for a user id

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use feen::{server, Config, VERSION};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "feen")]
#[command(version = VERSION)]
#[command(about = "Feen - API-key vault and proxy gateway", long_about = None)]
struct Cli {
    /// Configuration file (TOML); FEEN_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Listen port override
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate the configuration and exit
    ConfigCheck,

    /// Mint an admin session bearer for a user id
    SessionToken {
        /// User id the bearer authenticates
        user_id: Uuid,

        /// Validity in seconds
        #[arg(long, default_value = "3600")]
        ttl: i64,
    },
}

fn load_config(path: Option<&PathBuf>) -> feen::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    Ok(config.apply_env())
}

#[tokio::main]
async fn main() -> feen::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feen=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            server::run(config).await
        }
        Commands::ConfigCheck => {
            config.validate()?;
            println!("configuration ok");
            Ok(())
        }
        Commands::SessionToken { user_id, ttl } => {
            config.validate()?;
            let token =
                server::mint_session_token(&config.vault.session_secret, user_id, ttl);
            println!("{token}");
            Ok(())
        }
    }
}
