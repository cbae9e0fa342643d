mod config;
mod context;
mod serve;
mod sweep;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use crate::config::RemitConfig;

/// Delegated-authority recurring billing engine.
#[derive(Parser)]
#[command(name = "remit", version, about = "Delegated-authority recurring billing engine")]
struct Cli {
    /// Path to remit.toml (optional; env vars can stand alone)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP JSON API server
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// TLS certificate (PEM); requires the `tls` build feature
        #[arg(long, requires = "tls_key")]
        tls_cert: Option<PathBuf>,
        /// TLS private key (PEM)
        #[arg(long, requires = "tls_cert")]
        tls_key: Option<PathBuf>,
    },
    /// Charge every due subscription once and exit
    Sweep,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match RemitConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve {
            port,
            tls_cert,
            tls_key,
        } => serve::start_server(config, port, tls_cert, tls_key).await,
        Commands::Sweep => sweep::run(config).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
