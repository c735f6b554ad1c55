//! Stargate - remote application session host.
//!
//! Usage:
//!   stargate serve [--port 8001] [--config config.toml] [--public public]

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

mod audio;
mod auth;
mod config;
mod error;
mod http_server;
mod manager;
mod protocol;
mod relay;
mod state;
mod util;

#[cfg(target_os = "linux")]
use clap::{Parser, Subcommand};
#[cfg(target_os = "linux")]
use std::path::PathBuf;

#[cfg(target_os = "linux")]
#[derive(Parser, Debug)]
#[command(name = "stargate")]
#[command(about = "Remote application session host")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file; created with defaults when missing
    #[arg(long, env = "STARGATE_CONFIG", default_value = "config.toml", global = true)]
    config: PathBuf,
}

#[cfg(target_os = "linux")]
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value = "8001")]
        port: u16,

        /// Directory of static frontend files
        #[arg(long, default_value = "public")]
        public: PathBuf,
    },
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() {
    use std::process::exit;
    use tracing::error;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    match args.command {
        Some(Commands::Serve { port, public }) => {
            let config = match config::Config::load(&args.config) {
                Ok(config) => config,
                Err(e) => {
                    error!(path = %args.config.display(), error = %e, "Failed to load config");
                    exit(1);
                }
            };

            let state = state::AppState::local(config);
            state.manager.start().await;
            state.relay.spawn_forwarding();

            if let Err(e) = http_server::run_server(port, &public, state).await {
                error!(error = %e, "HTTP server failed");
                exit(1);
            }
        }
        None => {
            eprintln!("Error: Use 'serve' subcommand");
            exit(1);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("This program only works on Linux.");
    std::process::exit(1);
}
