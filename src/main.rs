//! sftpd: serve SFTP over SSH

use clap::{Parser, Subcommand};
use sftpd::{Server, ServerConfig, SftpEngine};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sftpd")]
#[command(about = "start a sftpd server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// run in the foreground
    Foreground {
        /// the port to bind to
        #[arg(short, long, env = "SFTPD_PORT", default_value_t = 22)]
        port: u16,

        /// Keep accepting connections after the first one ends
        #[arg(long)]
        keep_running: bool,

        /// Concurrent connections allowed with --keep-running
        #[arg(long, default_value_t = 16, requires = "keep_running")]
        max_connections: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sftpd=info")),
        )
        .init();

    let result = match cli.command {
        Command::Foreground {
            port,
            keep_running,
            max_connections,
        } => {
            let config = ServerConfig::new()
                .port(port)
                .keep_running(keep_running)
                .max_connections(max_connections);

            Server::new(SftpEngine::current_dir())
                .config(config)
                .run()
                .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(1)
        }
    }
}
