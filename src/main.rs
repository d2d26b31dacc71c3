use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use reckon::server::{start_server, ServerConfig};

#[derive(Parser)]
#[command(name = "reckon")]
#[command(version, about = "Contact identity reconciliation service")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "3000", env = "RECKON_PORT")]
    port: u16,

    /// Path to the SQLite contact database
    #[arg(long, default_value = "reckon.db", env = "RECKON_DB")]
    db_path: PathBuf,

    /// Bind on all interfaces and allow permissive CORS
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reckon=info".into()),
        )
        .init();

    let cli = Cli::parse();
    start_server(ServerConfig {
        port: cli.port,
        db_path: cli.db_path,
        dev_mode: cli.dev,
    })
    .await
}
