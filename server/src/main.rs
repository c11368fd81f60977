//! Depot server entry point.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use depot_server::config::Config;
use depot_server::error::ServerResult;
use depot_server::gpg;
use depot_server::web::{self, AppState};

#[derive(Parser)]
#[command(
    name = "depot-server",
    version,
    about = "Package upload and repository build service"
)]
struct Args {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "BIND", default_value = "127.0.0.1:3000")]
    bind: String,
}

#[tokio::main]
async fn main() -> ServerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_env();
    config.probe_tools().await;
    info!(
        "upload APIs enabled: deb={} rpm={}",
        config.upload.enabled.deb, config.upload.enabled.rpm
    );

    web::prepare_layout(&config).await?;
    gpg::init(&config).await;

    web::serve(AppState::new(config), &args.bind).await
}
