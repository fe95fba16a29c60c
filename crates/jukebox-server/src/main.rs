use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use jukebox_server::startup::{self, Overrides};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    " ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "jukebox-server", version = VERSION)]
struct Args {
    /// HTTP bind address, e.g. 127.0.0.1:8080
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,
    /// Cache directory (also holds the session snapshot)
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Optional server config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,actix_web=info,jukebox_server=info")
        }))
        .init();

    startup::run(Overrides {
        config: args.config,
        bind: args.bind,
        cache_dir: args.cache_dir,
    })
    .await
}
