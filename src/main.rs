#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use upstream_router::server;

#[derive(Parser)]
#[command(name = "upstream-router", about = "Failure-aware round robin reverse proxy")]
struct Cli {
    /// Path to router config file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Proxy listen address, overrides `app.listen`
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (health/ready/metrics/pools), overrides `app.admin_listen`
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
