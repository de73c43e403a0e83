#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tollgate::server;

#[derive(Parser)]
#[command(name = "tollgate", about = "Request-filtering API gateway: auth, rate limiting, gray release")]
struct Cli {
    /// Path to gateway config file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Proxy listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Admin API listen address (health, metrics, operations)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let threads = server::runtime::worker_threads();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads.count)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
