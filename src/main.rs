use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shadowbuild::api::{run_api, ApiState};
use shadowbuild::config::EngineConfig;
use shadowbuild::engine::Engine;
use shadowbuild::executor::toolchain::ProcessToolchain;
use shadowbuild::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "shadowbuild")]
#[command(version)]
#[command(about = "Shadow build orchestration for app preview pipelines")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the build orchestration server
    Server(ServerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Directory for persisted scheduler state and artifacts
    #[arg(long, env = "SHADOWBUILD_STATE_DIR", default_value = "./state")]
    state_dir: PathBuf,

    /// Directory for the compiled-module cache
    #[arg(long, env = "SHADOWBUILD_CACHE_DIR", default_value = "./cache")]
    cache_dir: PathBuf,

    /// Minimum number of warm runners kept per class
    #[arg(long, default_value = "2")]
    warm_floor: usize,

    /// Maximum number of live runners per class
    #[arg(long, default_value = "8")]
    ceiling: usize,

    /// Compiler binary invoked for unit compilation and linking
    #[arg(long, env = "SHADOWBUILD_COMPILER", default_value = "shadowc")]
    compiler: String,

    /// Toolchain version string, part of every cache key
    #[arg(long, default_value = "1.0.0")]
    toolchain_version: String,
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = EngineConfig::default()
        .with_state_dir(args.state_dir.clone())
        .with_cache_dir(args.cache_dir.clone())
        .with_pool_limits(args.warm_floor, args.ceiling);

    let work_dir = args.state_dir.join("work");
    let toolchain = Arc::new(ProcessToolchain::new(
        args.compiler,
        args.toolchain_version,
        work_dir,
    ));

    let shutdown = install_shutdown_handler();
    let engine = Engine::new(cfg, toolchain, shutdown.clone()).await?;
    engine.recover().await?;
    engine.start();

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let api_state = ApiState {
        engine: Arc::clone(&engine),
    };
    tokio::spawn(run_api(addr, api_state));

    tracing::info!(port = args.port, "shadowbuild server running");

    shutdown.cancelled().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
    }

    Ok(())
}
